//! Authenticated callers, as reported by the identity collaborator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PartyId;

/// Bearer credential presented by a caller. Opaque to CarryLink.
///
/// `Debug` is redacted so credentials never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Platform-level role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    /// Regular marketplace user (carrier or sender, depending on the match).
    Member,
    /// Trust & safety staff allowed to resolve disputes.
    Arbiter,
}

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub party_id: PartyId,
    pub role: PrincipalRole,
}

impl Principal {
    #[must_use]
    pub fn member(party_id: PartyId) -> Self {
        Self {
            party_id,
            role: PrincipalRole::Member,
        }
    }

    #[must_use]
    pub fn arbiter(party_id: PartyId) -> Self {
        Self {
            party_id,
            role: PrincipalRole::Arbiter,
        }
    }

    #[must_use]
    pub fn is_arbiter(&self) -> bool {
        self.role == PrincipalRole::Arbiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_debug_is_redacted() {
        let token = AuthToken::new("secret-bearer");
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn principal_roles() {
        let p = PartyId::new();
        assert!(!Principal::member(p).is_arbiter());
        assert!(Principal::arbiter(p).is_arbiter());
    }
}
