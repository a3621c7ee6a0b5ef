//! Identity collaborator: turns a bearer credential into a [`Principal`].

use async_trait::async_trait;
use carrylink_types::{AuthToken, CarrylinkError, Principal, Result};
use dashmap::DashMap;

/// Authenticates callers. Session issuance lives outside CarryLink.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// # Errors
    /// [`CarrylinkError::Unauthenticated`] if the token is unknown or expired.
    async fn authenticate(&self, token: &AuthToken) -> Result<Principal>;
}

/// Fixed token table, for tests and single-tenant tools.
#[derive(Default)]
pub struct StaticIdentity {
    principals: DashMap<String, Principal>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `principal` from now on.
    pub fn register(&self, token: impl Into<String>, principal: Principal) {
        self.principals.insert(token.into(), principal);
    }

    /// Stop accepting `token`.
    pub fn revoke(&self, token: &str) {
        self.principals.remove(token);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn authenticate(&self, token: &AuthToken) -> Result<Principal> {
        if token.as_str().is_empty() {
            return Err(CarrylinkError::Unauthenticated {
                reason: "missing credential".into(),
            });
        }
        self.principals
            .get(token.as_str())
            .map(|p| *p)
            .ok_or_else(|| CarrylinkError::Unauthenticated {
                reason: "unknown credential".into(),
            })
    }
}
