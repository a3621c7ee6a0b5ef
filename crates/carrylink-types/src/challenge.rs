//! Delivery challenge types: the two-sided QR token pair proving that
//! carrier and sender met in person at handoff.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MatchId, PartyId, PartyRole};

/// An opaque single-use secret rendered as a QR code.
///
/// `Debug` is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken(String);

impl DeliveryToken {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeliveryToken(<redacted>)")
    }
}

/// Freshly minted token pair. This is the only time plaintext tokens exist
/// outside the holders' devices; the transport layer must hand each token
/// to its owner only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeGrant {
    pub match_id: MatchId,
    pub carrier_id: PartyId,
    pub carrier_token: DeliveryToken,
    pub sender_id: PartyId,
    pub sender_token: DeliveryToken,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 1 for the first pair, incremented on every reissue.
    pub generation: u32,
}

impl ChallengeGrant {
    /// The token addressed to `role`.
    #[must_use]
    pub fn token_for(&self, role: PartyRole) -> &DeliveryToken {
        match role {
            PartyRole::Carrier => &self.carrier_token,
            PartyRole::Sender => &self.sender_token,
        }
    }
}

/// Lifecycle of a stored challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    /// Waiting for the joint scan.
    Open,
    /// Verified once. **Never verifiable again.**
    Consumed,
}

impl fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Consumed => write!(f, "CONSUMED"),
        }
    }
}

/// Token-free view of a stored challenge, safe to expose to either party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeStatus {
    pub match_id: MatchId,
    pub state: ChallengeState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    /// 1 for the first pair; earlier generations are retired for good.
    pub generation: u32,
}

impl ChallengeStatus {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Proof that a challenge was verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub match_id: MatchId,
    pub verified_at: DateTime<Utc>,
    pub generation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_debug_is_redacted() {
        let token = DeliveryToken::new("cl1.deadbeef");
        let dbg = format!("{token:?}");
        assert!(!dbg.contains("deadbeef"), "Got: {dbg}");
    }

    #[test]
    fn grant_addresses_tokens_by_role() {
        let now = Utc::now();
        let grant = ChallengeGrant {
            match_id: MatchId::new(),
            carrier_id: PartyId::new(),
            carrier_token: DeliveryToken::new("c"),
            sender_id: PartyId::new(),
            sender_token: DeliveryToken::new("s"),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            generation: 1,
        };
        assert_eq!(grant.token_for(PartyRole::Carrier).as_str(), "c");
        assert_eq!(grant.token_for(PartyRole::Sender).as_str(), "s");
    }
}
