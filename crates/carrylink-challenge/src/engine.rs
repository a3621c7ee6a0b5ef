//! QR challenge engine: issues and verifies delivery token pairs.
//!
//! Verification requires **both** tokens in one call: the carrier shows a
//! QR that the sender's device scans and vice versa, and the confirming
//! client submits the pair. A single dishonest party holding only their
//! own token cannot complete the handoff.
//!
//! The check-and-consume runs while holding the challenge's map slot, so
//! two racing scans cannot both succeed.

use std::sync::Arc;

use carrylink_types::{
    CarrylinkError, ChallengeAction, ChallengeGrant, ChallengeState, ChallengeStatus, Clock,
    DeliveryToken, EventJournal, EventKind, MatchId, PartyId, PartyRole, Result,
    VerificationResult,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::token::{self, TokenDigest};

struct StoredChallenge {
    carrier_id: PartyId,
    sender_id: PartyId,
    carrier_digest: TokenDigest,
    sender_digest: TokenDigest,
    state: ChallengeState,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
    failed_attempts: u32,
    generation: u32,
}

impl StoredChallenge {
    fn status(&self, match_id: MatchId) -> ChallengeStatus {
        ChallengeStatus {
            match_id,
            state: self.state,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            consumed_at: self.consumed_at,
            failed_attempts: self.failed_attempts,
            generation: self.generation,
        }
    }
}

/// Stores one challenge per match and enforces single use.
pub struct ChallengeEngine {
    challenges: DashMap<MatchId, StoredChallenge>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl ChallengeEngine {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl: chrono::Duration) -> Self {
        Self {
            challenges: DashMap::new(),
            clock,
            ttl,
        }
    }

    /// Mint a token pair for `match_id`.
    ///
    /// # Errors
    /// Returns `AlreadyIssued` if the match already has a challenge.
    pub fn issue(
        &self,
        match_id: MatchId,
        carrier_id: PartyId,
        sender_id: PartyId,
        journal: &mut EventJournal,
    ) -> Result<ChallengeGrant> {
        let now = self.clock.now();
        match self.challenges.entry(match_id) {
            Entry::Occupied(_) => {
                let err = CarrylinkError::AlreadyIssued(match_id);
                journal.rejected(
                    EventKind::Challenge {
                        action: ChallengeAction::Issued,
                        generation: 1,
                    },
                    &err,
                    now,
                );
                Err(err)
            }
            Entry::Vacant(vacant) => {
                let (stored, grant) = self.mint(match_id, carrier_id, sender_id, 1, now);
                vacant.insert(stored);
                journal.applied(
                    EventKind::Challenge {
                        action: ChallengeAction::Issued,
                        generation: 1,
                    },
                    now,
                );
                tracing::info!(%match_id, expires_at = %grant.expires_at, "delivery challenge issued");
                Ok(grant)
            }
        }
    }

    /// Replace an expired, unconsumed challenge with a fresh pair. The old
    /// tokens can never verify again.
    ///
    /// # Errors
    /// `ChallengeNotFound`, `AlreadyConsumed`, or `ChallengeNotExpired` if the
    /// current pair is still usable.
    pub fn reissue(&self, match_id: MatchId, journal: &mut EventJournal) -> Result<ChallengeGrant> {
        self.supersede(match_id, true, journal)
    }

    /// Replace an unconsumed challenge whether or not it has expired. Used
    /// when the pair was minted but its handover to the parties was lost.
    ///
    /// # Errors
    /// `ChallengeNotFound` or `AlreadyConsumed`.
    pub fn replace(&self, match_id: MatchId, journal: &mut EventJournal) -> Result<ChallengeGrant> {
        self.supersede(match_id, false, journal)
    }

    fn supersede(
        &self,
        match_id: MatchId,
        only_expired: bool,
        journal: &mut EventJournal,
    ) -> Result<ChallengeGrant> {
        let now = self.clock.now();
        let mut slot = self
            .challenges
            .get_mut(&match_id)
            .ok_or(CarrylinkError::ChallengeNotFound(match_id))?;
        let generation = slot.generation + 1;
        let kind = EventKind::Challenge {
            action: ChallengeAction::Reissued,
            generation,
        };

        let refusal = match slot.state {
            ChallengeState::Consumed => Some(CarrylinkError::AlreadyConsumed),
            ChallengeState::Open if only_expired && now < slot.expires_at => {
                Some(CarrylinkError::ChallengeNotExpired(match_id))
            }
            ChallengeState::Open => None,
        };
        if let Some(err) = refusal {
            journal.rejected(kind, &err, now);
            return Err(err);
        }

        let (stored, grant) = self.mint(match_id, slot.carrier_id, slot.sender_id, generation, now);
        *slot = stored;
        journal.applied(kind, now);
        tracing::info!(%match_id, generation, "delivery challenge superseded");
        Ok(grant)
    }

    /// Check both presented tokens and consume the challenge on success.
    ///
    /// Checks run in order: consumed, expired, token match. Failed attempts
    /// never consume the challenge.
    ///
    /// # Errors
    /// `ChallengeNotFound`, `AlreadyConsumed`, `ChallengeExpired`, or
    /// `InvalidToken` if either token is wrong (including swapped tokens).
    pub fn verify(
        &self,
        match_id: MatchId,
        carrier_token: &DeliveryToken,
        sender_token: &DeliveryToken,
        journal: &mut EventJournal,
    ) -> Result<VerificationResult> {
        let now = self.clock.now();
        let mut slot = self
            .challenges
            .get_mut(&match_id)
            .ok_or(CarrylinkError::ChallengeNotFound(match_id))?;
        let generation = slot.generation;

        let failure = if slot.state == ChallengeState::Consumed {
            Some(CarrylinkError::AlreadyConsumed)
        } else if now >= slot.expires_at {
            Some(CarrylinkError::ChallengeExpired)
        } else {
            let carrier_ok = token::digests_equal(
                &slot.carrier_digest,
                &token::digest(match_id, PartyRole::Carrier, carrier_token),
            );
            let sender_ok = token::digests_equal(
                &slot.sender_digest,
                &token::digest(match_id, PartyRole::Sender, sender_token),
            );
            let matched: bool = (carrier_ok & sender_ok).into();
            (!matched).then_some(CarrylinkError::InvalidToken)
        };

        if let Some(err) = failure {
            slot.failed_attempts = slot.failed_attempts.saturating_add(1);
            journal.rejected(
                EventKind::Challenge {
                    action: ChallengeAction::VerificationFailed,
                    generation,
                },
                &err,
                now,
            );
            tracing::warn!(%match_id, attempts = slot.failed_attempts, error = %err, "delivery verification failed");
            return Err(err);
        }

        slot.state = ChallengeState::Consumed;
        slot.consumed_at = Some(now);
        journal.applied(
            EventKind::Challenge {
                action: ChallengeAction::Verified,
                generation,
            },
            now,
        );
        tracing::info!(%match_id, generation, "delivery challenge verified");
        Ok(VerificationResult {
            match_id,
            verified_at: now,
            generation,
        })
    }

    /// Drop challenges that expired (or were consumed) before `older_than`.
    /// Verification never depends on this running. Returns how many were
    /// removed.
    pub fn purge_expired(&self, older_than: DateTime<Utc>) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, c| {
            let done_at = c.consumed_at.unwrap_or(c.expires_at);
            done_at >= older_than
        });
        let purged = before.saturating_sub(self.challenges.len());
        if purged > 0 {
            tracing::debug!(purged, "expired delivery challenges purged");
        }
        purged
    }

    /// Token-free view of the match's challenge.
    #[must_use]
    pub fn status(&self, match_id: MatchId) -> Option<ChallengeStatus> {
        self.challenges.get(&match_id).map(|c| c.status(match_id))
    }

    /// Number of challenges tracked.
    #[must_use]
    pub fn count(&self) -> usize {
        self.challenges.len()
    }

    fn mint(
        &self,
        match_id: MatchId,
        carrier_id: PartyId,
        sender_id: PartyId,
        generation: u32,
        now: DateTime<Utc>,
    ) -> (StoredChallenge, ChallengeGrant) {
        let carrier_token = token::mint();
        let sender_token = token::mint();
        let expires_at = now + self.ttl;
        let stored = StoredChallenge {
            carrier_id,
            sender_id,
            carrier_digest: token::digest(match_id, PartyRole::Carrier, &carrier_token),
            sender_digest: token::digest(match_id, PartyRole::Sender, &sender_token),
            state: ChallengeState::Open,
            issued_at: now,
            expires_at,
            consumed_at: None,
            failed_attempts: 0,
            generation,
        };
        let grant = ChallengeGrant {
            match_id,
            carrier_id,
            carrier_token,
            sender_id,
            sender_token,
            issued_at: now,
            expires_at,
            generation,
        };
        (stored, grant)
    }
}
