//! Idempotency records: replaying a request returns its original outcome.
//!
//! Mutations on an existing match are keyed by `(match_id, key)` and the
//! record is written in the same repository commit as the transition, so
//! a replay can never observe a half-applied request. Retryable failures
//! are never recorded.
//!
//! `CreateMatch` has no match id yet, so its keys are scoped by the calling
//! party in a bounded in-process cache with FIFO eviction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use carrylink_types::{CarrylinkError, ChallengeGrant, Match, MatchId, PartyId, Result};

/// Mutating operations exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateMatch,
    UnlockContact,
    IssueDeliveryChallenge,
    ConfirmDelivery,
    ConfirmReceipt,
    CancelMatch,
    RaiseDispute,
    ResolveDispute,
    ReissueDeliveryChallenge,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateMatch => "create_match",
            Self::UnlockContact => "unlock_contact",
            Self::IssueDeliveryChallenge => "issue_delivery_challenge",
            Self::ConfirmDelivery => "confirm_delivery",
            Self::ConfirmReceipt => "confirm_receipt",
            Self::CancelMatch => "cancel_match",
            Self::RaiseDispute => "raise_dispute",
            Self::ResolveDispute => "resolve_dispute",
            Self::ReissueDeliveryChallenge => "reissue_delivery_challenge",
        };
        f.write_str(name)
    }
}

/// Successful result of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Match(Match),
    Challenge(ChallengeGrant),
}

impl Reply {
    pub(crate) fn into_match(self) -> Result<Match> {
        match self {
            Self::Match(m) => Ok(m),
            Self::Challenge(_) => Err(CarrylinkError::Internal(
                "challenge reply where a match was expected".into(),
            )),
        }
    }

    pub(crate) fn into_grant(self) -> Result<ChallengeGrant> {
        match self {
            Self::Challenge(grant) => Ok(grant),
            Self::Match(_) => Err(CarrylinkError::Internal(
                "match reply where a challenge was expected".into(),
            )),
        }
    }
}

/// Stored outcome of one keyed request.
///
/// Challenge replies carry plaintext tokens, so records must be protected
/// like the tokens themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub match_id: MatchId,
    pub key: String,
    pub operation: Operation,
    pub actor: PartyId,
    pub outcome: std::result::Result<Reply, CarrylinkError>,
}

impl IdempotencyRecord {
    /// Replay this record for a new request carrying the same key.
    ///
    /// # Errors
    /// `IdempotencyKeyReused` if the key was used for another operation or
    /// by another caller; otherwise the original error, if any.
    pub fn replay(&self, operation: Operation, actor: PartyId) -> Result<Reply> {
        if self.operation != operation || self.actor != actor {
            return Err(CarrylinkError::IdempotencyKeyReused {
                previous: self.operation.to_string(),
                attempted: operation.to_string(),
            });
        }
        self.outcome.clone()
    }
}

/// Bounded `(party, key) → match` map for `CreateMatch` replays.
///
/// When full, the oldest record is evicted to make room.
pub struct CreateReplayCache {
    inner: Mutex<ReplayState>,
    max_size: usize,
}

struct ReplayState {
    created: HashMap<(PartyId, String), MatchId>,
    order: VecDeque<(PartyId, String)>,
}

impl CreateReplayCache {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(ReplayState {
                created: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size: max_size.max(1),
        }
    }

    /// Match previously created by `party` under `key`, if remembered.
    #[must_use]
    pub fn get(&self, party: PartyId, key: &str) -> Option<MatchId> {
        let state = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.created.get(&(party, key.to_string())).copied()
    }

    /// Remember that `party` created `match_id` under `key`.
    pub fn remember(&self, party: PartyId, key: &str, match_id: MatchId) {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = (party, key.to_string());
        if state.created.contains_key(&slot) {
            return;
        }
        if state.created.len() >= self.max_size {
            if let Some(oldest) = state.order.pop_front() {
                state.created.remove(&oldest);
            }
        }
        state.created.insert(slot.clone(), match_id);
        state.order.push_back(slot);
    }

    /// Number of remembered creations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .created
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
