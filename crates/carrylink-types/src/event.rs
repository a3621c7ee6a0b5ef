//! Append-only audit log of every match transition attempt.
//!
//! Events are collected in an [`EventJournal`] while a transition is being
//! evaluated and handed to the repository together with the match write,
//! so the log and the state it describes commit atomically. Rejected
//! attempts are journaled too: they are the raw material for dispute
//! analysis and for spotting retry storms.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CarrylinkError, EscrowState, EventId, LifecycleEvent, MatchId, MatchStatus, PartyId};

/// What happened to the delivery challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeAction {
    Issued,
    Verified,
    VerificationFailed,
    Reissued,
}

/// Payload of an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The match record was created by the matching trigger.
    Created,
    /// A lifecycle event was evaluated. `to` is `None` for rejections.
    Lifecycle {
        event: LifecycleEvent,
        from: MatchStatus,
        to: Option<MatchStatus>,
    },
    /// One side asked for a mutual cancellation and is waiting for the other.
    CancellationRequested,
    /// The escrow entry moved between states.
    Escrow {
        from: Option<EscrowState>,
        to: EscrowState,
        amount: Decimal,
    },
    /// The delivery challenge was touched.
    Challenge { action: ChallengeAction, generation: u32 },
}

/// Whether the attempt took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Rejected { code: String, reason: String },
}

impl EventOutcome {
    #[must_use]
    pub fn rejected(err: &CarrylinkError) -> Self {
        Self::Rejected {
            code: err.code().to_string(),
            reason: err.to_string(),
        }
    }

    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub id: EventId,
    pub match_id: MatchId,
    /// Per-match position, assigned by the repository on append.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub actor: Option<PartyId>,
    pub idempotency_key: Option<String>,
    pub kind: EventKind,
    pub outcome: EventOutcome,
}

/// Buffer of events produced while evaluating one request.
#[derive(Debug, Clone)]
pub struct EventJournal {
    match_id: MatchId,
    actor: Option<PartyId>,
    idempotency_key: Option<String>,
    events: Vec<MatchEvent>,
}

impl EventJournal {
    #[must_use]
    pub fn new(match_id: MatchId) -> Self {
        Self {
            match_id,
            actor: None,
            idempotency_key: None,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: Option<PartyId>) -> Self {
        self.actor = actor;
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<&str>) -> Self {
        self.idempotency_key = key.map(str::to_string);
        self
    }

    #[must_use]
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn record(&mut self, kind: EventKind, outcome: EventOutcome, at: DateTime<Utc>) {
        self.events.push(MatchEvent {
            id: EventId::new(),
            match_id: self.match_id,
            sequence: 0,
            at,
            actor: self.actor,
            idempotency_key: self.idempotency_key.clone(),
            kind,
            outcome,
        });
    }

    pub fn applied(&mut self, kind: EventKind, at: DateTime<Utc>) {
        self.record(kind, EventOutcome::Applied, at);
    }

    pub fn rejected(&mut self, kind: EventKind, err: &CarrylinkError, at: DateTime<Utc>) {
        self.record(kind, EventOutcome::rejected(err), at);
    }

    #[must_use]
    pub fn events(&self) -> &[MatchEvent] {
        &self.events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Take the buffered events, leaving the journal empty but keeping its
    /// actor and key for further records.
    pub fn drain(&mut self) -> Vec<MatchEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_stamps_actor_and_key() {
        let match_id = MatchId::new();
        let actor = PartyId::new();
        let mut journal = EventJournal::new(match_id)
            .with_actor(Some(actor))
            .with_idempotency_key(Some("k-1"));
        journal.applied(EventKind::Created, Utc::now());

        let ev = &journal.events()[0];
        assert_eq!(ev.match_id, match_id);
        assert_eq!(ev.actor, Some(actor));
        assert_eq!(ev.idempotency_key.as_deref(), Some("k-1"));
        assert!(ev.outcome.is_applied());
    }

    #[test]
    fn rejection_carries_error_code() {
        let mut journal = EventJournal::new(MatchId::new());
        let err = CarrylinkError::InvalidToken;
        journal.rejected(
            EventKind::Challenge {
                action: ChallengeAction::VerificationFailed,
                generation: 1,
            },
            &err,
            Utc::now(),
        );
        match &journal.events()[0].outcome {
            EventOutcome::Rejected { code, .. } => assert_eq!(code, err.code()),
            EventOutcome::Applied => panic!("expected rejection"),
        }
    }

    #[test]
    fn drain_empties_buffer() {
        let mut journal = EventJournal::new(MatchId::new());
        journal.applied(EventKind::CancellationRequested, Utc::now());
        assert_eq!(journal.drain().len(), 1);
        assert!(journal.is_empty());
    }

    #[test]
    fn event_serde_is_tagged() {
        let mut journal = EventJournal::new(MatchId::new());
        journal.applied(
            EventKind::Lifecycle {
                event: LifecycleEvent::UnlockRequested,
                from: MatchStatus::Proposed,
                to: Some(MatchStatus::ContactUnlocked),
            },
            Utc::now(),
        );
        let json = serde_json::to_string(&journal.events()[0]).unwrap();
        assert!(json.contains("\"type\":\"lifecycle\""), "Got: {json}");
        assert!(json.contains("\"outcome\":\"applied\""), "Got: {json}");
    }
}
