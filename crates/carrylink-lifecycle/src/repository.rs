//! Match storage collaborator.
//!
//! The repository owns match records, their audit trail and idempotency
//! records. A transition, the events describing it and the request's
//! idempotency record are committed together or not at all, guarded by an
//! optimistic version check on the match.

use std::collections::HashMap;

use async_trait::async_trait;
use carrylink_types::{
    CarrylinkError, Match, MatchEvent, MatchId, PartyId, RequestId, Result, TripId,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::idempotency::IdempotencyRecord;

/// Persistent store for matches, audit events and idempotency records.
#[async_trait]
pub trait MatchRepository: Send + Sync {
    /// Store a new match.
    ///
    /// # Errors
    /// `DuplicateMatch` if its (trip, request) pair already has a live match.
    async fn insert(&self, record: &Match, events: Vec<MatchEvent>) -> Result<()>;

    async fn load(&self, match_id: MatchId) -> Result<Option<Match>>;

    /// Replace the stored match with `next` if the stored version still
    /// equals `next.version`. The stored copy gets `version + 1`.
    ///
    /// # Errors
    /// `MatchNotFound`, `VersionConflict`, or `Storage`.
    async fn commit(
        &self,
        next: &Match,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<Match>;

    /// Record rejected attempts (and their idempotency record) without
    /// touching the match.
    async fn append_events(
        &self,
        match_id: MatchId,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<()>;

    /// Audit trail of a match in sequence order.
    async fn events(&self, match_id: MatchId) -> Result<Vec<MatchEvent>>;

    /// Matches where `party` is carrier or sender, newest first.
    async fn list_for_party(&self, party: PartyId) -> Result<Vec<Match>>;

    /// Live match currently occupying the (trip, request) pair.
    async fn live_match_for_pair(&self, trip: TripId, request: RequestId) -> Result<Option<MatchId>>;

    async fn idempotency_record(&self, match_id: MatchId, key: &str)
    -> Result<Option<IdempotencyRecord>>;
}

struct Row {
    record: Match,
    events: Vec<MatchEvent>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

impl Row {
    fn append(&mut self, events: Vec<MatchEvent>) {
        for mut event in events {
            event.sequence = self.events.len() as u64 + 1;
            self.events.push(event);
        }
    }

    fn remember(&mut self, idempotency: Option<IdempotencyRecord>) {
        if let Some(rec) = idempotency {
            self.idempotency.entry(rec.key.clone()).or_insert(rec);
        }
    }
}

/// In-process repository backed by concurrent maps.
///
/// Each match lives in one row, so a commit is atomic under the row's
/// shard lock. The pair index is only touched with no row guard held.
#[derive(Default)]
pub struct InMemoryMatchRepository {
    rows: DashMap<MatchId, Row>,
    pairs: DashMap<(TripId, RequestId), MatchId>,
}

impl InMemoryMatchRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored matches.
    #[must_use]
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    fn is_live(&self, match_id: MatchId) -> bool {
        self.rows
            .get(&match_id)
            .is_some_and(|row| row.record.status.is_live())
    }
}

#[async_trait]
impl MatchRepository for InMemoryMatchRepository {
    async fn insert(&self, record: &Match, events: Vec<MatchEvent>) -> Result<()> {
        match self.pairs.entry((record.trip_id, record.request_id)) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                if self.is_live(existing) {
                    return Err(CarrylinkError::DuplicateMatch(existing));
                }
                occupied.insert(record.id);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.id);
            }
        }

        let mut row = Row {
            record: record.clone(),
            events: Vec::new(),
            idempotency: HashMap::new(),
        };
        row.append(events);
        self.rows.insert(record.id, row);
        Ok(())
    }

    async fn load(&self, match_id: MatchId) -> Result<Option<Match>> {
        Ok(self.rows.get(&match_id).map(|row| row.record.clone()))
    }

    async fn commit(
        &self,
        next: &Match,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<Match> {
        let committed = {
            let mut row = self
                .rows
                .get_mut(&next.id)
                .ok_or(CarrylinkError::MatchNotFound(next.id))?;
            if row.record.version != next.version {
                return Err(CarrylinkError::VersionConflict {
                    match_id: next.id,
                    expected: next.version,
                    found: row.record.version,
                });
            }
            let mut stored = next.clone();
            stored.version += 1;
            row.record = stored.clone();
            row.append(events);
            row.remember(idempotency);
            stored
        };

        if !committed.status.is_live() {
            self.pairs
                .remove_if(&(committed.trip_id, committed.request_id), |_, id| {
                    *id == committed.id
                });
        }
        Ok(committed)
    }

    async fn append_events(
        &self,
        match_id: MatchId,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<()> {
        let mut row = self
            .rows
            .get_mut(&match_id)
            .ok_or(CarrylinkError::MatchNotFound(match_id))?;
        row.append(events);
        row.remember(idempotency);
        Ok(())
    }

    async fn events(&self, match_id: MatchId) -> Result<Vec<MatchEvent>> {
        self.rows
            .get(&match_id)
            .map(|row| row.events.clone())
            .ok_or(CarrylinkError::MatchNotFound(match_id))
    }

    async fn list_for_party(&self, party: PartyId) -> Result<Vec<Match>> {
        let mut matches: Vec<Match> = self
            .rows
            .iter()
            .filter(|row| row.record.is_party(party))
            .map(|row| row.record.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matches)
    }

    async fn live_match_for_pair(&self, trip: TripId, request: RequestId) -> Result<Option<MatchId>> {
        let candidate = self.pairs.get(&(trip, request)).map(|id| *id);
        Ok(candidate.filter(|id| self.is_live(*id)))
    }

    async fn idempotency_record(
        &self,
        match_id: MatchId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .rows
            .get(&match_id)
            .and_then(|row| row.idempotency.get(key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{Operation, Reply};
    use carrylink_types::{Currency, EventJournal, EventKind, MatchStatus, Money};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn proposed() -> Match {
        let now = Utc::now();
        Match {
            id: MatchId::new(),
            trip_id: TripId::new(),
            request_id: RequestId::new(),
            carrier_id: PartyId::new(),
            sender_id: PartyId::new(),
            status: MatchStatus::Proposed,
            escrow_ref: None,
            unlock_fee: Money::new(Decimal::new(2000, 2), Currency::new("USD")),
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::hours(48),
            status_since: now,
            cancel_requested_by: None,
            dispute: None,
            challenge_verified: false,
            version: 0,
        }
    }

    fn created_events(m: &Match) -> Vec<MatchEvent> {
        let mut journal = EventJournal::new(m.id);
        journal.applied(EventKind::Created, m.created_at);
        journal.drain()
    }

    #[tokio::test]
    async fn insert_and_load() {
        let repo = InMemoryMatchRepository::new();
        let m = proposed();
        repo.insert(&m, created_events(&m)).await.unwrap();
        assert_eq!(repo.load(m.id).await.unwrap(), Some(m.clone()));
        assert_eq!(repo.events(m.id).await.unwrap()[0].sequence, 1);
    }

    #[tokio::test]
    async fn live_pair_rejects_second_match() {
        let repo = InMemoryMatchRepository::new();
        let first = proposed();
        repo.insert(&first, Vec::new()).await.unwrap();

        let mut second = proposed();
        second.trip_id = first.trip_id;
        second.request_id = first.request_id;
        let err = repo.insert(&second, Vec::new()).await.unwrap_err();
        assert!(matches!(err, CarrylinkError::DuplicateMatch(id) if id == first.id));
    }

    #[tokio::test]
    async fn terminal_match_frees_its_pair() {
        let repo = InMemoryMatchRepository::new();
        let mut first = proposed();
        repo.insert(&first, Vec::new()).await.unwrap();
        first.enter(MatchStatus::Cancelled, Utc::now());
        repo.commit(&first, Vec::new(), None).await.unwrap();
        assert_eq!(
            repo.live_match_for_pair(first.trip_id, first.request_id)
                .await
                .unwrap(),
            None
        );

        let mut second = proposed();
        second.trip_id = first.trip_id;
        second.request_id = first.request_id;
        repo.insert(&second, Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let repo = InMemoryMatchRepository::new();
        let m = proposed();
        repo.insert(&m, Vec::new()).await.unwrap();

        let committed = repo.commit(&m, Vec::new(), None).await.unwrap();
        assert_eq!(committed.version, 1);

        let err = repo.commit(&m, Vec::new(), None).await.unwrap_err();
        assert!(matches!(
            err,
            CarrylinkError::VersionConflict { expected: 0, found: 1, .. }
        ));
    }

    #[tokio::test]
    async fn commit_stores_events_and_record_together() {
        let repo = InMemoryMatchRepository::new();
        let m = proposed();
        repo.insert(&m, created_events(&m)).await.unwrap();

        let mut journal = EventJournal::new(m.id).with_idempotency_key(Some("k-1"));
        journal.applied(EventKind::CancellationRequested, Utc::now());
        let record = IdempotencyRecord {
            match_id: m.id,
            key: "k-1".into(),
            operation: Operation::CancelMatch,
            actor: m.sender_id,
            outcome: Ok(Reply::Match(m.clone())),
        };
        repo.commit(&m, journal.drain(), Some(record.clone()))
            .await
            .unwrap();

        let events = repo.events(m.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 2);
        assert_eq!(events[1].idempotency_key.as_deref(), Some("k-1"));
        assert_eq!(
            repo.idempotency_record(m.id, "k-1").await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn list_for_party_only_returns_own_matches() {
        let repo = InMemoryMatchRepository::new();
        let a = proposed();
        let mut b = proposed();
        b.sender_id = a.sender_id;
        let other = proposed();
        for m in [&a, &b, &other] {
            repo.insert(m, Vec::new()).await.unwrap();
        }
        let listed = repo.list_for_party(a.sender_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.sender_id == a.sender_id));
    }
}
