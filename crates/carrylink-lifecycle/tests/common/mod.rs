//! Shared harness for the lifecycle integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use carrylink_ledger::ScriptedProcessor;
use carrylink_lifecycle::{
    IdempotencyRecord, InMemoryMatchRepository, MatchRepository, MatchService, NewMatch,
    StaticIdentity,
};
use carrylink_types::{
    AuthToken, CarrylinkError, ChallengeGrant, Currency, EngineConfig, ManualClock, Match,
    MatchEvent, MatchId, Money, PartyId, Principal, RequestId, Result, TripId,
};
use rust_decimal::Decimal;

/// Install a test subscriber once; `RUST_LOG=debug` shows the transitions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory repository whose commits can be made to fail on demand.
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryMatchRepository,
    failing_commits: AtomicUsize,
}

impl FlakyRepository {
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MatchRepository for FlakyRepository {
    async fn insert(&self, record: &Match, events: Vec<MatchEvent>) -> Result<()> {
        self.inner.insert(record, events).await
    }

    async fn load(&self, match_id: MatchId) -> Result<Option<Match>> {
        self.inner.load(match_id).await
    }

    async fn commit(
        &self,
        next: &Match,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<Match> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CarrylinkError::Storage("injected commit failure".into()));
        }
        self.inner.commit(next, events, idempotency).await
    }

    async fn append_events(
        &self,
        match_id: MatchId,
        events: Vec<MatchEvent>,
        idempotency: Option<IdempotencyRecord>,
    ) -> Result<()> {
        self.inner.append_events(match_id, events, idempotency).await
    }

    async fn events(&self, match_id: MatchId) -> Result<Vec<MatchEvent>> {
        self.inner.events(match_id).await
    }

    async fn list_for_party(&self, party: PartyId) -> Result<Vec<Match>> {
        self.inner.list_for_party(party).await
    }

    async fn live_match_for_pair(&self, trip: TripId, request: RequestId) -> Result<Option<MatchId>> {
        self.inner.live_match_for_pair(trip, request).await
    }

    async fn idempotency_record(
        &self,
        match_id: MatchId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        self.inner.idempotency_record(match_id, key).await
    }
}

/// A carrier, a sender, an arbiter and a stranger wired to one service.
pub struct Harness {
    pub service: Arc<MatchService>,
    pub processor: Arc<ScriptedProcessor>,
    pub clock: Arc<ManualClock>,
    pub repo: Arc<FlakyRepository>,
    pub carrier_id: PartyId,
    pub sender_id: PartyId,
    pub carrier: AuthToken,
    pub sender: AuthToken,
    pub arbiter: AuthToken,
    pub stranger: AuthToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let processor = Arc::new(ScriptedProcessor::new());
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(FlakyRepository::default());
        let identity = Arc::new(StaticIdentity::new());

        let carrier_id = PartyId::new();
        let sender_id = PartyId::new();
        identity.register("carrier-token", Principal::member(carrier_id));
        identity.register("sender-token", Principal::member(sender_id));
        identity.register("arbiter-token", Principal::arbiter(PartyId::new()));
        identity.register("stranger-token", Principal::member(PartyId::new()));

        let service = MatchService::new(
            config,
            identity,
            repo.clone(),
            processor.clone(),
            clock.clone(),
        )
        .expect("default config is valid");

        Self {
            service: Arc::new(service),
            processor,
            clock,
            repo,
            carrier_id,
            sender_id,
            carrier: AuthToken::new("carrier-token"),
            sender: AuthToken::new("sender-token"),
            arbiter: AuthToken::new("arbiter-token"),
            stranger: AuthToken::new("stranger-token"),
        }
    }

    pub fn draft(&self, amount: Decimal) -> NewMatch {
        NewMatch {
            trip_id: TripId::new(),
            request_id: RequestId::new(),
            carrier_id: self.carrier_id,
            sender_id: self.sender_id,
            unlock_fee: Money::new(amount, Currency::new("USD")),
        }
    }

    /// A fresh 20.00 USD proposal.
    pub async fn propose(&self) -> Match {
        let draft = self.draft(Decimal::new(2000, 2));
        self.service
            .create_match(&self.sender, draft, &format!("create-{}", TripId::new()))
            .await
            .expect("create match")
    }

    pub async fn unlocked(&self) -> Match {
        let m = self.propose().await;
        self.service
            .unlock_contact(&self.sender, m.id, "unlock-1")
            .await
            .expect("unlock")
    }

    pub async fn in_transit(&self) -> (Match, ChallengeGrant) {
        let m = self.unlocked().await;
        let grant = self
            .service
            .issue_delivery_challenge(&self.carrier, m.id, "depart-1")
            .await
            .expect("issue challenge");
        let m = self
            .service
            .get_match(&self.carrier, m.id)
            .await
            .expect("get match");
        (m, grant)
    }
}
