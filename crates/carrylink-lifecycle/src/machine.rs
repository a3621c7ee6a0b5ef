//! Match state machine: the only writer of match records.
//!
//! Every mutation runs the same pipeline under the match's lease:
//!
//! ```text
//! lease → idempotency lookup → load → housekeeping → command → commit
//!                                      │
//!                                      ├─ lazy expiry (proposal past its window)
//!                                      └─ consistency check (status vs escrow)
//! ```
//!
//! The command checks the transition graph, drives the ledger and the
//! challenge engine, and moves the match. The new snapshot, every journaled
//! event and the request's idempotency record go to the repository in one
//! commit. Attempts that change nothing are still journaled as rejected.

use std::sync::Arc;

use carrylink_challenge::ChallengeEngine;
use carrylink_ledger::EscrowLedger;
use carrylink_types::{
    CarrylinkError, ChallengeGrant, ChallengeState, Clock, DeliveryToken, DisputeInfo, EngineConfig, EscrowState,
    EventJournal, EventKind, LifecycleEvent, Match, MatchEvent, MatchId, MatchStatus, PartyId,
    Principal, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::idempotency::{IdempotencyRecord, Operation, Reply};
use crate::lease::MatchLeases;
use crate::repository::MatchRepository;

/// Arbitration outcome for a disputed match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Pay the carrier; only possible once the handoff was verified.
    ReleaseToCarrier,
    /// Return the fee to the sender per the arbitration refund ratio.
    RefundSender,
}

/// A mutation requested through the service.
pub(crate) enum Command {
    Unlock,
    Depart,
    Scan {
        carrier_token: DeliveryToken,
        sender_token: DeliveryToken,
    },
    ConfirmReceipt,
    Cancel,
    Dispute {
        reason: String,
    },
    Resolve(Resolution),
    Reissue,
}

impl Command {
    pub(crate) fn operation(&self) -> Operation {
        match self {
            Self::Unlock => Operation::UnlockContact,
            Self::Depart => Operation::IssueDeliveryChallenge,
            Self::Scan { .. } => Operation::ConfirmDelivery,
            Self::ConfirmReceipt => Operation::ConfirmReceipt,
            Self::Cancel => Operation::CancelMatch,
            Self::Dispute { .. } => Operation::RaiseDispute,
            Self::Resolve(_) => Operation::ResolveDispute,
            Self::Reissue => Operation::ReissueDeliveryChallenge,
        }
    }

    /// Lifecycle event this command raises from `status`.
    fn event(&self, status: MatchStatus) -> LifecycleEvent {
        match self {
            Self::Unlock => LifecycleEvent::UnlockRequested,
            Self::Depart => LifecycleEvent::CarrierDeparts,
            Self::Scan { .. } => LifecycleEvent::DeliveryScan,
            Self::ConfirmReceipt => LifecycleEvent::Confirm,
            Self::Cancel if status == MatchStatus::Proposed => LifecycleEvent::Cancel,
            Self::Cancel => LifecycleEvent::CancelAfterUnlock,
            Self::Dispute { .. } => LifecycleEvent::RaiseDispute,
            Self::Resolve(Resolution::ReleaseToCarrier) => LifecycleEvent::ResolveRelease,
            Self::Resolve(Resolution::RefundSender) => LifecycleEvent::ResolveRefund,
            Self::Reissue => LifecycleEvent::ReissueChallenge,
        }
    }
}

/// Who is asking, under which idempotency key.
pub(crate) struct Request {
    pub caller: Principal,
    pub key: String,
}

pub(crate) struct MatchStateMachine {
    repo: Arc<dyn MatchRepository>,
    ledger: Arc<EscrowLedger>,
    challenges: Arc<ChallengeEngine>,
    leases: MatchLeases,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl MatchStateMachine {
    pub(crate) fn new(
        repo: Arc<dyn MatchRepository>,
        ledger: Arc<EscrowLedger>,
        challenges: Arc<ChallengeEngine>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repo,
            ledger,
            challenges,
            leases: MatchLeases::new(config.lease_wait()),
            clock,
            config,
        }
    }

    pub(crate) fn repository(&self) -> &dyn MatchRepository {
        self.repo.as_ref()
    }

    pub(crate) fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    pub(crate) fn challenges(&self) -> &ChallengeEngine {
        &self.challenges
    }

    // -----------------------------------------------------------------
    // Creation and reads
    // -----------------------------------------------------------------

    /// Store a freshly built proposal.
    ///
    /// A pair still indexed under a proposal that has silently expired is
    /// freed by expiring that proposal first.
    pub(crate) async fn create(&self, record: &Match, actor: PartyId, key: &str) -> Result<()> {
        let created = |record: &Match| {
            let mut journal = EventJournal::new(record.id)
                .with_actor(Some(actor))
                .with_idempotency_key(Some(key));
            journal.applied(EventKind::Created, record.created_at);
            journal.drain()
        };

        match self.repo.insert(record, created(record)).await {
            Err(CarrylinkError::DuplicateMatch(existing)) => {
                let blocker = self.current(existing).await?;
                if blocker.status.is_live() {
                    return Err(CarrylinkError::DuplicateMatch(existing));
                }
                self.repo.insert(record, created(record)).await
            }
            other => other,
        }
    }

    /// Stored match without housekeeping. Parties and fee never change, so
    /// this is enough for authorization checks.
    pub(crate) async fn load(&self, match_id: MatchId) -> Result<Match> {
        self.repo
            .load(match_id)
            .await?
            .ok_or(CarrylinkError::MatchNotFound(match_id))
    }

    /// Match with lazy expiry and the consistency check applied.
    ///
    /// A mismatch found here freezes the match and returns it disputed
    /// rather than failing the read.
    pub(crate) async fn current(&self, match_id: MatchId) -> Result<Match> {
        let stored = self.load(match_id).await?;
        if !self.needs_housekeeping(&stored) {
            return Ok(stored);
        }

        // Re-check under the lease: an in-flight mutation may be mid-way.
        let _lease = self.leases.acquire(match_id).await?;
        let stored = self.load(match_id).await?;
        let mut next = stored.clone();
        let mut journal = EventJournal::new(match_id);
        // A detected mismatch is already reflected in `next`.
        let _ = self.housekeeping(&mut next, &mut journal).await;
        if next == stored {
            return Ok(stored);
        }
        self.repo.commit(&next, journal.drain(), None).await
    }

    // -----------------------------------------------------------------
    // Mutation pipeline
    // -----------------------------------------------------------------

    pub(crate) async fn apply(
        &self,
        match_id: MatchId,
        command: Command,
        request: &Request,
    ) -> Result<Reply> {
        let operation = command.operation();
        let actor = request.caller.party_id;
        let _lease = self.leases.acquire(match_id).await?;

        if let Some(record) = self.repo.idempotency_record(match_id, &request.key).await? {
            tracing::debug!(%match_id, %operation, key = %request.key, "idempotent replay");
            return record.replay(operation, actor);
        }

        let current = self.load(match_id).await?;
        let mut next = current.clone();
        let mut system = EventJournal::new(match_id);
        let mut journal = EventJournal::new(match_id)
            .with_actor(Some(actor))
            .with_idempotency_key(Some(&request.key));

        let result = match self.housekeeping(&mut next, &mut system).await {
            Ok(()) => self.evaluate(&command, &mut next, request, &mut journal).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            let recorded = journal
                .events()
                .iter()
                .any(|e| matches!(e.kind, EventKind::Lifecycle { .. }));
            if !recorded {
                refuse(&next, command.event(next.status), err, &mut journal, self.clock.now());
            }
            tracing::warn!(%match_id, %operation, status = %next.status, error = %err, "request rejected");
        }

        let changed = next != current;
        let snapshot = if changed {
            Match {
                version: next.version + 1,
                ..next.clone()
            }
        } else {
            current
        };
        let outcome = result.map(|grant| grant.map_or_else(|| Reply::Match(snapshot), Reply::Challenge));
        let record = match &outcome {
            // A transient failure may still have moved the match; the
            // record then pins the outcome to what was committed.
            Err(err) if err.is_retryable() && !changed => None,
            _ => Some(IdempotencyRecord {
                match_id,
                key: request.key.clone(),
                operation,
                actor,
                outcome: outcome.clone(),
            }),
        };

        let mut events: Vec<MatchEvent> = system.drain();
        events.extend(journal.drain());
        let persisted = if changed {
            self.repo.commit(&next, events, record).await.map(|_| ())
        } else {
            self.repo.append_events(match_id, events, record).await
        };
        if let Err(err) = persisted {
            // Ledger or challenge side effects may already have happened;
            // the next access sees the mismatch and freezes the match.
            tracing::error!(%match_id, %operation, error = %err, "failed to persist match transition");
            return Err(err);
        }
        outcome
    }

    async fn evaluate(
        &self,
        command: &Command,
        m: &mut Match,
        request: &Request,
        journal: &mut EventJournal,
    ) -> Result<Option<ChallengeGrant>> {
        if m.status == MatchStatus::Expired {
            return Err(CarrylinkError::MatchExpired(m.id));
        }
        let caller = request.caller.party_id;
        match command {
            Command::Unlock => self.unlock(m, &request.key, journal).await.map(|()| None),
            Command::Depart => self.depart(m, journal).map(Some),
            Command::Scan {
                carrier_token,
                sender_token,
            } => self
                .scan(m, carrier_token, sender_token, journal)
                .await
                .map(|()| None),
            Command::ConfirmReceipt => self.confirm_receipt(m, journal).await.map(|()| None),
            Command::Cancel => self.cancel(m, caller, journal).await.map(|()| None),
            Command::Dispute { reason } => self.dispute(m, caller, reason, journal).map(|()| None),
            Command::Resolve(resolution) => {
                self.resolve(m, *resolution, journal).await.map(|()| None)
            }
            Command::Reissue => self.reissue(m, journal).map(Some),
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// proposed → contact_unlocked: authorize and capture the unlock fee.
    async fn unlock(&self, m: &mut Match, key: &str, journal: &mut EventJournal) -> Result<()> {
        let event = LifecycleEvent::UnlockRequested;
        guard(m, event)?;
        let fee = m.unlock_fee.clone();

        match self.ledger.state(m.id) {
            // A hold from an earlier attempt whose capture failed and
            // could not be voided: resume at capture.
            Some(EscrowState::Authorized) => {}
            Some(state @ (EscrowState::Captured | EscrowState::Released | EscrowState::Refunded)) => {
                return Err(CarrylinkError::EscrowInvalidState {
                    match_id: m.id,
                    state,
                    attempted: EscrowState::Authorized,
                });
            }
            _ => {
                self.ledger
                    .authorize(m.id, m.sender_id, fee.amount, &fee.currency, key, journal)
                    .await?;
            }
        }

        let entry = match self.ledger.capture(m.id, journal).await {
            Ok(entry) => entry,
            Err(err) => {
                self.void_hold(m.id, journal).await;
                return Err(err);
            }
        };

        m.escrow_ref = Some(entry.escrow_ref);
        advance(m, event, journal, self.clock.now())
    }

    /// contact_unlocked → in_transit: mint the delivery challenge.
    fn depart(&self, m: &mut Match, journal: &mut EventJournal) -> Result<ChallengeGrant> {
        let event = LifecycleEvent::CarrierDeparts;
        guard(m, event)?;
        let orphaned = self
            .challenges
            .status(m.id)
            .is_some_and(|c| c.state == ChallengeState::Open);
        let grant = if orphaned {
            // Minted by an earlier attempt whose commit was lost.
            self.challenges.replace(m.id, journal)?
        } else {
            self.challenges
                .issue(m.id, m.carrier_id, m.sender_id, journal)?
        };
        advance(m, event, journal, self.clock.now())?;
        Ok(grant)
    }

    /// in_transit → delivery_pending_confirmation, and on to completed
    /// unless the sender must confirm receipt separately.
    async fn scan(
        &self,
        m: &mut Match,
        carrier_token: &DeliveryToken,
        sender_token: &DeliveryToken,
        journal: &mut EventJournal,
    ) -> Result<()> {
        let event = LifecycleEvent::DeliveryScan;
        guard(m, event)?;
        self.challenges
            .verify(m.id, carrier_token, sender_token, journal)?;
        m.challenge_verified = true;
        advance(m, event, journal, self.clock.now())?;

        if self.config.require_sender_confirmation {
            tracing::info!(match_id = %m.id, "handoff verified, awaiting sender confirmation");
            return Ok(());
        }
        // On failure the match stays committed at
        // delivery_pending_confirmation; confirm_receipt retries the payout.
        self.release_to_carrier(m, LifecycleEvent::Confirm, journal)
            .await
    }

    /// delivery_pending_confirmation → completed.
    async fn confirm_receipt(&self, m: &mut Match, journal: &mut EventJournal) -> Result<()> {
        let event = LifecycleEvent::Confirm;
        guard(m, event)?;
        if !m.challenge_verified {
            return Err(CarrylinkError::IllegalTransition {
                from: m.status,
                event,
            });
        }
        self.release_to_carrier(m, event, journal).await
    }

    /// proposed → cancelled outright; after unlock only by mutual agreement
    /// or once the grace period has run out, refunding per policy.
    ///
    /// A unilateral request that cannot cancel yet is refused with
    /// `IllegalTransition`, but is remembered so the counterparty's cancel
    /// completes it.
    async fn cancel(
        &self,
        m: &mut Match,
        caller: PartyId,
        journal: &mut EventJournal,
    ) -> Result<()> {
        let now = self.clock.now();
        let ratio = match m.status {
            MatchStatus::Proposed => {
                if self.ledger.state(m.id) == Some(EscrowState::Authorized) {
                    self.void_hold(m.id, journal).await;
                }
                return advance(m, LifecycleEvent::Cancel, journal, now);
            }
            MatchStatus::ContactUnlocked => self.config.refund.before_departure,
            MatchStatus::InTransit => self.config.refund.after_departure,
            from => {
                return Err(CarrylinkError::IllegalTransition {
                    from,
                    event: LifecycleEvent::CancelAfterUnlock,
                });
            }
        };

        let event = LifecycleEvent::CancelAfterUnlock;
        let agreed = m.cancel_requested_by.is_some_and(|p| p != caller);
        let grace_over = now >= m.status_since + self.config.cancel_grace();
        if !agreed && !grace_over {
            if m.cancel_requested_by != Some(caller) {
                m.cancel_requested_by = Some(caller);
                m.updated_at = now;
                journal.applied(EventKind::CancellationRequested, now);
                tracing::info!(match_id = %m.id, requested_by = %caller, "cancellation requested, awaiting counterparty");
            }
            return Err(CarrylinkError::IllegalTransition {
                from: m.status,
                event,
            });
        }

        if let Err(err) = self.ledger.refund(m.id, ratio, journal).await {
            refuse(m, event, &err, journal, self.clock.now());
            return Err(err);
        }
        advance(m, event, journal, self.clock.now())
    }

    /// in_transit | delivery_pending_confirmation → disputed. Funds freeze.
    fn dispute(
        &self,
        m: &mut Match,
        caller: PartyId,
        reason: &str,
        journal: &mut EventJournal,
    ) -> Result<()> {
        let event = LifecycleEvent::RaiseDispute;
        guard(m, event)?;
        let now = self.clock.now();
        m.dispute = Some(DisputeInfo {
            raised_by: Some(caller),
            reason: reason.to_string(),
            raised_from: m.status,
            raised_at: now,
        });
        advance(m, event, journal, now)
    }

    /// disputed → completed | cancelled, by arbitration.
    async fn resolve(
        &self,
        m: &mut Match,
        resolution: Resolution,
        journal: &mut EventJournal,
    ) -> Result<()> {
        match resolution {
            Resolution::ReleaseToCarrier => {
                let event = LifecycleEvent::ResolveRelease;
                guard(m, event)?;
                if !m.challenge_verified {
                    return Err(CarrylinkError::IllegalTransition {
                        from: m.status,
                        event,
                    });
                }
                if self.ledger.state(m.id) == Some(EscrowState::Released) {
                    return advance(m, event, journal, self.clock.now());
                }
                self.release_to_carrier(m, event, journal).await
            }
            Resolution::RefundSender => {
                let event = LifecycleEvent::ResolveRefund;
                guard(m, event)?;
                if self.ledger.state(m.id) == Some(EscrowState::Released) {
                    return Err(CarrylinkError::EscrowInvalidState {
                        match_id: m.id,
                        state: EscrowState::Released,
                        attempted: EscrowState::Refunded,
                    });
                }
                let held = matches!(
                    self.ledger.state(m.id),
                    Some(EscrowState::Authorized | EscrowState::Captured)
                );
                if held {
                    let ratio = self.config.refund.arbitration;
                    if let Err(err) = self.ledger.refund(m.id, ratio, journal).await {
                        refuse(m, event, &err, journal, self.clock.now());
                        return Err(err);
                    }
                }
                advance(m, event, journal, self.clock.now())
            }
        }
    }

    /// Replace an expired, unused challenge. The match stays in transit and
    /// keeps its `status_since`.
    fn reissue(&self, m: &mut Match, journal: &mut EventJournal) -> Result<ChallengeGrant> {
        let event = LifecycleEvent::ReissueChallenge;
        let to = guard(m, event)?;
        let grant = self.challenges.reissue(m.id, journal)?;
        let now = self.clock.now();
        m.updated_at = now;
        journal.applied(
            EventKind::Lifecycle {
                event,
                from: m.status,
                to: Some(to),
            },
            now,
        );
        tracing::info!(match_id = %m.id, generation = grant.generation, "delivery challenge replaced");
        Ok(grant)
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    async fn release_to_carrier(
        &self,
        m: &mut Match,
        event: LifecycleEvent,
        journal: &mut EventJournal,
    ) -> Result<()> {
        guard(m, event)?;
        if let Err(err) = self.ledger.release(m.id, m.carrier_id, journal).await {
            refuse(m, event, &err, journal, self.clock.now());
            return Err(err);
        }
        advance(m, event, journal, self.clock.now())
    }

    /// Best-effort void of an uncaptured hold. A failure leaves the hold
    /// authorized, which the next unlock resumes or the consistency check
    /// flags.
    async fn void_hold(&self, match_id: MatchId, journal: &mut EventJournal) {
        if let Err(err) = self.ledger.refund(match_id, Decimal::ONE, journal).await {
            tracing::error!(%match_id, error = %err, "could not void unlock hold");
        }
    }

    /// The challenge engine's record wins over the match flag, which a
    /// lost commit may not have persisted.
    fn verified(&self, m: &Match) -> bool {
        m.challenge_verified
            || self
                .challenges
                .status(m.id)
                .is_some_and(|c| c.state == ChallengeState::Consumed)
    }

    fn needs_housekeeping(&self, m: &Match) -> bool {
        m.is_expired_at(self.clock.now())
            || (!m.status.is_terminal() && m.challenge_verified != self.verified(m))
            || self.inconsistency(m).is_some()
    }

    /// Lazy expiry, the verified flag, then the consistency check.
    ///
    /// On a mismatch a live match is moved to disputed in place; a terminal
    /// one keeps its status and the mismatch is only journaled. Both return
    /// `InconsistentState`.
    async fn housekeeping(&self, m: &mut Match, journal: &mut EventJournal) -> Result<()> {
        let now = self.clock.now();
        if m.is_expired_at(now) {
            if self.ledger.state(m.id) == Some(EscrowState::Authorized) {
                self.void_hold(m.id, journal).await;
            }
            advance(m, LifecycleEvent::ExpiryReached, journal, now)?;
        }
        if !m.status.is_terminal() && !m.challenge_verified && self.verified(m) {
            m.challenge_verified = true;
            m.updated_at = now;
        }

        let Some(reason) = self.inconsistency(m) else {
            return Ok(());
        };
        let err = CarrylinkError::InconsistentState {
            match_id: m.id,
            reason: reason.clone(),
        };
        if m.status.is_terminal() {
            journal.rejected(
                EventKind::Lifecycle {
                    event: LifecycleEvent::InconsistencyDetected,
                    from: m.status,
                    to: None,
                },
                &err,
                now,
            );
            tracing::error!(match_id = %m.id, %reason, "terminal match disagrees with escrow");
            return Err(err);
        }
        m.dispute = Some(DisputeInfo {
            raised_by: None,
            reason: reason.clone(),
            raised_from: m.status,
            raised_at: now,
        });
        advance(m, LifecycleEvent::InconsistencyDetected, journal, now)?;
        tracing::error!(match_id = %m.id, %reason, "match and escrow disagree, match frozen");
        Err(err)
    }

    /// Describe a disagreement between the match status and its escrow or
    /// its delivery challenge.
    fn inconsistency(&self, m: &Match) -> Option<String> {
        use EscrowState as E;
        let escrow = self.ledger.state(m.id);
        let consistent = match m.status {
            MatchStatus::Disputed => true,
            MatchStatus::Proposed => matches!(
                escrow,
                None | Some(E::Pending | E::Failed | E::Authorized | E::Refunded)
            ),
            MatchStatus::Cancelled | MatchStatus::Expired => {
                matches!(escrow, None | Some(E::Failed | E::Refunded))
            }
            MatchStatus::ContactUnlocked
            | MatchStatus::InTransit
            | MatchStatus::DeliveryPendingConfirmation => escrow == Some(E::Captured),
            MatchStatus::Completed => escrow == Some(E::Released),
        };
        if !consistent {
            let escrow = escrow.map_or_else(|| "absent".to_string(), |s| s.to_string());
            return Some(format!("match is {} but escrow is {escrow}", m.status));
        }
        let before_scan = matches!(
            m.status,
            MatchStatus::Proposed | MatchStatus::ContactUnlocked | MatchStatus::InTransit
        );
        (before_scan && self.verified(m))
            .then(|| format!("match is {} but delivery was already verified", m.status))
    }
}

/// Target of `event` from the current status, or `IllegalTransition`.
fn guard(m: &Match, event: LifecycleEvent) -> Result<MatchStatus> {
    m.status
        .target(event)
        .ok_or(CarrylinkError::IllegalTransition {
            from: m.status,
            event,
        })
}

/// Move along `event` and journal the transition.
fn advance(
    m: &mut Match,
    event: LifecycleEvent,
    journal: &mut EventJournal,
    now: DateTime<Utc>,
) -> Result<()> {
    let from = m.status;
    let to = guard(m, event)?;
    m.enter(to, now);
    journal.applied(
        EventKind::Lifecycle {
            event,
            from,
            to: Some(to),
        },
        now,
    );
    tracing::info!(match_id = %m.id, %event, %from, %to, "match transition applied");
    Ok(())
}

/// Journal a rejected lifecycle event.
fn refuse(
    m: &Match,
    event: LifecycleEvent,
    err: &CarrylinkError,
    journal: &mut EventJournal,
    now: DateTime<Utc>,
) {
    journal.rejected(
        EventKind::Lifecycle {
            event,
            from: m.status,
            to: None,
        },
        err,
        now,
    );
}
