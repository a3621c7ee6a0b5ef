//! Escrow ledger: the source of truth for funds state per match.
//!
//! Each operation runs in two steps:
//! 1. Check and reserve the entry's state (short, synchronous, no I/O)
//! 2. Call the payment processor under a timeout, then commit the outcome
//!
//! Callers serialize operations per match (the lifecycle lease); the
//! reserve step additionally makes concurrent misuse fail cleanly instead
//! of double-charging. Every state change is journaled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use carrylink_types::{
    CarrylinkError, Clock, Currency, EscrowEntry, EscrowState, EventJournal, EventKind, MatchId,
    Money, PartyId, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;

use crate::processor::{PaymentProcessor, ProcessorError};

/// Tracks held/captured/released/refunded funds, one entry per match.
pub struct EscrowLedger {
    entries: DashMap<MatchId, EscrowEntry>,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl EscrowLedger {
    #[must_use]
    pub fn new(processor: Arc<dyn PaymentProcessor>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            processor,
            clock,
            timeout,
        }
    }

    /// Place a hold for `amount` and record it as AUTHORIZED.
    ///
    /// Repeating the call with the same `idempotency_key` returns the
    /// existing entry without touching the processor. A FAILED entry may be
    /// re-authorized with any key.
    ///
    /// # Errors
    /// - `AlreadyAuthorized` if a hold exists under a different key
    /// - `AuthorizationInFlight` if another authorization is still pending
    /// - `PaymentDeclined` / `ProcessorUnavailable` / `ProcessorTimeout`
    ///   if the processor did not place the hold (entry becomes FAILED)
    pub async fn authorize(
        &self,
        match_id: MatchId,
        payer: PartyId,
        amount: Decimal,
        currency: &Currency,
        idempotency_key: &str,
        journal: &mut EventJournal,
    ) -> Result<EscrowEntry> {
        let now = self.clock.now();

        // Step 1: reserve the entry in PENDING.
        let previous = match self.entries.entry(match_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match entry.state {
                    EscrowState::Failed => {
                        entry.transition(EscrowState::Pending, now)?;
                        entry.payer = payer;
                        entry.amount = amount;
                        entry.currency = currency.clone();
                        entry.idempotency_key = idempotency_key.to_string();
                        entry.authorized_amount = Decimal::ZERO;
                        entry.processor_ref = None;
                        Some(EscrowState::Failed)
                    }
                    EscrowState::Pending => {
                        return Err(CarrylinkError::AuthorizationInFlight(match_id));
                    }
                    _ if entry.idempotency_key == idempotency_key => {
                        tracing::debug!(%match_id, state = %entry.state, "authorize replayed");
                        return Ok(entry.clone());
                    }
                    _ => return Err(CarrylinkError::AlreadyAuthorized(match_id)),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EscrowEntry::pending(
                    match_id,
                    payer,
                    amount,
                    currency.clone(),
                    idempotency_key,
                    now,
                ));
                None
            }
        };
        journal.applied(
            EventKind::Escrow {
                from: previous,
                to: EscrowState::Pending,
                amount,
            },
            now,
        );

        // Step 2: ask the processor for the hold.
        let outcome = self
            .call(
                self.processor
                    .authorize(amount, currency, payer, idempotency_key),
            )
            .await;
        let now = self.clock.now();
        let kind = EventKind::Escrow {
            from: Some(EscrowState::Pending),
            to: EscrowState::Authorized,
            amount,
        };
        match outcome {
            Ok(processor_ref) => {
                let entry = self.commit(match_id, EscrowState::Pending, now, |e| {
                    e.transition(EscrowState::Authorized, now)?;
                    e.authorized_amount = amount;
                    e.processor_ref = Some(processor_ref);
                    Ok(())
                })?;
                journal.applied(kind, now);
                tracing::info!(%match_id, %amount, %currency, "escrow authorized");
                Ok(entry)
            }
            Err(err) => {
                self.commit(match_id, EscrowState::Pending, now, |e| {
                    e.transition(EscrowState::Failed, now)
                })?;
                journal.rejected(
                    EventKind::Escrow {
                        from: Some(EscrowState::Pending),
                        to: EscrowState::Failed,
                        amount,
                    },
                    &err,
                    now,
                );
                tracing::warn!(%match_id, error = %err, "escrow authorization failed");
                Err(err)
            }
        }
    }

    /// Take the held funds: AUTHORIZED → CAPTURED.
    ///
    /// # Errors
    /// `EscrowNotFound`, `EscrowInvalidState` if not AUTHORIZED, or a
    /// processor error (entry unchanged).
    pub async fn capture(&self, match_id: MatchId, journal: &mut EventJournal) -> Result<EscrowEntry> {
        let current = self.expect_state(match_id, EscrowState::Authorized, EscrowState::Captured)?;
        let processor_ref = Self::processor_ref(&current)?;
        let amount = current.authorized_amount;
        let kind = EventKind::Escrow {
            from: Some(EscrowState::Authorized),
            to: EscrowState::Captured,
            amount,
        };

        let outcome = self.call(self.processor.capture(&processor_ref)).await;
        let now = self.clock.now();
        if let Err(err) = outcome {
            journal.rejected(kind, &err, now);
            tracing::warn!(%match_id, error = %err, "escrow capture failed");
            return Err(err);
        }

        let entry = self.commit(match_id, EscrowState::Authorized, now, |e| {
            e.transition(EscrowState::Captured, now)?;
            e.captured_amount = e.authorized_amount;
            Ok(())
        })?;
        journal.applied(kind, now);
        tracing::info!(%match_id, %amount, "escrow captured");
        Ok(entry)
    }

    /// Pay the held funds out to `to_party`: CAPTURED → RELEASED. Irreversible.
    ///
    /// # Errors
    /// `EscrowNotFound`, `EscrowInvalidState` if not CAPTURED, or a
    /// processor error (entry unchanged, safe to retry).
    pub async fn release(
        &self,
        match_id: MatchId,
        to_party: PartyId,
        journal: &mut EventJournal,
    ) -> Result<EscrowEntry> {
        let current = self.expect_state(match_id, EscrowState::Captured, EscrowState::Released)?;
        let processor_ref = Self::processor_ref(&current)?;
        let amount = current.held_amount();
        let kind = EventKind::Escrow {
            from: Some(EscrowState::Captured),
            to: EscrowState::Released,
            amount,
        };

        let outcome = self
            .call(self.processor.payout(&processor_ref, to_party, amount))
            .await;
        let now = self.clock.now();
        if let Err(err) = outcome {
            journal.rejected(kind, &err, now);
            tracing::warn!(%match_id, error = %err, "escrow release failed");
            return Err(err);
        }

        let entry = self.commit(match_id, EscrowState::Captured, now, |e| {
            e.transition(EscrowState::Released, now)?;
            e.released_amount += amount;
            e.released_to = Some(to_party);
            Ok(())
        })?;
        journal.applied(kind, now);
        tracing::info!(%match_id, %amount, payee = %to_party, "escrow released");
        Ok(entry)
    }

    /// Return funds to the payer: AUTHORIZED|CAPTURED → REFUNDED.
    ///
    /// An uncaptured hold is voided in full. For captured funds, `ratio`
    /// (0..=1) of the held amount is refunded, rounded to the currency's
    /// minor units; the remainder stays with the platform.
    ///
    /// # Errors
    /// `EscrowNotFound`, `EscrowInvalidState` if already RELEASED (or in any
    /// other non-refundable state), or a processor error (entry unchanged).
    pub async fn refund(
        &self,
        match_id: MatchId,
        ratio: Decimal,
        journal: &mut EventJournal,
    ) -> Result<EscrowEntry> {
        let current = self
            .entries
            .get(&match_id)
            .map(|e| e.clone())
            .ok_or(CarrylinkError::EscrowNotFound(match_id))?;
        let from = current.state;
        let amount = match from {
            EscrowState::Authorized => current.authorized_amount,
            EscrowState::Captured => {
                Money::new(current.held_amount(), current.currency.clone())
                    .portion(ratio.clamp(Decimal::ZERO, Decimal::ONE))
            }
            state => {
                return Err(CarrylinkError::EscrowInvalidState {
                    match_id,
                    state,
                    attempted: EscrowState::Refunded,
                });
            }
        };
        let processor_ref = Self::processor_ref(&current)?;
        let kind = EventKind::Escrow {
            from: Some(from),
            to: EscrowState::Refunded,
            amount,
        };

        if amount > Decimal::ZERO {
            let outcome = self.call(self.processor.refund(&processor_ref, amount)).await;
            if let Err(err) = outcome {
                journal.rejected(kind, &err, self.clock.now());
                tracing::warn!(%match_id, error = %err, "escrow refund failed");
                return Err(err);
            }
        }

        let now = self.clock.now();
        let entry = self.commit(match_id, from, now, |e| {
            e.transition(EscrowState::Refunded, now)?;
            e.refunded_amount += amount;
            Ok(())
        })?;
        journal.applied(kind, now);
        tracing::info!(%match_id, %amount, %from, "escrow refunded");
        Ok(entry)
    }

    /// Current entry for a match, if any.
    #[must_use]
    pub fn entry(&self, match_id: MatchId) -> Option<EscrowEntry> {
        self.entries.get(&match_id).map(|e| e.clone())
    }

    /// Current state for a match, if any.
    #[must_use]
    pub fn state(&self, match_id: MatchId) -> Option<EscrowState> {
        self.entries.get(&match_id).map(|e| e.state)
    }

    /// Number of entries tracked.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn expect_state(
        &self,
        match_id: MatchId,
        expected: EscrowState,
        attempted: EscrowState,
    ) -> Result<EscrowEntry> {
        let entry = self
            .entries
            .get(&match_id)
            .map(|e| e.clone())
            .ok_or(CarrylinkError::EscrowNotFound(match_id))?;
        if entry.state != expected {
            return Err(CarrylinkError::EscrowInvalidState {
                match_id,
                state: entry.state,
                attempted,
            });
        }
        Ok(entry)
    }

    fn processor_ref(entry: &EscrowEntry) -> Result<carrylink_types::ProcessorRef> {
        entry.processor_ref.clone().ok_or_else(|| {
            CarrylinkError::Internal(format!(
                "escrow {} is {} without a processor reference",
                entry.escrow_ref, entry.state
            ))
        })
    }

    /// Apply `f` to a copy of the entry, check invariants, and write it back
    /// only if the entry is still in `expected`.
    fn commit(
        &self,
        match_id: MatchId,
        expected: EscrowState,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut EscrowEntry) -> Result<()>,
    ) -> Result<EscrowEntry> {
        let mut slot = self
            .entries
            .get_mut(&match_id)
            .ok_or(CarrylinkError::EscrowNotFound(match_id))?;
        if slot.state != expected {
            return Err(CarrylinkError::Internal(format!(
                "escrow for {match_id} changed to {} while a processor call was in flight",
                slot.state
            )));
        }
        let mut next = slot.clone();
        f(&mut next)?;
        next.updated_at = now;
        next.check_invariants()?;
        *slot = next.clone();
        Ok(next)
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, ProcessorError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ProcessorError::Declined { reason })) => {
                Err(CarrylinkError::PaymentDeclined { reason })
            }
            Ok(Err(ProcessorError::Unavailable { reason })) => {
                Err(CarrylinkError::ProcessorUnavailable { reason })
            }
            Err(_) => Err(CarrylinkError::ProcessorTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}
