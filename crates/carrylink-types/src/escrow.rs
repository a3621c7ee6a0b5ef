//! # EscrowEntry: funds held for a match
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐ processor ok ┌────────────┐ capture ┌──────────┐ release ┌──────────┐
//!   │ PENDING ├─────────────▶│ AUTHORIZED ├────────▶│ CAPTURED ├────────▶│ RELEASED │
//!   └──┬──────┘              └─────┬──────┘         └────┬─────┘         └──────────┘
//!      │ declined / timeout        │ refund (void)       │ refund
//!      ▼                           ▼                     ▼
//!   ┌────────┐  re-authorize   ┌──────────┐◀─────────────┘
//!   │ FAILED ├───▶ PENDING     │ REFUNDED │
//!   └────────┘                 └──────────┘
//! ```
//!
//! ## Amount invariants
//!
//! - `captured_amount <= authorized_amount`
//! - `released_amount + refunded_amount <= captured_amount` once captured
//! - `refunded_amount <= authorized_amount` for a voided hold

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CarrylinkError, Currency, EscrowRef, MatchId, PartyId, Result};

/// Lifecycle state of an escrow entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    /// Authorization sent to the processor, no answer yet.
    Pending,
    /// Hold placed on the payer's funds.
    Authorized,
    /// Funds taken from the payer and held by the platform.
    Captured,
    /// Funds paid out to the carrier. **Irreversible.**
    Released,
    /// Hold voided or captured funds returned to the payer.
    Refunded,
    /// Authorization declined or timed out. May be re-authorized.
    Failed,
}

impl EscrowState {
    /// Can this entry transition to the given target state?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Authorized | Self::Failed)
                | (Self::Authorized, Self::Captured | Self::Refunded)
                | (Self::Captured, Self::Released | Self::Refunded)
                | (Self::Failed, Self::Pending)
        )
    }

    /// Whether the entry still holds the payer's money in some form.
    #[must_use]
    pub fn holds_funds(&self) -> bool {
        matches!(self, Self::Authorized | Self::Captured)
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Authorized => write!(f, "AUTHORIZED"),
            Self::Captured => write!(f, "CAPTURED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Opaque reference returned by the payment processor for a hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessorRef(pub String);

impl fmt::Display for ProcessorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The ledger's record of funds for one match. Owned exclusively by the
/// ledger; matches hold only the [`EscrowRef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEntry {
    pub escrow_ref: EscrowRef,
    pub match_id: MatchId,
    pub payer: PartyId,
    pub state: EscrowState,
    /// Requested amount.
    pub amount: Decimal,
    pub currency: Currency,
    pub authorized_amount: Decimal,
    pub captured_amount: Decimal,
    pub released_amount: Decimal,
    pub refunded_amount: Decimal,
    /// Key of the authorization attempt that created the current hold.
    pub idempotency_key: String,
    pub processor_ref: Option<ProcessorRef>,
    pub released_to: Option<PartyId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowEntry {
    /// A fresh entry in PENDING state, before the processor is called.
    #[must_use]
    pub fn pending(
        match_id: MatchId,
        payer: PartyId,
        amount: Decimal,
        currency: Currency,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            escrow_ref: EscrowRef::for_match(match_id),
            match_id,
            payer,
            state: EscrowState::Pending,
            amount,
            currency,
            authorized_amount: Decimal::ZERO,
            captured_amount: Decimal::ZERO,
            released_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            idempotency_key: idempotency_key.to_string(),
            processor_ref: None,
            released_to: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target` if the graph allows it.
    ///
    /// # Errors
    /// Returns [`CarrylinkError::EscrowInvalidState`] on an illegal move.
    pub fn transition(&mut self, target: EscrowState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(CarrylinkError::EscrowInvalidState {
                match_id: self.match_id,
                state: self.state,
                attempted: target,
            });
        }
        self.state = target;
        self.updated_at = now;
        Ok(())
    }

    /// Check the amount invariants.
    ///
    /// # Errors
    /// Returns [`CarrylinkError::EscrowInvariantViolation`] describing the
    /// first broken invariant.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |reason: String| {
            Err(CarrylinkError::EscrowInvariantViolation {
                match_id: self.match_id,
                reason,
            })
        };
        if self.captured_amount > self.authorized_amount {
            return violation(format!(
                "captured {} exceeds authorized {}",
                self.captured_amount, self.authorized_amount
            ));
        }
        if self.captured_amount > Decimal::ZERO {
            let paid_out = self.released_amount + self.refunded_amount;
            if paid_out > self.captured_amount {
                return violation(format!(
                    "released {} + refunded {} exceeds captured {}",
                    self.released_amount, self.refunded_amount, self.captured_amount
                ));
            }
        } else if self.released_amount > Decimal::ZERO {
            return violation(format!(
                "released {} without a capture",
                self.released_amount
            ));
        } else if self.refunded_amount > self.authorized_amount {
            return violation(format!(
                "voided {} exceeds authorized {}",
                self.refunded_amount, self.authorized_amount
            ));
        }
        Ok(())
    }

    /// Captured funds still held by the platform.
    #[must_use]
    pub fn held_amount(&self) -> Decimal {
        self.captured_amount - self.released_amount - self.refunded_amount
    }
}
