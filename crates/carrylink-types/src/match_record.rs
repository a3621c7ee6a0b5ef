//! # Match: a trip/request pairing and its lifecycle graph
//!
//! ## State Machine
//!
//! ```text
//!   PROPOSED ──unlock_requested──▶ CONTACT_UNLOCKED ──carrier_departs──▶ IN_TRANSIT
//!    │    │                           │                                   │    │
//!    │    └─expiry_reached─▶ EXPIRED  └──cancel_after_unlock─▶ CANCELLED ◀┘    │ delivery_scan
//!    └──────cancel──────────────────────────────────────────▶ CANCELLED       ▼
//!                                                       DELIVERY_PENDING_CONFIRMATION
//!                                                                             │ confirm
//!                                                                             ▼
//!                                                                          COMPLETED
//!
//!   IN_TRANSIT | DELIVERY_PENDING_CONFIRMATION ──raise_dispute──▶ DISPUTED
//!   DISPUTED ──resolve_release──▶ COMPLETED
//!   DISPUTED ──resolve_refund───▶ CANCELLED
//! ```
//!
//! The graph here is purely structural. Guards (expiry, party checks,
//! grace periods, token validity) live in the state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EscrowRef, MatchId, Money, PartyId, RequestId, TripId};

/// Lifecycle status of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Paired by the matching trigger; contact details still hidden.
    Proposed,
    /// Unlock fee captured into escrow; parties can talk.
    ContactUnlocked,
    /// Carrier departed with the parcel; delivery challenge issued.
    InTransit,
    /// Both QR tokens verified; waiting for release of funds.
    DeliveryPendingConfirmation,
    /// Funds released to the carrier. Terminal.
    Completed,
    /// Funds frozen until external arbitration.
    Disputed,
    /// Cancelled, with a refund if anything was captured. Terminal.
    Cancelled,
    /// Proposal never unlocked in time. Terminal.
    Expired,
}

impl MatchStatus {
    /// Whether no further lifecycle events can apply (other than an
    /// inconsistency forcing `Disputed`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Whether the match occupies its (trip, request) pair.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Structural target of `event` from this status, or `None` if the
    /// event is not defined here.
    #[must_use]
    pub fn target(self, event: LifecycleEvent) -> Option<Self> {
        use LifecycleEvent as E;
        match (self, event) {
            (Self::Proposed, E::UnlockRequested) => Some(Self::ContactUnlocked),
            (Self::Proposed, E::ExpiryReached) => Some(Self::Expired),
            (Self::Proposed, E::Cancel) => Some(Self::Cancelled),
            (Self::ContactUnlocked, E::CarrierDeparts) => Some(Self::InTransit),
            (Self::InTransit, E::DeliveryScan) => Some(Self::DeliveryPendingConfirmation),
            (Self::InTransit, E::ReissueChallenge) => Some(Self::InTransit),
            (Self::DeliveryPendingConfirmation, E::Confirm) => Some(Self::Completed),
            (Self::InTransit | Self::DeliveryPendingConfirmation, E::RaiseDispute) => {
                Some(Self::Disputed)
            }
            (Self::ContactUnlocked | Self::InTransit, E::CancelAfterUnlock) => {
                Some(Self::Cancelled)
            }
            (Self::Disputed, E::ResolveRelease) => Some(Self::Completed),
            (Self::Disputed, E::ResolveRefund) => Some(Self::Cancelled),
            (from, E::InconsistencyDetected) if from != Self::Disputed && !from.is_terminal() => {
                Some(Self::Disputed)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed => write!(f, "PROPOSED"),
            Self::ContactUnlocked => write!(f, "CONTACT_UNLOCKED"),
            Self::InTransit => write!(f, "IN_TRANSIT"),
            Self::DeliveryPendingConfirmation => write!(f, "DELIVERY_PENDING_CONFIRMATION"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Disputed => write!(f, "DISPUTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Events that drive a match through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    UnlockRequested,
    ExpiryReached,
    Cancel,
    CarrierDeparts,
    DeliveryScan,
    Confirm,
    RaiseDispute,
    CancelAfterUnlock,
    /// Carrier asks for a fresh challenge after the previous one expired.
    ReissueChallenge,
    /// Arbitration decided in favour of the carrier.
    ResolveRelease,
    /// Arbitration decided in favour of the sender.
    ResolveRefund,
    /// Match and escrow disagree; the match is frozen for review.
    InconsistencyDetected,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnlockRequested => "unlock_requested",
            Self::ExpiryReached => "expiry_reached",
            Self::Cancel => "cancel",
            Self::CarrierDeparts => "carrier_departs",
            Self::DeliveryScan => "delivery_scan",
            Self::Confirm => "confirm",
            Self::RaiseDispute => "raise_dispute",
            Self::CancelAfterUnlock => "cancel_after_unlock",
            Self::ReissueChallenge => "reissue_challenge",
            Self::ResolveRelease => "resolve_release",
            Self::ResolveRefund => "resolve_refund",
            Self::InconsistencyDetected => "inconsistency_detected",
        };
        f.write_str(name)
    }
}

/// Which side of the match a party is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Carrier,
    Sender,
}

/// Why and by whom a match was frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeInfo {
    /// `None` when the dispute was raised by the consistency check.
    pub raised_by: Option<PartyId>,
    pub reason: String,
    /// Status the match was in when the dispute was raised.
    pub raised_from: MatchStatus,
    pub raised_at: DateTime<Utc>,
}

/// A pairing between one trip and one request.
///
/// The match references parties, trips and requests but owns none of them.
/// Escrow funds are owned by the ledger; the match only holds `escrow_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub trip_id: TripId,
    pub request_id: RequestId,
    pub carrier_id: PartyId,
    pub sender_id: PartyId,
    pub status: MatchStatus,
    /// Set once the unlock fee has been authorized.
    pub escrow_ref: Option<EscrowRef>,
    pub unlock_fee: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Proposals auto-expire if not unlocked by this time.
    pub expires_at: DateTime<Utc>,
    /// When the current status was entered.
    pub status_since: DateTime<Utc>,
    /// Party waiting for the counter-party to agree to a cancellation.
    pub cancel_requested_by: Option<PartyId>,
    pub dispute: Option<DisputeInfo>,
    /// Set once the delivery challenge has been verified.
    pub challenge_verified: bool,
    /// Optimistic concurrency counter, bumped on every committed write.
    pub version: u64,
}

impl Match {
    /// Which side of this match `party` is on, if any.
    #[must_use]
    pub fn role_of(&self, party: PartyId) -> Option<PartyRole> {
        if party == self.carrier_id {
            Some(PartyRole::Carrier)
        } else if party == self.sender_id {
            Some(PartyRole::Sender)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_party(&self, party: PartyId) -> bool {
        self.role_of(party).is_some()
    }

    #[must_use]
    pub fn counterparty(&self, party: PartyId) -> Option<PartyId> {
        match self.role_of(party)? {
            PartyRole::Carrier => Some(self.sender_id),
            PartyRole::Sender => Some(self.carrier_id),
        }
    }

    /// Whether a still-proposed match has passed its unlock window.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == MatchStatus::Proposed && now > self.expires_at
    }

    /// Move to `to`, stamping the bookkeeping timestamps. Does not check
    /// the graph; callers go through [`MatchStatus::target`] first.
    pub fn enter(&mut self, to: MatchStatus, now: DateTime<Utc>) {
        self.status = to;
        self.status_since = now;
        self.updated_at = now;
        self.cancel_requested_by = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Currency;
    use rust_decimal::Decimal;

    fn sample() -> Match {
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
            expires_at: now + chrono::Duration::hours(1),
            status_since: now,
            cancel_requested_by: None,
            dispute: None,
            challenge_verified: false,
            version: 0,
        }
    }

    #[test]
    fn happy_path_is_structurally_valid() {
        use LifecycleEvent as E;
        let mut s = MatchStatus::Proposed;
        for e in [E::UnlockRequested, E::CarrierDeparts, E::DeliveryScan, E::Confirm] {
            s = s.target(e).unwrap();
        }
        assert_eq!(s, MatchStatus::Completed);
    }

    #[test]
    fn completed_not_reachable_from_in_transit_directly() {
        assert_eq!(MatchStatus::InTransit.target(LifecycleEvent::Confirm), None);
        assert_eq!(MatchStatus::Proposed.target(LifecycleEvent::DeliveryScan), None);
    }

    #[test]
    fn dispute_only_after_departure() {
        assert_eq!(MatchStatus::Proposed.target(LifecycleEvent::RaiseDispute), None);
        assert_eq!(
            MatchStatus::ContactUnlocked.target(LifecycleEvent::RaiseDispute),
            None
        );
        assert_eq!(
            MatchStatus::InTransit.target(LifecycleEvent::RaiseDispute),
            Some(MatchStatus::Disputed)
        );
    }

    #[test]
    fn disputed_only_leaves_through_resolution() {
        for e in [
            LifecycleEvent::Confirm,
            LifecycleEvent::DeliveryScan,
            LifecycleEvent::CancelAfterUnlock,
            LifecycleEvent::InconsistencyDetected,
        ] {
            assert_eq!(MatchStatus::Disputed.target(e), None, "{e}");
        }
        assert_eq!(
            MatchStatus::Disputed.target(LifecycleEvent::ResolveRefund),
            Some(MatchStatus::Cancelled)
        );
    }

    #[test]
    fn terminals_reject_lifecycle_events() {
        for s in [MatchStatus::Completed, MatchStatus::Cancelled, MatchStatus::Expired] {
            assert!(s.is_terminal());
            assert_eq!(s.target(LifecycleEvent::Cancel), None);
            assert_eq!(s.target(LifecycleEvent::CancelAfterUnlock), None);
        }
    }

    #[test]
    fn terminals_reject_inconsistency() {
        for s in [MatchStatus::Completed, MatchStatus::Cancelled, MatchStatus::Expired] {
            assert_eq!(s.target(LifecycleEvent::InconsistencyDetected), None, "{s}");
        }
        assert_eq!(
            MatchStatus::InTransit.target(LifecycleEvent::InconsistencyDetected),
            Some(MatchStatus::Disputed)
        );
    }

    #[test]
    fn roles_and_counterparty() {
        let m = sample();
        assert_eq!(m.role_of(m.carrier_id), Some(PartyRole::Carrier));
        assert_eq!(m.counterparty(m.sender_id), Some(m.carrier_id));
        assert_eq!(m.role_of(PartyId::new()), None);
    }

    #[test]
    fn expiry_only_applies_to_proposals() {
        let mut m = sample();
        let later = m.expires_at + chrono::Duration::seconds(1);
        assert!(m.is_expired_at(later));
        m.status = MatchStatus::ContactUnlocked;
        assert!(!m.is_expired_at(later));
    }

    #[test]
    fn enter_clears_pending_cancellation() {
        let mut m = sample();
        m.cancel_requested_by = Some(m.sender_id);
        let now = Utc::now();
        m.enter(MatchStatus::Cancelled, now);
        assert_eq!(m.cancel_requested_by, None);
        assert_eq!(m.status_since, now);
    }

    #[test]
    fn serde_roundtrip() {
        let m = sample();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"proposed\""));
        let back: Match = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
