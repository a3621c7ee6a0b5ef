//! # carrylink-types
//!
//! Shared types, errors, and configuration for the **CarryLink** match
//! lifecycle and escrow-release core.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`MatchId`], [`PartyId`], [`TripId`], [`RequestId`], [`EscrowRef`], [`EventId`]
//! - **Money**: [`Money`], [`Currency`]
//! - **Match model**: [`Match`], [`MatchStatus`], [`LifecycleEvent`], [`PartyRole`], [`DisputeInfo`]
//! - **Escrow model**: [`EscrowEntry`], [`EscrowState`], [`ProcessorRef`]
//! - **Challenge model**: [`ChallengeGrant`], [`DeliveryToken`], [`ChallengeStatus`], [`VerificationResult`]
//! - **Audit log**: [`MatchEvent`], [`EventKind`], [`EventOutcome`], [`EventJournal`]
//! - **Callers**: [`Principal`], [`PrincipalRole`], [`AuthToken`]
//! - **Configuration**: [`EngineConfig`], [`RefundPolicy`], [`FeePolicy`]
//! - **Errors**: [`CarrylinkError`] with `CL_ERR_` prefix codes, [`ErrorClass`]
//! - **Time**: [`Clock`], [`SystemClock`]
//! - **Constants**: system-wide limits and defaults

pub mod challenge;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod escrow;
pub mod event;
pub mod ids;
pub mod match_record;
pub mod money;
pub mod principal;

// Re-export all primary types at crate root for ergonomic imports:
//   use carrylink_types::{Match, MatchStatus, EscrowEntry, ...};

pub use challenge::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use escrow::*;
pub use event::*;
pub use ids::*;
pub use match_record::*;
pub use money::*;
pub use principal::*;

// Constants are accessed via `carrylink_types::constants::FOO`
// (not re-exported to avoid name collisions).
