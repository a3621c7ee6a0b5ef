//! # carrylink-lifecycle
//!
//! **Match State Machine** and **Match Service**: drives a match from
//! proposal to payout, coordinating the escrow ledger and the delivery
//! challenge engine.
//!
//! ## Lifecycle
//!
//! ```text
//! create_match              → PROPOSED
//! unlock_contact            → CONTACT_UNLOCKED   (fee authorized + captured)
//! issue_delivery_challenge  → IN_TRANSIT         (QR token pair minted)
//! confirm_delivery          → COMPLETED          (both tokens verified, funds released)
//!                             └ or DELIVERY_PENDING_CONFIRMATION in two-step mode
//! confirm_receipt           → COMPLETED
//! raise_dispute             → DISPUTED           (funds frozen)
//! resolve_dispute           → COMPLETED | CANCELLED
//! cancel_match              → CANCELLED          (refund per policy)
//! ```
//!
//! ## Guarantees
//!
//! - Mutations on one match are serialized by a per-match lease
//! - Every mutation is idempotent per `(match, key)`
//! - A transition, its audit events and its idempotency record commit together
//! - A match whose status disagrees with its escrow is frozen as disputed

pub mod identity;
pub mod idempotency;
pub mod lease;
mod machine;
pub mod repository;
pub mod service;

pub use identity::{IdentityProvider, StaticIdentity};
pub use idempotency::{IdempotencyRecord, Operation, Reply};
pub use machine::Resolution;
pub use repository::{InMemoryMatchRepository, MatchRepository};
pub use service::{MatchService, NewMatch};
