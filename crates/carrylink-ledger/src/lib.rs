//! # carrylink-ledger
//!
//! **Escrow Ledger**: tracks money held, captured, released and refunded
//! for each match. It is the source of truth for funds state and a thin
//! layer above an external [`PaymentProcessor`].
//!
//! ## Flow
//!
//! ```text
//! unlock   → authorize() → capture()          PENDING → AUTHORIZED → CAPTURED
//! delivery → release(carrier)                 CAPTURED → RELEASED
//! cancel   → refund(ratio)                    AUTHORIZED|CAPTURED → REFUNDED
//! ```
//!
//! Processor calls are bounded by a timeout; a hung authorization leaves
//! the entry FAILED rather than PENDING forever.

pub mod ledger;
pub mod processor;

pub use ledger::EscrowLedger;
pub use processor::{PaymentProcessor, ProcessorError};

#[cfg(any(test, feature = "test-helpers"))]
pub use processor::{ScriptedProcessor, Step};
