//! # carrylink-challenge
//!
//! **QR Challenge Engine**: issues and verifies the single-use,
//! time-bounded token pair that proves carrier and sender met at handoff.
//!
//! - Tokens carry 256 bits of OS randomness; only bound digests are stored
//! - Verification needs both tokens in one call and succeeds at most once
//! - Expiry is enforced at verification time; no sweep is required

pub mod engine;
mod token;

pub use engine::ChallengeEngine;
