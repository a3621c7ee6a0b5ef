//! Error types for the CarryLink match lifecycle.
//!
//! All errors use the `CL_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Match / request errors
//! - 2xx: Escrow and payment errors
//! - 3xx: Delivery challenge errors
//! - 4xx: Concurrency and storage errors
//! - 5xx: Consistency errors
//! - 9xx: General / internal errors
//!
//! Every error maps to an [`ErrorClass`] so the API layer can tell a
//! declined card from a wrong QR code from an already-finished delivery.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EscrowState, LifecycleEvent, MatchId, MatchStatus};

/// Central error enum for all CarryLink operations.
///
/// `Clone` so that idempotent replays can hand back the original failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CarrylinkError {
    // =================================================================
    // Match / Request Errors (1xx)
    // =================================================================
    /// No match with this id.
    #[error("CL_ERR_100: Match not found: {0}")]
    MatchNotFound(MatchId),

    /// The event is not defined for the match's current status.
    #[error("CL_ERR_101: Illegal transition: {event} not allowed from {from}")]
    IllegalTransition {
        from: MatchStatus,
        event: LifecycleEvent,
    },

    /// The proposal passed its unlock window.
    #[error("CL_ERR_102: Match {0} expired before it was unlocked")]
    MatchExpired(MatchId),

    /// Caller is not the carrier or sender of this match.
    #[error("CL_ERR_103: Caller is not a party to match {0}")]
    NotAParty(MatchId),

    /// Credentials were missing or rejected by the identity provider.
    #[error("CL_ERR_104: Unauthenticated: {reason}")]
    Unauthenticated { reason: String },

    /// Caller is a party but their role may not perform this action.
    #[error("CL_ERR_105: Forbidden: {reason}")]
    Forbidden { reason: String },

    /// Request payload failed shape or amount validation.
    #[error("CL_ERR_106: Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The trip/request pair already has a live match.
    #[error("CL_ERR_107: Duplicate match: pair already matched as {0}")]
    DuplicateMatch(MatchId),

    /// The idempotency key was already used for a different operation.
    #[error("CL_ERR_108: Idempotency key reused for {previous}, now {attempted}")]
    IdempotencyKeyReused {
        previous: String,
        attempted: String,
    },

    // =================================================================
    // Escrow / Payment Errors (2xx)
    // =================================================================
    /// No escrow entry exists for this match.
    #[error("CL_ERR_200: Escrow entry not found for {0}")]
    EscrowNotFound(MatchId),

    /// An authorization already exists under a different idempotency key.
    #[error("CL_ERR_201: Escrow already authorized for {0}")]
    AlreadyAuthorized(MatchId),

    /// The ledger operation is not valid for the entry's state.
    #[error("CL_ERR_202: Escrow for {match_id} is {state}, cannot move to {attempted}")]
    EscrowInvalidState {
        match_id: MatchId,
        state: EscrowState,
        attempted: EscrowState,
    },

    /// The payment processor refused the hold.
    #[error("CL_ERR_203: Payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// The payment processor did not answer in time.
    #[error("CL_ERR_204: Payment processor timed out after {timeout_ms}ms")]
    ProcessorTimeout { timeout_ms: u64 },

    /// The payment processor is unreachable or failed internally.
    #[error("CL_ERR_205: Payment processor unavailable: {reason}")]
    ProcessorUnavailable { reason: String },

    /// Another authorization for this match is still in flight.
    #[error("CL_ERR_206: Authorization already in flight for {0}")]
    AuthorizationInFlight(MatchId),

    /// Amount bookkeeping broke an escrow invariant. Critical alert.
    #[error("CL_ERR_207: Escrow invariant violation for {match_id}: {reason}")]
    EscrowInvariantViolation { match_id: MatchId, reason: String },

    /// The amount does not fit the configured fee policy.
    #[error("CL_ERR_208: Amount {amount} outside allowed range {min}..={max}")]
    AmountOutOfRange {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },

    // =================================================================
    // Delivery Challenge Errors (3xx)
    // =================================================================
    /// A challenge was already issued for this match.
    #[error("CL_ERR_300: Delivery challenge already issued for {0}")]
    AlreadyIssued(MatchId),

    /// The challenge was already verified once.
    #[error("CL_ERR_301: Delivery challenge already consumed")]
    AlreadyConsumed,

    /// One or both presented tokens do not match.
    #[error("CL_ERR_302: Invalid delivery token")]
    InvalidToken,

    /// The challenge expired before it was verified.
    #[error("CL_ERR_303: Delivery challenge expired")]
    ChallengeExpired,

    /// No challenge exists for this match.
    #[error("CL_ERR_304: Delivery challenge not found for {0}")]
    ChallengeNotFound(MatchId),

    /// Reissue requested while the current challenge is still usable.
    #[error("CL_ERR_305: Delivery challenge for {0} has not expired")]
    ChallengeNotExpired(MatchId),

    // =================================================================
    // Concurrency / Storage Errors (4xx)
    // =================================================================
    /// The per-match lease could not be acquired in time.
    #[error("CL_ERR_400: Match {match_id} busy, lease not acquired within {waited_ms}ms")]
    LeaseTimeout { match_id: MatchId, waited_ms: u64 },

    /// Optimistic concurrency check failed on commit.
    #[error("CL_ERR_401: Version conflict on {match_id}: expected {expected}, found {found}")]
    VersionConflict {
        match_id: MatchId,
        expected: u64,
        found: u64,
    },

    /// The storage collaborator failed.
    #[error("CL_ERR_402: Storage error: {0}")]
    Storage(String),

    // =================================================================
    // Consistency Errors (5xx)
    // =================================================================
    /// Match and escrow disagree; the match has been forced into dispute.
    #[error("CL_ERR_500: Inconsistent state for {match_id}: {reason}")]
    InconsistentState { match_id: MatchId, reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("CL_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("CL_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("CL_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

/// Coarse category for surfacing an error to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    /// The request contradicts the current state (already done, wrong step).
    Conflict,
    /// The payer must fix their payment method.
    PaymentRequired,
    /// The time window closed.
    Gone,
    /// Try again later.
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PaymentRequired => "payment_required",
            Self::Gone => "gone",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl CarrylinkError {
    /// The `CL_ERR_nnn` code of this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MatchNotFound(_) => "CL_ERR_100",
            Self::IllegalTransition { .. } => "CL_ERR_101",
            Self::MatchExpired(_) => "CL_ERR_102",
            Self::NotAParty(_) => "CL_ERR_103",
            Self::Unauthenticated { .. } => "CL_ERR_104",
            Self::Forbidden { .. } => "CL_ERR_105",
            Self::InvalidRequest { .. } => "CL_ERR_106",
            Self::DuplicateMatch(_) => "CL_ERR_107",
            Self::IdempotencyKeyReused { .. } => "CL_ERR_108",
            Self::EscrowNotFound(_) => "CL_ERR_200",
            Self::AlreadyAuthorized(_) => "CL_ERR_201",
            Self::EscrowInvalidState { .. } => "CL_ERR_202",
            Self::PaymentDeclined { .. } => "CL_ERR_203",
            Self::ProcessorTimeout { .. } => "CL_ERR_204",
            Self::ProcessorUnavailable { .. } => "CL_ERR_205",
            Self::AuthorizationInFlight(_) => "CL_ERR_206",
            Self::EscrowInvariantViolation { .. } => "CL_ERR_207",
            Self::AmountOutOfRange { .. } => "CL_ERR_208",
            Self::AlreadyIssued(_) => "CL_ERR_300",
            Self::AlreadyConsumed => "CL_ERR_301",
            Self::InvalidToken => "CL_ERR_302",
            Self::ChallengeExpired => "CL_ERR_303",
            Self::ChallengeNotFound(_) => "CL_ERR_304",
            Self::ChallengeNotExpired(_) => "CL_ERR_305",
            Self::LeaseTimeout { .. } => "CL_ERR_400",
            Self::VersionConflict { .. } => "CL_ERR_401",
            Self::Storage(_) => "CL_ERR_402",
            Self::InconsistentState { .. } => "CL_ERR_500",
            Self::Internal(_) => "CL_ERR_900",
            Self::Serialization(_) => "CL_ERR_901",
            Self::Configuration(_) => "CL_ERR_902",
        }
    }

    /// Client-facing category.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest { .. } | Self::AmountOutOfRange { .. } => ErrorClass::BadRequest,
            Self::Unauthenticated { .. } => ErrorClass::Unauthorized,
            Self::NotAParty(_) | Self::Forbidden { .. } => ErrorClass::Forbidden,
            Self::MatchNotFound(_) | Self::EscrowNotFound(_) | Self::ChallengeNotFound(_) => {
                ErrorClass::NotFound
            }
            Self::IllegalTransition { .. }
            | Self::DuplicateMatch(_)
            | Self::IdempotencyKeyReused { .. }
            | Self::AlreadyAuthorized(_)
            | Self::EscrowInvalidState { .. }
            | Self::AuthorizationInFlight(_)
            | Self::AlreadyIssued(_)
            | Self::AlreadyConsumed
            | Self::InvalidToken
            | Self::ChallengeNotExpired(_)
            | Self::InconsistentState { .. } => ErrorClass::Conflict,
            Self::PaymentDeclined { .. } => ErrorClass::PaymentRequired,
            Self::MatchExpired(_) | Self::ChallengeExpired => ErrorClass::Gone,
            Self::ProcessorTimeout { .. }
            | Self::ProcessorUnavailable { .. }
            | Self::LeaseTimeout { .. }
            | Self::VersionConflict { .. }
            | Self::Storage(_) => ErrorClass::Unavailable,
            Self::EscrowInvariantViolation { .. }
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Configuration(_) => ErrorClass::Internal,
        }
    }

    /// Transient failures: the same request may succeed later, so their
    /// outcome is never cached against an idempotency key.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Unavailable || matches!(self, Self::AuthorizationInFlight(_))
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, CarrylinkError>;

impl From<serde_json::Error> for CarrylinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
