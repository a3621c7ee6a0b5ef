//! System-wide constants for the CarryLink core.

/// Default unlock window for a proposed match (seconds).
pub const DEFAULT_PROPOSAL_TTL_SECS: u64 = 48 * 60 * 60;

/// Default lifetime of a delivery challenge (seconds).
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 72 * 60 * 60;

/// Default timeout for any single payment processor call (milliseconds).
pub const DEFAULT_PROCESSOR_TIMEOUT_MS: u64 = 10_000;

/// Default wait for the per-match lease before giving up (milliseconds).
pub const DEFAULT_LEASE_WAIT_MS: u64 = 15_000;

/// Default grace period after which one party may cancel an unlocked
/// match without the other's agreement (seconds).
pub const DEFAULT_CANCEL_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Random bytes per delivery token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Prefix of the QR payload, versioned so the format can evolve.
pub const TOKEN_PREFIX: &str = "cl1.";

/// Maximum idempotency key length in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Maximum dispute reason length in characters.
pub const MAX_DISPUTE_REASON_LEN: usize = 1000;

/// Party-scoped idempotency records to remember for `CreateMatch`.
pub const CREATE_REPLAY_CACHE_SIZE: usize = 100_000;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "CarryLink";
