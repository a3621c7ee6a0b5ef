//! Configuration for the CarryLink engine.
//!
//! Loaded from JSON; every field has a default so partial documents work.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{constants, CarrylinkError, Currency, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a proposal may wait for its unlock.
    pub proposal_ttl_secs: u64,
    /// Lifetime of a delivery challenge.
    pub challenge_ttl_secs: u64,
    /// Upper bound on each payment processor call.
    pub processor_timeout_ms: u64,
    /// How long a request waits for the per-match lease.
    pub lease_wait_ms: u64,
    /// After this long in an unlocked status, one party may cancel alone.
    pub cancel_grace_secs: u64,
    /// When `true`, a successful scan stops at
    /// `delivery_pending_confirmation` and the sender must confirm receipt.
    pub require_sender_confirmation: bool,
    pub refund: RefundPolicy,
    pub fees: FeePolicy,
    /// Party-scoped idempotency records kept for `CreateMatch`.
    pub create_replay_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposal_ttl_secs: constants::DEFAULT_PROPOSAL_TTL_SECS,
            challenge_ttl_secs: constants::DEFAULT_CHALLENGE_TTL_SECS,
            processor_timeout_ms: constants::DEFAULT_PROCESSOR_TIMEOUT_MS,
            lease_wait_ms: constants::DEFAULT_LEASE_WAIT_MS,
            cancel_grace_secs: constants::DEFAULT_CANCEL_GRACE_SECS,
            require_sender_confirmation: false,
            refund: RefundPolicy::default(),
            fees: FeePolicy::default(),
            create_replay_cache_size: constants::CREATE_REPLAY_CACHE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns [`CarrylinkError::Configuration`] on malformed JSON or
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| CarrylinkError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("proposal_ttl_secs", self.proposal_ttl_secs),
            ("challenge_ttl_secs", self.challenge_ttl_secs),
            ("processor_timeout_ms", self.processor_timeout_ms),
            ("lease_wait_ms", self.lease_wait_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CarrylinkError::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.create_replay_cache_size == 0 {
            return Err(CarrylinkError::Configuration(
                "create_replay_cache_size must be > 0".into(),
            ));
        }
        self.refund.validate()?;
        self.fees.validate()
    }

    #[must_use]
    pub fn proposal_ttl(&self) -> chrono::Duration {
        secs(self.proposal_ttl_secs)
    }

    #[must_use]
    pub fn challenge_ttl(&self) -> chrono::Duration {
        secs(self.challenge_ttl_secs)
    }

    #[must_use]
    pub fn cancel_grace(&self) -> chrono::Duration {
        secs(self.cancel_grace_secs)
    }

    #[must_use]
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    #[must_use]
    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Share of the captured fee returned to the sender, per cancellation path.
///
/// Ratios are in `0..=1`; whatever is not refunded stays with the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefundPolicy {
    /// Cancelled from `contact_unlocked`.
    pub before_departure: Decimal,
    /// Cancelled from `in_transit`.
    pub after_departure: Decimal,
    /// Dispute resolved in the sender's favour.
    pub arbitration: Decimal,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            before_departure: Decimal::ONE,
            after_departure: Decimal::ONE,
            arbitration: Decimal::ONE,
        }
    }
}

impl RefundPolicy {
    fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("before_departure", self.before_departure),
            ("after_departure", self.after_departure),
            ("arbitration", self.arbitration),
        ] {
            if ratio < Decimal::ZERO || ratio > Decimal::ONE {
                return Err(CarrylinkError::Configuration(format!(
                    "refund.{name} must be within 0..=1, got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

/// Allowed unlock fee range for one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLimit {
    pub currency: Currency,
    pub min: Decimal,
    pub max: Decimal,
}

/// Currencies accepted for unlock fees and their bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub limits: Vec<FeeLimit>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        let limit = |code: &str, min: Decimal, max: Decimal| FeeLimit {
            currency: Currency::new(code),
            min,
            max,
        };
        Self {
            limits: vec![
                limit("USD", Decimal::new(100, 2), Decimal::new(50_000, 2)), // 1.00 ..= 500.00
                limit("EUR", Decimal::new(100, 2), Decimal::new(50_000, 2)),
                limit("INR", Decimal::new(4_900, 2), Decimal::new(4_999_900, 2)), // 49 ..= 49,999
            ],
        }
    }
}

impl FeePolicy {
    #[must_use]
    pub fn limit_for(&self, currency: &Currency) -> Option<&FeeLimit> {
        self.limits.iter().find(|l| &l.currency == currency)
    }

    fn validate(&self) -> Result<()> {
        if self.limits.is_empty() {
            return Err(CarrylinkError::Configuration(
                "fees.limits must list at least one currency".into(),
            ));
        }
        for limit in &self.limits {
            if !limit.currency.is_well_formed() {
                return Err(CarrylinkError::Configuration(format!(
                    "fees: malformed currency {}",
                    limit.currency
                )));
            }
            if limit.min <= Decimal::ZERO || limit.min > limit.max {
                return Err(CarrylinkError::Configuration(format!(
                    "fees: {} range {}..={} is invalid",
                    limit.currency, limit.min, limit.max
                )));
            }
        }
        Ok(())
    }
}
