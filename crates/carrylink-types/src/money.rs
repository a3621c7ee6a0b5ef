//! Monetary amounts for unlock fees and escrow entries.
//!
//! Amounts are `Decimal` in major units (e.g. `20.00` USD). A currency
//! knows its minor-unit scale so refunds can be rounded to a payable value.

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// ISO-4217 style currency code (upper-case, three letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Whether the code is three upper-case ASCII letters.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 3 && self.0.bytes().all(|b| b.is_ascii_uppercase())
    }

    /// Number of decimal places in the currency's minor unit.
    #[must_use]
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An amount in a specific currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    #[must_use]
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Whether the amount carries more precision than the currency allows.
    #[must_use]
    pub fn exceeds_minor_units(&self) -> bool {
        self.amount.normalize().scale() > self.currency.minor_units()
    }

    /// `self.amount * ratio`, rounded half-even to the currency's minor units.
    #[must_use]
    pub fn portion(&self, ratio: Decimal) -> Decimal {
        (self.amount * ratio).round_dp_with_strategy(
            self.currency.minor_units(),
            RoundingStrategy::MidpointNearestEven,
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
