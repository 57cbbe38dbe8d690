//! Money Validation Module
//!
//! Currency codes and fixed-point amounts as they enter the engine.
//! All amounts that get hashed or signed MUST go through [`normalize_amount`].
//!
//! ## Design Principles
//! 1. Explicit Error Handling: no silent truncation or rounding
//! 2. Canonical Form: the same value always renders to the same string
//! 3. Type Safety: currency codes are a validated newtype
//!
//! ## Usage
//! ```rust
//! use rust_decimal::Decimal;
//! use transfer_ledger::money::{normalize_amount, Currency};
//!
//! let sar = Currency::parse("SAR").unwrap();
//! assert_eq!(sar.as_str(), "SAR");
//!
//! let amount = normalize_amount(Decimal::new(10050, 2)).unwrap();
//! assert_eq!(amount.to_string(), "100.5");
//! ```

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Maximum fractional digits accepted for any amount
pub const MAX_SCALE: u32 = 8;

/// Length of a currency code (ISO 4217 style)
pub const CURRENCY_CODE_LEN: usize = 3;

// ============================================================================
// Error Types
// ============================================================================

/// Money validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Currency code is missing")]
    MissingCurrency,

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },
}

// ============================================================================
// Currency
// ============================================================================

/// Validated currency code (three uppercase ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse and validate a currency code.
    ///
    /// Surrounding whitespace is ignored; lowercase is rejected rather than
    /// silently upper-cased so the caller sees exactly what gets hashed.
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(MoneyError::MissingCurrency);
        }
        if code.len() != CURRENCY_CODE_LEN || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::parse(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

// ============================================================================
// Amounts
// ============================================================================

/// Validate a transfer amount and return its canonical form.
///
/// # Errors
/// * `InvalidAmount` - zero or negative
/// * `PrecisionOverflow` - more than [`MAX_SCALE`] significant fractional digits
pub fn normalize_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    let normalized = amount.normalize();
    if normalized.scale() > MAX_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MAX_SCALE,
        });
    }
    Ok(normalized)
}

/// Canonical string used in Merkle leaves and signing payloads
pub fn canonical_amount(amount: &Decimal) -> String {
    amount.normalize().to_string()
}
