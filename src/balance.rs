/// ENFORCED BALANCE TYPE - Used by LedgerCommitCoordinator
///
/// This is the SINGLE source of truth for balance mutations.
/// ALL balance changes MUST go through these methods.
///
/// # Enforcement Strategy:
/// 1. Fields are PRIVATE - no direct access
/// 2. All mutations return Result - errors are explicit
/// 3. Version auto-increments - audit trail
/// 4. checked_add/sub - overflow protection
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::AccountId;
use crate::money::Currency;

/// Balance mutation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("Amount must be positive")]
    NonPositiveAmount,

    #[error("Balance overflow")]
    Overflow,
}

/// Key of a balance cell: one per (account, currency)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub account: AccountId,
    pub currency: Currency,
}

impl BalanceKey {
    pub fn new(account: impl Into<AccountId>, currency: Currency) -> Self {
        Self {
            account: account.into(),
            currency,
        }
    }
}

/// Balance for a single (account, currency) cell
///
/// # Invariants (ENFORCED by private fields):
/// - avail is never negative
/// - version increments on every successful mutation
/// - No overflow (checked arithmetic)
///
/// # Usage:
/// ```ignore
/// let mut balance = Balance::default();
/// balance.credit(Decimal::from(1000))?;  // avail = 1000, version = 1
/// balance.debit(Decimal::from(400))?;    // avail = 600,  version = 2
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    avail: Decimal, // PRIVATE - ONLY modified through credit/debit
    version: u64,   // PRIVATE - Incremented on every mutation
}

impl Balance {
    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    /// Get available balance (read-only)
    #[inline(always)]
    pub const fn avail(&self) -> Decimal {
        self.avail
    }

    /// Get mutation version (read-only)
    #[inline(always)]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether `amount` can be debited right now
    #[inline]
    pub fn covers(&self, amount: Decimal) -> bool {
        self.avail >= amount
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    /// Credit funds
    ///
    /// # Errors
    /// - `NonPositiveAmount` if amount <= 0
    /// - `Overflow` on arithmetic overflow
    pub fn credit(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        if amount <= Decimal::ZERO {
            return Err(BalanceError::NonPositiveAmount);
        }
        self.avail = self
            .avail
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Debit funds
    ///
    /// # Errors
    /// - `InsufficientFunds` if avail < amount (balance unchanged)
    /// - `NonPositiveAmount` if amount <= 0
    pub fn debit(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        if amount <= Decimal::ZERO {
            return Err(BalanceError::NonPositiveAmount);
        }
        if self.avail < amount {
            return Err(BalanceError::InsufficientFunds {
                available: self.avail,
                required: amount,
            });
        }
        self.avail = self
            .avail
            .checked_sub(amount)
            .ok_or(BalanceError::Overflow)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }
}

// ============================================================
// TESTS - Prove enforcement works
// ============================================================
