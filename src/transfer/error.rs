//! Transfer Error Types
//!
//! Every failure the engine can report, grouped into the machine-readable
//! [`ErrorKind`]s the UI layer switches on.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainError;
use crate::core_types::{AccountId, ChainIndex};
use crate::money::MoneyError;
use crate::persistence::StoreError;
use crate::signing::{SignatureError, VerificationLayer};

use super::state::TransferState;
use super::types::TransactionId;

/// Machine-readable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input, non-retryable
    ValidationError,
    /// Critical risk or device compromise; escalate upstream
    SecurityBlocked,
    /// Resource busy, retryable
    LockContention,
    /// Transaction must be discarded and re-created
    SignatureFailure,
    /// Chain is broken; account frozen until cleared
    ChainIntegrityViolation,
    /// Commit rolled back; retryable as a new transaction
    CommitFailure,
    /// Non-retryable without new funds
    InsufficientBalance,
    /// User aborted before signing
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::SecurityBlocked => "SecurityBlocked",
            ErrorKind::LockContention => "LockContention",
            ErrorKind::SignatureFailure => "SignatureFailure",
            ErrorKind::ChainIntegrityViolation => "ChainIntegrityViolation",
            ErrorKind::CommitFailure => "CommitFailure",
            ErrorKind::InsufficientBalance => "InsufficientBalance",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Whether the caller may retry (with a brand-new transaction)
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::LockContention | ErrorKind::CommitFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount precision exceeds {max} decimal places")]
    PrecisionOverflow { max: u32 },

    #[error("Currency is required")]
    MissingCurrency,

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Receiver is required")]
    MissingReceiver,

    #[error("Sender is required")]
    MissingSender,

    #[error("Sender and receiver cannot be the same account")]
    SameAccount,

    #[error("Note exceeds {max} characters")]
    NoteTooLong { max: usize },

    #[error("Biometric confirmation was not given")]
    BiometricRejected,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TransferState, to: TransferState },

    // === Security Errors ===
    #[error("Device is not trusted (insecure or tampered)")]
    DeviceCompromised,

    #[error("Transfer blocked by risk assessment: {flags:?}")]
    CriticalRisk { flags: Vec<String> },

    // === Concurrency ===
    #[error("Resource is locked by another transfer: {resource}")]
    LockContention { resource: String },

    // === Signature Errors ===
    #[error("Verification failed at {layer} layer")]
    VerificationFailed { layer: VerificationLayer },

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Transaction {0} is already signed")]
    SignatureImmutable(TransactionId),

    // === Chain Integrity ===
    #[error("Chain integrity violated at index {index:?}: {reason}")]
    ChainIntegrity {
        index: Option<ChainIndex>,
        reason: String,
    },

    #[error("Account {0} is frozen pending integrity review")]
    AccountFrozen(AccountId),

    // === Commit ===
    #[error("Commit failed and was rolled back: {0}")]
    CommitFailed(String),

    // === Funds ===
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    // === Cancellation ===
    #[error("Transfer cancelled: {0}")]
    Cancelled(String),
}

impl TransferError {
    /// Machine-readable kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidAmount
            | TransferError::PrecisionOverflow { .. }
            | TransferError::MissingCurrency
            | TransferError::InvalidCurrency(_)
            | TransferError::MissingReceiver
            | TransferError::MissingSender
            | TransferError::SameAccount
            | TransferError::NoteTooLong { .. }
            | TransferError::BiometricRejected
            | TransferError::InvalidStateTransition { .. } => ErrorKind::ValidationError,
            TransferError::DeviceCompromised | TransferError::CriticalRisk { .. } => {
                ErrorKind::SecurityBlocked
            }
            TransferError::LockContention { .. } => ErrorKind::LockContention,
            TransferError::VerificationFailed { .. }
            | TransferError::SigningFailed(_)
            | TransferError::SignatureImmutable(_) => ErrorKind::SignatureFailure,
            TransferError::ChainIntegrity { .. } | TransferError::AccountFrozen(_) => {
                ErrorKind::ChainIntegrityViolation
            }
            TransferError::CommitFailed(_) => ErrorKind::CommitFailure,
            TransferError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            TransferError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::PrecisionOverflow { .. } => "PRECISION_OVERFLOW",
            TransferError::MissingCurrency => "MISSING_CURRENCY",
            TransferError::InvalidCurrency(_) => "INVALID_CURRENCY",
            TransferError::MissingReceiver => "MISSING_RECEIVER",
            TransferError::MissingSender => "MISSING_SENDER",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::NoteTooLong { .. } => "NOTE_TOO_LONG",
            TransferError::BiometricRejected => "BIOMETRIC_REJECTED",
            TransferError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            TransferError::DeviceCompromised => "DEVICE_COMPROMISED",
            TransferError::CriticalRisk { .. } => "CRITICAL_RISK",
            TransferError::LockContention { .. } => "LOCK_CONTENTION",
            TransferError::VerificationFailed { .. } => "VERIFICATION_FAILED",
            TransferError::SigningFailed(_) => "SIGNING_FAILED",
            TransferError::SignatureImmutable(_) => "SIGNATURE_IMMUTABLE",
            TransferError::ChainIntegrity { .. } => "CHAIN_INTEGRITY_VIOLATION",
            TransferError::AccountFrozen(_) => "ACCOUNT_FROZEN",
            TransferError::CommitFailed(_) => "COMMIT_FAILED",
            TransferError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            TransferError::Cancelled(_) => "CANCELLED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Actionable message for the end user.
    ///
    /// Deliberately vaguer than `Display` for security failures: the failing
    /// verification layer or risk flags are logged, not shown.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ValidationError => match self {
                TransferError::BiometricRejected => {
                    "Confirm the transfer with your fingerprint or face to continue."
                }
                TransferError::SameAccount => "Choose a different recipient account.",
                TransferError::NoteTooLong { .. } => "Shorten the note and try again.",
                _ => "Check the amount, currency and recipient, then try again.",
            },
            ErrorKind::SecurityBlocked => {
                "This transfer was blocked for your security. Please sign in again or contact support."
            }
            ErrorKind::LockContention => {
                "Another transfer from this account is in progress. Please wait a moment and try again."
            }
            ErrorKind::SignatureFailure => {
                "The transfer could not be signed securely. Please start a new transfer."
            }
            ErrorKind::ChainIntegrityViolation => {
                "Transfers from this account are paused for review. Please contact support."
            }
            ErrorKind::CommitFailure => {
                "The transfer could not be completed and no money was moved. You can try again."
            }
            ErrorKind::InsufficientBalance => {
                "Your balance is too low for this transfer. Add funds or lower the amount."
            }
            ErrorKind::Cancelled => "The transfer was cancelled. No money was moved.",
        }
    }
}

impl From<MoneyError> for TransferError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::MissingCurrency => TransferError::MissingCurrency,
            MoneyError::InvalidCurrency(code) => TransferError::InvalidCurrency(code),
            MoneyError::InvalidAmount => TransferError::InvalidAmount,
            MoneyError::PrecisionOverflow { max, .. } => TransferError::PrecisionOverflow { max },
        }
    }
}

impl From<SignatureError> for TransferError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::AlreadySigned(id) => TransferError::SignatureImmutable(id),
            other => TransferError::SigningFailed(other.to_string()),
        }
    }
}

impl From<ChainError> for TransferError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Integrity { index, reason } => TransferError::ChainIntegrity {
                index: Some(index),
                reason,
            },
            other => TransferError::CommitFailed(other.to_string()),
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::CommitFailed(e.to_string())
    }
}
