//! Transfer FSM State Definitions
//!
//! State IDs are stable so they can be persisted alongside committed
//! transactions and compared across versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer FSM States
///
/// Success path: IDLE → VALIDATING → VERIFIED → SIGNING → SIGNED → COMMITTING → COMMITTED
/// Terminal: COMMITTED (60), FAILED (-10), CANCELLED (-20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum TransferState {
    /// Request received, nothing checked yet
    Idle = 0,

    /// Input, device, biometric, balance and risk gates running
    Validating = 10,

    /// All pre-lock gates passed
    Verified = 20,

    /// Lock held; previous hash, Merkle root and signature being produced
    Signing = 30,

    /// Signature attached and multi-layer verification passed
    Signed = 40,

    /// Atomic balance + chain application in progress
    Committing = 50,

    /// Terminal: entry appended and balances moved
    Committed = 60,

    /// Terminal: any gate or phase failed (partial effects rolled back)
    Failed = -10,

    /// Terminal: user aborted before the lock was taken
    Cancelled = -20,
}

impl TransferState {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Committed | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// States in which the (account, currency) lock must be held
    #[inline]
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            TransferState::Signing | TransferState::Signed | TransferState::Committing
        )
    }

    /// Cancellation is only honored before the lock is acquired
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TransferState::Validating | TransferState::Verified)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Only single forward steps are allowed on the success path; `Failed` is
    /// reachable from every non-terminal state and `Cancelled` only from the
    /// pre-lock states. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TransferState::Failed => true,
            TransferState::Cancelled => self.is_cancellable(),
            _ => self.next() == Some(next),
        }
    }

    /// Successor on the success path
    pub fn next(&self) -> Option<TransferState> {
        match self {
            TransferState::Idle => Some(TransferState::Validating),
            TransferState::Validating => Some(TransferState::Verified),
            TransferState::Verified => Some(TransferState::Signing),
            TransferState::Signing => Some(TransferState::Signed),
            TransferState::Signed => Some(TransferState::Committing),
            TransferState::Committing => Some(TransferState::Committed),
            _ => None,
        }
    }

    /// Get the numeric state ID
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from numeric state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Idle),
            10 => Some(TransferState::Validating),
            20 => Some(TransferState::Verified),
            30 => Some(TransferState::Signing),
            40 => Some(TransferState::Signed),
            50 => Some(TransferState::Committing),
            60 => Some(TransferState::Committed),
            -10 => Some(TransferState::Failed),
            -20 => Some(TransferState::Cancelled),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Idle => "IDLE",
            TransferState::Validating => "VALIDATING",
            TransferState::Verified => "VERIFIED",
            TransferState::Signing => "SIGNING",
            TransferState::Signed => "SIGNED",
            TransferState::Committing => "COMMITTING",
            TransferState::Committed => "COMMITTED",
            TransferState::Failed => "FAILED",
            TransferState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}
