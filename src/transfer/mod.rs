//! Transfer Engine
//!
//! Turns a user's transfer request into a signed, chained, committed ledger
//! transaction, or into a terminal failure with every partial effect undone.
//!
//! # Architecture
//!
//! The [`TransferStateMachine`] receives all of its collaborators at
//! construction; nothing is global:
//! - **HashChain** - append-only record of committed transactions
//! - **SignatureService** - Ed25519 signing and multi-layer verification
//! - **LockManager** - one writer per `currency:account`
//! - **LedgerCommitCoordinator** - atomic chain + balance + history commit
//! - **Gates** - device trust, biometric, risk and re-confirmation
//!
//! # Error Kinds
//!
//! | Kind                    | Retryable | Effect                          |
//! |-------------------------|-----------|---------------------------------|
//! | ValidationError         | no        | rejected before any lock        |
//! | SecurityBlocked         | no        | escalate upstream               |
//! | LockContention          | yes       | retried with a new transaction  |
//! | SignatureFailure        | no        | discarded, lock released        |
//! | ChainIntegrityViolation | no        | sender frozen until cleared     |
//! | CommitFailure           | yes       | fully rolled back               |
//! | InsufficientBalance     | no        | rejected                        |
//! | Cancelled               | no        | user aborted before signing     |

pub mod error;
pub mod gates;
pub mod machine;
pub mod state;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use error::{ErrorKind, TransferError};
pub use gates::{
    AmountRiskGate, BiometricGate, ConfirmationGate, DeviceTrustGate, FixedBiometric,
    FixedConfirmation, FixedDeviceTrust, FixedRiskGate, Gates, RiskGate,
};
pub use machine::{CancelSignal, TransferStateMachine};
pub use state::TransferState;
pub use types::{
    IsolationLevel, RiskAssessment, RiskLevel, Transaction, TransactionId, TransferOutcome,
    TransferRequest,
};
