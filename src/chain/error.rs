//! Hash chain errors

use thiserror::Error;

use crate::core_types::ChainIndex;
use crate::persistence::StoreError;
use crate::transfer::types::TransactionId;

use super::merkle::Digest;

#[derive(Debug, Error)]
pub enum ChainError {
    /// Optimistic concurrency check: the entry was built against a stale head
    #[error("Previous hash {actual} does not match chain head {expected}")]
    HeadMismatch { expected: Digest, actual: Digest },

    #[error("Transaction is missing {0}")]
    MissingField(&'static str),

    #[error("Transaction {0} is not the chain head")]
    NotHead(TransactionId),

    #[error("Transaction {0} is not in the chain")]
    NotFound(TransactionId),

    #[error("Chain broken at index {index}: {reason}")]
    Integrity { index: ChainIndex, reason: String },

    #[error("Chain store error: {0}")]
    Store(#[from] StoreError),
}
