//! Persistence Layer
//!
//! Durable key-value store consumed by the hash chain and the balance book.
//!
//! Two value shapes live under string keys:
//! - **cells** (`get`/`set`): one opaque value, overwritten in place
//! - **lists** (`append`/`list`/`truncate`): ordered records, append-only
//!   except for tail truncation used by compensating rollback
//!
//! Backends:
//! - [`MemoryStore`] - in-process, for tests and ephemeral runs
//! - [`WalStore`] - CRC32-framed write-ahead log replayed on open

pub mod memory;
pub mod wal;

pub use memory::MemoryStore;
pub use wal::WalStore;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("Corrupted log at frame {frame}: {reason}")]
    Corrupted { frame: u64, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Durable key-value store
///
/// Implementations MUST make each call atomic: after an `Err` the key holds
/// exactly what it held before the call.
pub trait Persistence: Send + Sync {
    /// Read a cell
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite a cell
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Append a record to a list, returning the new list length
    fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError>;

    /// Read all records of a list (empty if absent)
    fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Drop list records beyond `len`
    fn truncate(&self, key: &str, len: usize) -> Result<(), StoreError>;
}

// ============================================================
// TYPED HELPERS
// ============================================================

/// Encode a stored document
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a stored document
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
