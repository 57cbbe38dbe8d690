//! Core types used throughout the engine
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Account ID - opaque identifier of a ledger account.
///
/// # Constraints:
/// - **Non-empty**: validated when a transfer request enters the engine
/// - **Stable**: used verbatim in lock keys, Merkle leaves and balance keys
pub type AccountId = String;

/// Owner token presented to the lock manager.
///
/// One token per in-flight transaction, so a late release from a finished
/// transfer can never free a lock owned by a newer one.
pub type OwnerToken = uuid::Uuid;

/// Position of an entry in the hash chain (0-based)
pub type ChainIndex = u64;
