//! Transfer Ledger - Immutable Transfer Ledger Engine
//!
//! Moves funds between accounts as signed transactions appended to a
//! tamper-evident hash chain, with balance movement and chain append committed
//! as one unit.
//!
//! # Modules
//!
//! - [`core_types`] - Shared aliases (AccountId, OwnerToken, ChainIndex)
//! - [`money`] - Currency codes and amount normalization
//! - [`balance`] - Enforced balance type
//! - [`persistence`] - Key-value store trait, memory and WAL backends
//! - [`chain`] - Hash chain and Merkle roots
//! - [`signing`] - Ed25519 signature service and key stores
//! - [`lock`] - Resource locks and the stale-lock sweeper
//! - [`ledger`] - Commit coordinator and balance book
//! - [`transfer`] - Transfer state machine, gates and errors
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

// Core types - must be first!
pub mod core_types;

pub mod balance;
pub mod money;
pub mod persistence;

// Ledger components
pub mod chain;
pub mod ledger;
pub mod lock;
pub mod signing;
pub mod transfer;

// Application
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use chain::{ChainEntry, ChainError, ChainRecord, Digest, GENESIS_HASH, HashChain, IntegrityReport};
pub use core_types::{AccountId, ChainIndex, OwnerToken};
pub use ledger::{CommitStage, LedgerCommitCoordinator};
pub use lock::{LockHandle, LockManager, LockSweeper, lock_key};
pub use money::{Currency, MoneyError};
pub use persistence::{MemoryStore, Persistence, StoreError, WalStore};
pub use signing::{KeyStore, LocalKeyStore, SignatureError, SignatureService, VerificationLayer};
pub use transfer::{
    CancelSignal, ErrorKind, Gates, TransactionId, Transaction, TransferError, TransferOutcome,
    TransferRequest, TransferState, TransferStateMachine,
};
