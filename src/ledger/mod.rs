//! Ledger
//!
//! Balance book and the commit coordinator that moves money atomically
//! alongside the hash chain.

pub mod coordinator;

pub use coordinator::{CommitStage, HistoryRecord, LedgerCommitCoordinator};

/// Store cell holding the balance snapshot
pub const BALANCES_KEY: &str = "balances";

/// Store list holding committed transfer history
pub const HISTORY_KEY: &str = "history";
