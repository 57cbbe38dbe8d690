//! Ledger Commit Coordinator
//!
//! Applies a signed transaction to the ledger in four steps:
//!
//! ```text
//! (1) re-check balance ─▶ (2) chain append ─▶ (3) debit/credit ─▶ (4) history
//!                                  │                  │                 │
//!                                  │                  └──── failure ────┤
//!                                  ▼                                    ▼
//!                            CommitFailed          remove chain entry (or reversal
//!                         (nothing applied)        marker) + restore balances
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Serialized commits**: one commit runs at a time, so the entry it
//!    appended is still the chain head when it needs compensating
//! 2. **Persist-before-apply**: in-memory balances change only after the new
//!    snapshot is durable. Compensation is the exception: the pre-commit
//!    snapshot is put back in memory even when the store refuses it, and the
//!    next successful balance write carries it to disk
//! 3. **Unconditional release**: `rollback` releases the transaction's lock
//!    even when restoring state fails

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::balance::{Balance, BalanceError, BalanceKey};
use crate::chain::{ChainEntry, ChainError, HashChain};
use crate::core_types::{AccountId, ChainIndex};
use crate::lock::{LockHandle, LockManager};
use crate::money::{Currency, normalize_amount};
use crate::persistence::{self, Persistence, StoreError};
use crate::transfer::error::TransferError;
use crate::transfer::state::TransferState;
use crate::transfer::types::{Transaction, TransactionId};

use super::{BALANCES_KEY, HISTORY_KEY};

/// Commit sub-step, for logging and failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    BalanceCheck,
    ChainAppend,
    BalanceUpdate,
    History,
}

impl CommitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStage::BalanceCheck => "balance_check",
            CommitStage::ChainAppend => "chain_append",
            CommitStage::BalanceUpdate => "balance_update",
            CommitStage::History => "history",
        }
    }
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed transfer in the history list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub transaction_id: TransactionId,
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub chain_index: ChainIndex,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BalanceRow {
    account: AccountId,
    currency: Currency,
    balance: Balance,
}

/// Pre-transaction balances, `None` for cells that did not exist
type Snapshot = Vec<(BalanceKey, Option<Balance>)>;

/// What the coordinator must undo for a transaction
#[derive(Debug, Default)]
struct InFlight {
    lock: Option<LockHandle>,
    applied: Option<Applied>,
}

/// A committed movement, reversible until `finish`
#[derive(Debug)]
struct Applied {
    chain_index: ChainIndex,
    sender: BalanceKey,
    receiver: BalanceKey,
    amount: Decimal,
}

/// Coordinates chain append, balance movement and history as one unit
pub struct LedgerCommitCoordinator {
    chain: Arc<HashChain>,
    locks: Arc<LockManager>,
    store: Arc<dyn Persistence>,
    balances: Mutex<FxHashMap<BalanceKey, Balance>>,
    commit_guard: Mutex<()>,
    in_flight: Mutex<FxHashMap<TransactionId, InFlight>>,
}

impl LedgerCommitCoordinator {
    /// Build a coordinator, loading the balance snapshot from `store`
    pub fn open(
        chain: Arc<HashChain>,
        locks: Arc<LockManager>,
        store: Arc<dyn Persistence>,
    ) -> Result<Self, StoreError> {
        let balances = match store.get(BALANCES_KEY)? {
            Some(bytes) => persistence::decode::<Vec<BalanceRow>>(&bytes)?
                .into_iter()
                .map(|row| (BalanceKey::new(row.account, row.currency), row.balance))
                .collect(),
            None => FxHashMap::default(),
        };
        info!(cells = balances.len(), "Balance book loaded");

        Ok(Self {
            chain,
            locks,
            store,
            balances: Mutex::new(balances),
            commit_guard: Mutex::new(()),
            in_flight: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn chain(&self) -> &Arc<HashChain> {
        &self.chain
    }

    // ============================================================
    // BALANCES
    // ============================================================

    /// Available balance, zero for an unknown cell
    pub fn balance(&self, account: &str, currency: &Currency) -> Decimal {
        self.balances
            .lock()
            .get(&BalanceKey::new(account, currency.clone()))
            .map_or(Decimal::ZERO, Balance::avail)
    }

    /// Full balance cell including its version
    pub fn balance_cell(&self, account: &str, currency: &Currency) -> Option<Balance> {
        self.balances
            .lock()
            .get(&BalanceKey::new(account, currency.clone()))
            .copied()
    }

    /// Fund an account from outside the ledger
    pub fn deposit(
        &self,
        account: &str,
        currency: &Currency,
        amount: Decimal,
    ) -> Result<Balance, TransferError> {
        let amount = normalize_amount(amount)?;
        let _serial = self.commit_guard.lock();

        let key = BalanceKey::new(account, currency.clone());
        let mut cell = self.balances.lock().get(&key).copied().unwrap_or_default();
        cell.credit(amount).map_err(balance_failure)?;

        self.persist_with(&[(key, Some(cell))])?;
        info!(account, currency = %currency, amount = %amount, "Deposit applied");
        Ok(cell)
    }

    /// Committed transfer history, oldest first
    pub fn history(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        self.store
            .list(HISTORY_KEY)?
            .iter()
            .map(|bytes| persistence::decode(bytes))
            .collect()
    }

    // ============================================================
    // COMMIT / ROLLBACK
    // ============================================================

    /// Attach the lock a transaction holds so `rollback` can release it
    pub fn register_lock(&self, transaction_id: TransactionId, lock: LockHandle) {
        self.in_flight
            .lock()
            .entry(transaction_id)
            .or_default()
            .lock = Some(lock);
    }

    /// Apply `tx` to the ledger.
    ///
    /// Either all of chain append, balance movement and history succeed, or
    /// none of them remain visible.
    ///
    /// # Errors
    /// - `InsufficientBalance` if the sender can no longer cover the amount
    /// - `CommitFailed` for any append/persist failure (already compensated)
    pub fn commit(&self, tx: &Transaction) -> Result<ChainEntry, TransferError> {
        let _serial = self.commit_guard.lock();
        let sender_key = BalanceKey::new(tx.sender.clone(), tx.currency.clone());
        let receiver_key = BalanceKey::new(tx.receiver.clone(), tx.currency.clone());

        // (1) re-check balance
        let snapshot: Snapshot = {
            let balances = self.balances.lock();
            vec![
                (sender_key.clone(), balances.get(&sender_key).copied()),
                (receiver_key.clone(), balances.get(&receiver_key).copied()),
            ]
        };
        let mut sender = snapshot[0].1.unwrap_or_default();
        let mut receiver = snapshot[1].1.unwrap_or_default();
        if !sender.covers(tx.amount) {
            debug!(tx_id = %tx.id, stage = %CommitStage::BalanceCheck, "Commit refused");
            return Err(TransferError::InsufficientBalance {
                available: sender.avail(),
                required: tx.amount,
            });
        }

        // (2) chain append
        let mut record = tx.clone();
        record.status = TransferState::Committed;
        let entry = self.chain.append(record).map_err(|e| {
            warn!(tx_id = %tx.id, stage = %CommitStage::ChainAppend, error = %e, "Commit failed");
            match e {
                ChainError::HeadMismatch { .. } => {
                    TransferError::CommitFailed(format!("{}: {}", CommitStage::ChainAppend, e))
                }
                other => TransferError::from(other),
            }
        })?;

        // (3) debit / credit
        let moved = sender
            .debit(tx.amount)
            .and_then(|()| receiver.credit(tx.amount))
            .map_err(balance_failure)
            .and_then(|()| {
                self.persist_with(&[
                    (sender_key.clone(), Some(sender)),
                    (receiver_key.clone(), Some(receiver)),
                ])
                .map_err(TransferError::from)
            });
        if let Err(e) = moved {
            return Err(self.compensate(tx, &entry, &snapshot, CommitStage::BalanceUpdate, e));
        }

        // (4) history
        let history = HistoryRecord {
            transaction_id: tx.id,
            sender: tx.sender.clone(),
            receiver: tx.receiver.clone(),
            amount: tx.amount,
            currency: tx.currency.clone(),
            chain_index: entry.index,
            committed_at: Utc::now(),
        };
        let recorded = persistence::encode(&history)
            .and_then(|bytes| self.store.append(HISTORY_KEY, bytes));
        if let Err(e) = recorded {
            let e = TransferError::from(e);
            return Err(self.compensate(tx, &entry, &snapshot, CommitStage::History, e));
        }

        self.in_flight.lock().entry(tx.id).or_default().applied = Some(Applied {
            chain_index: entry.index,
            sender: sender_key,
            receiver: receiver_key,
            amount: tx.amount,
        });
        info!(
            tx_id = %tx.id,
            index = entry.index,
            hash = %entry.hash,
            amount = %tx.amount,
            currency = %tx.currency,
            "Transfer committed"
        );
        Ok(entry)
    }

    /// Undo whatever `transaction_id` applied and release its lock.
    ///
    /// The lock is released even if restoring state fails.
    pub fn rollback(&self, transaction_id: TransactionId) -> Result<(), TransferError> {
        let in_flight = self.in_flight.lock().remove(&transaction_id);
        let Some(InFlight { lock, applied }) = in_flight else {
            debug!(tx_id = %transaction_id, "Rollback: nothing in flight");
            return Ok(());
        };

        let restored = match applied {
            Some(applied) => self.revert_applied(transaction_id, &applied),
            None => Ok(()),
        };

        if let Some(lock) = lock {
            self.locks.release(&lock.key, lock.owner);
        }

        match &restored {
            Ok(()) => info!(tx_id = %transaction_id, "Transaction rolled back"),
            Err(e) => error!(
                target: "ledger_audit",
                tx_id = %transaction_id,
                error = %e,
                "Rollback could not restore balances"
            ),
        }
        restored
    }

    /// Forget a committed transaction and release its lock
    pub fn finish(&self, transaction_id: TransactionId) {
        if let Some(InFlight {
            lock: Some(lock), ..
        }) = self.in_flight.lock().remove(&transaction_id)
        {
            self.locks.release(&lock.key, lock.owner);
        }
    }

    /// Number of transactions with state the coordinator could still undo
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    /// Move a committed amount back and take the transfer off the chain
    fn revert_applied(
        &self,
        transaction_id: TransactionId,
        applied: &Applied,
    ) -> Result<(), TransferError> {
        let _serial = self.commit_guard.lock();
        let (mut sender, mut receiver) = {
            let balances = self.balances.lock();
            (
                balances.get(&applied.sender).copied().unwrap_or_default(),
                balances.get(&applied.receiver).copied().unwrap_or_default(),
            )
        };
        receiver
            .debit(applied.amount)
            .and_then(|()| sender.credit(applied.amount))
            .map_err(balance_failure)?;
        self.persist_with(&[
            (applied.sender.clone(), Some(sender)),
            (applied.receiver.clone(), Some(receiver)),
        ])?;
        self.revert_chain(transaction_id, applied.chain_index, "rollback");
        Ok(())
    }

    /// Undo a partially applied commit. Caller holds `commit_guard`.
    fn compensate(
        &self,
        tx: &Transaction,
        entry: &ChainEntry,
        snapshot: &Snapshot,
        stage: CommitStage,
        cause: TransferError,
    ) -> TransferError {
        warn!(
            tx_id = %tx.id,
            stage = %stage,
            error = %cause,
            "Commit failed, compensating"
        );
        self.revert_chain(tx.id, entry.index, stage.as_str());
        if let Err(e) = self.persist_with(snapshot) {
            apply_changes(&mut self.balances.lock(), snapshot);
            error!(
                target: "ledger_audit",
                tx_id = %tx.id,
                error = %e,
                "Balance snapshot restored in memory only, store write failed"
            );
        }
        TransferError::CommitFailed(format!("{}: {}", stage, cause))
    }

    /// Remove the transaction's chain entry, or mark it reversed when it is
    /// no longer the head
    fn revert_chain(&self, transaction_id: TransactionId, index: ChainIndex, reason: &str) {
        match self.chain.remove_head(transaction_id) {
            Ok(_) => debug!(tx_id = %transaction_id, index, "Chain entry removed"),
            Err(e) => {
                warn!(
                    target: "ledger_audit",
                    tx_id = %transaction_id,
                    index,
                    error = %e,
                    "Chain entry not removable, appending reversal marker"
                );
                if let Err(e) = self.chain.append_reversal(transaction_id, reason) {
                    error!(
                        target: "ledger_audit",
                        tx_id = %transaction_id,
                        error = %e,
                        "Reversal marker append failed"
                    );
                }
            }
        }
    }

    /// Persist the balance book with `changes` applied, then apply them in
    /// memory. On error memory is untouched.
    fn persist_with(&self, changes: &[(BalanceKey, Option<Balance>)]) -> Result<(), StoreError> {
        let mut balances = self.balances.lock();
        let mut next = balances.clone();
        apply_changes(&mut next, changes);

        let mut rows: Vec<BalanceRow> = next
            .iter()
            .map(|(key, balance)| BalanceRow {
                account: key.account.clone(),
                currency: key.currency.clone(),
                balance: *balance,
            })
            .collect();
        rows.sort_by(|a, b| (&a.currency, &a.account).cmp(&(&b.currency, &b.account)));

        self.store
            .set(BALANCES_KEY, persistence::encode(&rows)?)?;
        *balances = next;
        Ok(())
    }
}

fn apply_changes(
    balances: &mut FxHashMap<BalanceKey, Balance>,
    changes: &[(BalanceKey, Option<Balance>)],
) {
    for (key, cell) in changes {
        match cell {
            Some(cell) => balances.insert(key.clone(), *cell),
            None => balances.remove(key),
        };
    }
}

fn balance_failure(e: BalanceError) -> TransferError {
    match e {
        BalanceError::InsufficientFunds {
            available,
            required,
        } => TransferError::InsufficientBalance {
            available,
            required,
        },
        BalanceError::NonPositiveAmount => TransferError::InvalidAmount,
        BalanceError::Overflow => TransferError::CommitFailed(e.to_string()),
    }
}
