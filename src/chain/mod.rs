//! Hash Chain
//!
//! Append-only sequence of committed entries, each embedding the hash of its
//! predecessor.
//!
//! ```text
//! GENESIS ◀── entry[0] ◀── entry[1] ◀── ... ◀── entry[n-1]  (head)
//!             prev=0x00..   prev=h(0)             prev=h(n-2)
//! ```
//!
//! # Guarantees
//!
//! 1. **Optimistic concurrency**: `append` rejects an entry whose
//!    `previous_hash` is not the current head, independent of any lock
//! 2. **Write-ahead**: an entry is persisted before it becomes visible
//! 3. **Tamper evidence**: `verify_integrity` recomputes every link, every
//!    entry hash and every transaction's Merkle root. The entry hash covers
//!    every stored transaction field, not only the Merkle leaves

pub mod error;
pub mod merkle;

pub use error::ChainError;
pub use merkle::{DIGEST_LEN, Digest, GENESIS_HASH, compute_merkle_root};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core_types::ChainIndex;
use crate::persistence::{self, MemoryStore, Persistence};
use crate::transfer::types::{Transaction, TransactionId};

/// Store list holding the chain entries
pub const CHAIN_KEY: &str = "chain";

/// Payload of a chain entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainRecord {
    /// A committed transfer
    Transfer(Transaction),
    /// Compensation marker for an earlier transfer that could not be removed
    Reversal {
        transaction_id: TransactionId,
        reason: String,
    },
}

impl ChainRecord {
    /// Digest of the record as covered by the entry hash.
    ///
    /// A transfer contributes its full signing payload (note included), the
    /// signature, the signer key and the stored status, each length-prefixed.
    fn digest(&self) -> Digest {
        match self {
            ChainRecord::Transfer(tx) => {
                let payload = tx.signing_payload().unwrap_or_default();
                let signer = tx.signer_key.as_deref().unwrap_or_default();
                let parts: [&[u8]; 5] = [
                    b"transfer",
                    &payload,
                    tx.signature().unwrap_or_default(),
                    signer.as_bytes(),
                    tx.status.as_str().as_bytes(),
                ];
                let mut framed = Vec::with_capacity(payload.len() + 160);
                for part in parts {
                    framed.extend_from_slice(&(part.len() as u32).to_le_bytes());
                    framed.extend_from_slice(part);
                }
                Digest::of_parts(&[&framed])
            }
            ChainRecord::Reversal {
                transaction_id,
                reason,
            } => {
                let id = transaction_id.to_string();
                compute_merkle_root(&["reversal", id.as_str(), reason.as_str()])
            }
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            ChainRecord::Transfer(tx) => tx.id,
            ChainRecord::Reversal { transaction_id, .. } => *transaction_id,
        }
    }
}

/// Committed chain entry. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub index: ChainIndex,
    pub previous_hash: Digest,
    /// Hash of this entry; the next entry's `previous_hash`
    pub hash: Digest,
    pub record: ChainRecord,
}

impl ChainEntry {
    fn new(index: ChainIndex, previous_hash: Digest, record: ChainRecord) -> Self {
        let hash = entry_hash(index, &previous_hash, &record);
        Self {
            index,
            previous_hash,
            hash,
            record,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match &self.record {
            ChainRecord::Transfer(tx) => Some(tx),
            ChainRecord::Reversal { .. } => None,
        }
    }
}

fn entry_hash(index: ChainIndex, previous_hash: &Digest, record: &ChainRecord) -> Digest {
    Digest::of_parts(&[
        b"entry",
        &index.to_le_bytes(),
        previous_hash.as_bytes(),
        record.digest().as_bytes(),
    ])
}

/// Result of a full chain walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub broken_at_index: Option<ChainIndex>,
    pub reason: Option<String>,
    pub entries_checked: u64,
}

impl IntegrityReport {
    fn intact(entries_checked: u64) -> Self {
        Self {
            valid: true,
            broken_at_index: None,
            reason: None,
            entries_checked,
        }
    }

    fn broken(index: ChainIndex, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            broken_at_index: Some(index),
            reason: Some(reason.into()),
            entries_checked: index + 1,
        }
    }
}

/// Append-only chain of committed entries
pub struct HashChain {
    entries: RwLock<Vec<ChainEntry>>,
    store: Arc<dyn Persistence>,
}

impl HashChain {
    /// Volatile chain (tests, ephemeral runs)
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Load the chain from `store`, refusing to start on a broken chain
    pub fn open(store: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let chain = Self::open_for_audit(store)?;
        let report = chain.verify_integrity();
        if let (false, Some(index)) = (report.valid, report.broken_at_index) {
            error!(
                target: "ledger_audit",
                index,
                reason = report.reason.as_deref().unwrap_or("-"),
                "Refusing to open broken chain"
            );
            return Err(ChainError::Integrity {
                index,
                reason: report.reason.unwrap_or_default(),
            });
        }
        info!(entries = chain.len(), head = %chain.head_hash(), "Hash chain loaded");
        Ok(chain)
    }

    /// Load the chain from `store` without verifying it, for inspection
    pub fn open_for_audit(store: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let entries = store
            .list(CHAIN_KEY)?
            .iter()
            .map(|bytes| persistence::decode::<ChainEntry>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            entries: RwLock::new(entries),
            store,
        })
    }

    /// Hash of the most recent entry, or [`GENESIS_HASH`] when empty
    pub fn head_hash(&self) -> Digest {
        self.entries
            .read()
            .last()
            .map_or(GENESIS_HASH, |entry| entry.hash)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Merkle root over ordered leaf values (pure)
    pub fn compute_merkle_root<S: AsRef<str>>(fields: &[S]) -> Digest {
        compute_merkle_root(fields)
    }

    /// Append a committed transaction.
    ///
    /// # Errors
    /// - `HeadMismatch` if `tx.previous_hash` is not the current head
    /// - `MissingField` if the transaction was never sealed
    /// - `Store` if the write-ahead persist fails (chain unchanged)
    pub fn append(&self, tx: Transaction) -> Result<ChainEntry, ChainError> {
        let previous_hash = tx
            .previous_hash
            .ok_or(ChainError::MissingField("previous hash"))?;
        if tx.merkle_root.is_none() {
            return Err(ChainError::MissingField("merkle root"));
        }

        let mut entries = self.entries.write();
        let head = entries.last().map_or(GENESIS_HASH, |e| e.hash);
        if previous_hash != head {
            warn!(
                tx_id = %tx.id,
                expected = %head,
                actual = %previous_hash,
                "Chain append rejected: stale previous hash"
            );
            return Err(ChainError::HeadMismatch {
                expected: head,
                actual: previous_hash,
            });
        }

        let entry = ChainEntry::new(
            entries.len() as ChainIndex,
            previous_hash,
            ChainRecord::Transfer(tx),
        );
        self.persist_and_push(&mut entries, entry)
    }

    /// Append a reversal marker for a transfer already in the chain
    pub fn append_reversal(
        &self,
        transaction_id: TransactionId,
        reason: impl Into<String>,
    ) -> Result<ChainEntry, ChainError> {
        let mut entries = self.entries.write();
        let present = entries
            .iter()
            .any(|e| matches!(&e.record, ChainRecord::Transfer(tx) if tx.id == transaction_id));
        if !present {
            return Err(ChainError::NotFound(transaction_id));
        }

        let head = entries.last().map_or(GENESIS_HASH, |e| e.hash);
        let entry = ChainEntry::new(
            entries.len() as ChainIndex,
            head,
            ChainRecord::Reversal {
                transaction_id,
                reason: reason.into(),
            },
        );
        self.persist_and_push(&mut entries, entry)
    }

    /// Remove the head entry if it is the transfer `transaction_id`.
    ///
    /// Compensating action for a commit that failed after its append.
    pub fn remove_head(&self, transaction_id: TransactionId) -> Result<ChainEntry, ChainError> {
        let mut entries = self.entries.write();
        let is_head = entries.last().is_some_and(
            |e| matches!(&e.record, ChainRecord::Transfer(tx) if tx.id == transaction_id),
        );
        if !is_head {
            return Err(ChainError::NotHead(transaction_id));
        }

        let new_len = entries.len() - 1;
        self.store.truncate(CHAIN_KEY, new_len)?;
        let removed = entries.pop().ok_or(ChainError::NotHead(transaction_id))?;
        debug!(tx_id = %transaction_id, index = removed.index, "Chain head removed");
        Ok(removed)
    }

    /// Walk the full chain recomputing every link.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let entries = self.entries.read();
        let mut expected_prev = GENESIS_HASH;

        for (i, entry) in entries.iter().enumerate() {
            let index = i as ChainIndex;
            if entry.index != index {
                return IntegrityReport::broken(index, "index out of sequence");
            }
            if entry.previous_hash != expected_prev {
                return IntegrityReport::broken(index, "previous hash does not link");
            }
            if let ChainRecord::Transfer(tx) = &entry.record {
                if tx.previous_hash != Some(entry.previous_hash) {
                    return IntegrityReport::broken(index, "transaction link mismatch");
                }
                if !tx.merkle_matches() {
                    return IntegrityReport::broken(index, "merkle root mismatch");
                }
            }
            if entry.hash != entry_hash(entry.index, &entry.previous_hash, &entry.record) {
                return IntegrityReport::broken(index, "entry hash mismatch");
            }
            expected_prev = entry.hash;
        }

        IntegrityReport::intact(entries.len() as u64)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<ChainEntry> {
        self.entries.read().clone()
    }

    pub fn get(&self, index: ChainIndex) -> Option<ChainEntry> {
        self.entries.read().get(index as usize).cloned()
    }

    /// Chain index of the transfer `transaction_id`
    pub fn position_of(&self, transaction_id: TransactionId) -> Option<ChainIndex> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|e| matches!(&e.record, ChainRecord::Transfer(tx) if tx.id == transaction_id))
            .map(|e| e.index)
    }

    /// Whether a reversal marker exists for `transaction_id`
    pub fn is_reversed(&self, transaction_id: TransactionId) -> bool {
        self.entries.read().iter().any(|e| {
            matches!(&e.record, ChainRecord::Reversal { transaction_id: id, .. } if *id == transaction_id)
        })
    }

    fn persist_and_push(
        &self,
        entries: &mut Vec<ChainEntry>,
        entry: ChainEntry,
    ) -> Result<ChainEntry, ChainError> {
        self.store
            .append(CHAIN_KEY, persistence::encode(&entry)?)?;
        debug!(index = entry.index, hash = %entry.hash, "Chain entry appended");
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Mutate an entry in place, bypassing every guard
    #[cfg(test)]
    pub(crate) fn tamper(&self, index: ChainIndex, f: impl FnOnce(&mut ChainEntry)) {
        if let Some(entry) = self.entries.write().get_mut(index as usize) {
            f(entry);
        }
    }
}
