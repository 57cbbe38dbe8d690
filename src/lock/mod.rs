//! Lock Manager
//!
//! Named, owner-tagged resource locks giving a single logical writer per
//! `currency:account` pair.
//!
//! # Rules
//!
//! - `acquire` never waits: it returns `false` while another owner holds a
//!   live lock.
//! - `release` only removes a lock held by the caller and is idempotent.
//! - A lock older than its timeout (capped by the configured ceiling) is
//!   stale: the next `acquire` or a sweep reclaims it.

pub mod sweeper;

pub use sweeper::{LockSweeper, SweeperConfig};

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::core_types::{AccountId, OwnerToken};
use crate::money::Currency;

/// Default stale-lock ceiling
pub const DEFAULT_LOCK_CEILING: Duration = Duration::from_secs(60);

/// Resource key for an account and currency
///
/// ```
/// use transfer_ledger::lock::lock_key;
/// use transfer_ledger::money::Currency;
///
/// let sar = Currency::parse("SAR").unwrap();
/// assert_eq!(lock_key("alice", &sar), "SAR:alice");
/// ```
pub fn lock_key(account: &str, currency: &Currency) -> String {
    format!("{}:{}", currency, account)
}

/// A lock held (or to be held) by one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub owner: OwnerToken,
}

impl LockHandle {
    /// Handle with a fresh owner token
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: OwnerToken::new_v4(),
        }
    }

    pub fn for_account(account: &AccountId, currency: &Currency) -> Self {
        Self::new(lock_key(account, currency))
    }
}

#[derive(Debug, Clone)]
struct LockRecord {
    owner: OwnerToken,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockRecord {
    fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.acquired_at) >= self.ttl
    }
}

/// Thread-safe lock table
pub struct LockManager {
    locks: DashMap<String, LockRecord>,
    ceiling: Duration,
}

impl LockManager {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Try to take `key` for `owner`.
    ///
    /// Returns `false` on contention. Re-acquiring a lock already held by
    /// `owner` refreshes it.
    pub fn acquire(&self, key: &str, owner: OwnerToken, timeout: Duration) -> bool {
        let now = Instant::now();
        let record = LockRecord {
            owner,
            acquired_at: now,
            ttl: timeout.min(self.ceiling),
        };

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                debug!(resource = %key, owner = %owner, "Lock acquired");
                true
            }
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if held.owner == owner {
                    slot.insert(record);
                    return true;
                }
                if held.is_stale(now) {
                    warn!(
                        target: "ledger_audit",
                        resource = %key,
                        stale_owner = %held.owner,
                        age_ms = now.saturating_duration_since(held.acquired_at).as_millis() as u64,
                        new_owner = %owner,
                        "Stale lock reclaimed"
                    );
                    slot.insert(record);
                    return true;
                }
                debug!(resource = %key, holder = %held.owner, "Lock contention");
                false
            }
        }
    }

    /// Release `key` if `owner` holds it. No-op otherwise.
    pub fn release(&self, key: &str, owner: OwnerToken) {
        if self
            .locks
            .remove_if(key, |_, record| record.owner == owner)
            .is_some()
        {
            debug!(resource = %key, owner = %owner, "Lock released");
        }
    }

    /// Whether a live (non-stale) lock exists on `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.holder(key).is_some()
    }

    /// Owner of the live lock on `key`
    pub fn holder(&self, key: &str) -> Option<OwnerToken> {
        let now = Instant::now();
        self.locks
            .get(key)
            .filter(|record| !record.is_stale(now))
            .map(|record| record.owner)
    }

    /// Number of lock records, stale ones included
    pub fn active_count(&self) -> usize {
        self.locks.len()
    }

    /// Drop every stale lock, returning how many were reclaimed
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut reclaimed = 0;
        self.locks.retain(|key, record| {
            if record.is_stale(now) {
                warn!(
                    target: "ledger_audit",
                    resource = %key,
                    stale_owner = %record.owner,
                    "Expired lock swept"
                );
                reclaimed += 1;
                false
            } else {
                true
            }
        });
        reclaimed
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const LONG: Duration = Duration::from_secs(30);

    #[test]
    fn test_exclusive_acquire() {
        let locks = LockManager::default();
        let a = OwnerToken::new_v4();
        let b = OwnerToken::new_v4();

        assert!(locks.acquire("SAR:alice", a, LONG));
        assert!(!locks.acquire("SAR:alice", b, LONG));
        assert_eq!(locks.holder("SAR:alice"), Some(a));

        // Different currency is a different resource
        assert!(locks.acquire("USD:alice", b, LONG));
    }

    #[test]
    fn test_release_idempotent_and_owner_checked() {
        let locks = LockManager::default();
        let a = OwnerToken::new_v4();
        let b = OwnerToken::new_v4();

        assert!(locks.acquire("SAR:alice", a, LONG));
        locks.release("SAR:alice", b); // not the holder
        assert!(locks.is_held("SAR:alice"));

        locks.release("SAR:alice", a);
        locks.release("SAR:alice", a);
        assert!(!locks.is_held("SAR:alice"));
        assert!(locks.acquire("SAR:alice", b, LONG));
    }

    #[test]
    fn test_reentrant_acquire_refreshes() {
        let locks = LockManager::default();
        let a = OwnerToken::new_v4();
        assert!(locks.acquire("k", a, LONG));
        assert!(locks.acquire("k", a, LONG));
        assert_eq!(locks.active_count(), 1);
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let locks = LockManager::default();
        let a = OwnerToken::new_v4();
        let b = OwnerToken::new_v4();

        assert!(locks.acquire("k", a, Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(25));
        assert!(!locks.is_held("k"));
        assert!(locks.acquire("k", b, LONG));
        assert_eq!(locks.holder("k"), Some(b));

        // The evicted owner's release must not drop the new holder
        locks.release("k", a);
        assert_eq!(locks.holder("k"), Some(b));
    }

    #[test]
    fn test_ceiling_caps_timeout() {
        let locks = LockManager::new(Duration::from_millis(10));
        let a = OwnerToken::new_v4();
        assert!(locks.acquire("k", a, Duration::from_secs(3600)));
        thread::sleep(Duration::from_millis(25));
        assert!(locks.acquire("k", OwnerToken::new_v4(), LONG));
    }

    #[test]
    fn test_reap_expired() {
        let locks = LockManager::default();
        assert!(locks.acquire("old", OwnerToken::new_v4(), Duration::from_millis(5)));
        assert!(locks.acquire("live", OwnerToken::new_v4(), LONG));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(locks.reap_expired(), 1);
        assert_eq!(locks.active_count(), 1);
        assert!(locks.is_held("live"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(LockManager::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = locks.clone();
                thread::spawn(move || locks.acquire("SAR:alice", OwnerToken::new_v4(), LONG))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_handle_key() {
        let sar = Currency::parse("SAR").unwrap();
        let handle = LockHandle::for_account(&"alice".to_string(), &sar);
        assert_eq!(handle.key, "SAR:alice");
        assert_ne!(handle.owner, LockHandle::new("SAR:alice").owner);
    }
}
