//! Integration Tests for the Transfer Engine
//!
//! Full state machine runs over an in-memory store with controllable gates,
//! a key store that can be slowed down and a store that fails on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::chain::{ChainRecord, HashChain};
use crate::config::EngineConfig;
use crate::core_types::OwnerToken;
use crate::ledger::LedgerCommitCoordinator;
use crate::lock::LockManager;
use crate::money::Currency;
use crate::persistence::{MemoryStore, Persistence, StoreError};
use crate::signing::{KeyStore, LocalKeyStore, SIGNATURE_LEN, SignatureError, SignatureService};
use crate::transfer::error::{ErrorKind, TransferError};
use crate::transfer::gates::{
    ConfirmationGate, FixedBiometric, FixedConfirmation, FixedDeviceTrust, FixedRiskGate, Gates,
};
use crate::transfer::machine::{CancelSignal, TransferStateMachine};
use crate::transfer::state::TransferState;
use crate::transfer::types::{RiskAssessment, RiskLevel, Transaction, TransferRequest};

// ========================================================================
// Test doubles
// ========================================================================

/// Key store that suspends before signing, like a secure element would
struct SlowKeyStore {
    inner: Arc<LocalKeyStore>,
    delay: Duration,
}

#[async_trait]
impl KeyStore for SlowKeyStore {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn sign(
        &self,
        key_ref: &str,
        payload: &[u8],
    ) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
        tokio::time::sleep(self.delay).await;
        self.inner.sign(key_ref, payload).await
    }

    fn public_key(&self, key_ref: &str) -> Option<[u8; 32]> {
        self.inner.public_key(key_ref)
    }
}

/// Memory store whose writes to chosen keys fail
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    failing: Mutex<Vec<String>>,
    budgets: Mutex<FxHashMap<String, usize>>,
    fail_truncate: AtomicBool,
}

impl FaultyStore {
    fn fail_writes_to(&self, key: &str) {
        self.failing.lock().push(key.to_string());
    }

    /// Let `writes` more writes to `key` through, then fail the rest
    fn fail_writes_to_after(&self, key: &str, writes: usize) {
        self.budgets.lock().insert(key.to_string(), writes);
    }

    fn fail_truncates(&self) {
        self.fail_truncate.store(true, Ordering::SeqCst);
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.lock().iter().any(|k| k == key) {
            return Err(StoreError::Unavailable(format!("injected fault on {key}")));
        }
        if let Some(left) = self.budgets.lock().get_mut(key) {
            if *left == 0 {
                return Err(StoreError::Unavailable(format!("injected fault on {key}")));
            }
            *left -= 1;
        }
        Ok(())
    }
}

impl Persistence for FaultyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.set(key, value)
    }

    fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        self.check(key)?;
        self.inner.append(key, value)
    }

    fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.list(key)
    }

    fn truncate(&self, key: &str, len: usize) -> Result<(), StoreError> {
        if self.fail_truncate.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected truncate fault".into()));
        }
        self.inner.truncate(key, len)
    }
}

/// Re-confirmation that approves while the user hits cancel
struct CancelOnReconfirm {
    cancel: CancelSignal,
}

#[async_trait]
impl ConfirmationGate for CancelOnReconfirm {
    async fn reconfirm(&self, _tx: &Transaction, _assessment: &RiskAssessment) -> bool {
        self.cancel.cancel();
        true
    }
}

// ========================================================================
// Harness
// ========================================================================

struct TestHarness {
    machine: TransferStateMachine,
    chain: Arc<HashChain>,
    locks: Arc<LockManager>,
    coordinator: Arc<LedgerCommitCoordinator>,
    signer: Arc<SignatureService>,
    keys: Arc<LocalKeyStore>,
    risk: Arc<FixedRiskGate>,
    device: Arc<FixedDeviceTrust>,
    biometric: Arc<FixedBiometric>,
    confirmation: Arc<FixedConfirmation>,
    sar: Currency,
}

impl TestHarness {
    fn new() -> Self {
        Self::build(EngineConfig::default(), Arc::new(MemoryStore::new()), None)
    }

    fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Arc::new(MemoryStore::new()), None)
    }

    fn build(
        config: EngineConfig,
        store: Arc<dyn Persistence>,
        sign_delay: Option<Duration>,
    ) -> Self {
        let chain = Arc::new(HashChain::open(store.clone()).unwrap());
        let locks = Arc::new(LockManager::new(config.lock_ceiling()));
        let coordinator =
            Arc::new(LedgerCommitCoordinator::open(chain.clone(), locks.clone(), store).unwrap());

        let keys = Arc::new(LocalKeyStore::new());
        keys.generate("alice");
        keys.generate("bob");
        let key_store: Arc<dyn KeyStore> = match sign_delay {
            Some(delay) => Arc::new(SlowKeyStore {
                inner: keys.clone(),
                delay,
            }),
            None => keys.clone(),
        };
        let signer = Arc::new(SignatureService::new(key_store));

        let risk = Arc::new(FixedRiskGate::new(RiskLevel::Low));
        let device = Arc::new(FixedDeviceTrust::trusted());
        let biometric = Arc::new(FixedBiometric::new(true));
        let confirmation = Arc::new(FixedConfirmation::new(true));
        let gates = Gates {
            risk: risk.clone(),
            device: device.clone(),
            biometric: biometric.clone(),
            confirmation: confirmation.clone(),
        };

        let machine = TransferStateMachine::new(
            config,
            chain.clone(),
            signer.clone(),
            locks.clone(),
            coordinator.clone(),
            gates,
        );

        let sar = Currency::parse("SAR").unwrap();
        coordinator
            .deposit("alice", &sar, Decimal::from(500))
            .unwrap();

        Self {
            machine,
            chain,
            locks,
            coordinator,
            signer,
            keys,
            risk,
            device,
            biometric,
            confirmation,
            sar,
        }
    }

    fn request(amount: i64) -> TransferRequest {
        TransferRequest::new("alice", "bob", Decimal::from(amount), "SAR")
    }

    fn balance(&self, account: &str) -> Decimal {
        self.coordinator.balance(account, &self.sar)
    }

    fn assert_untouched(&self) {
        assert!(self.chain.is_empty());
        assert_eq!(self.balance("alice"), Decimal::from(500));
        assert_eq!(self.balance("bob"), Decimal::ZERO);
        assert!(!self.locks.is_held("SAR:alice"));
        assert_eq!(self.coordinator.in_flight_count(), 0);
    }
}

const SUCCESS_PATH: [TransferState; 7] = [
    TransferState::Idle,
    TransferState::Validating,
    TransferState::Verified,
    TransferState::Signing,
    TransferState::Signed,
    TransferState::Committing,
    TransferState::Committed,
];

// ========================================================================
// Scenarios
// ========================================================================

/// 100 SAR from alice to bob: committed, chained, signed, lock released
#[tokio::test]
async fn test_happy_path_100_sar() {
    let h = TestHarness::new();
    let outcome = h
        .machine
        .execute_transfer(TestHarness::request(100).with_note("rent"))
        .await;

    assert!(outcome.is_committed(), "{:?}", outcome.error);
    assert_eq!(outcome.path, SUCCESS_PATH);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.chain_index, Some(0));
    assert!(outcome.audit_warning.is_none());

    assert_eq!(h.balance("alice"), Decimal::from(400));
    assert_eq!(h.balance("bob"), Decimal::from(100));
    assert!(!h.locks.is_held("SAR:alice"));
    assert_eq!(h.coordinator.in_flight_count(), 0);

    let entry = h.chain.get(0).unwrap();
    let tx = entry.transaction().unwrap();
    assert_eq!(tx.id, outcome.transaction_id);
    assert_eq!(tx.status, TransferState::Committed);
    assert_eq!(tx.note, "rent");
    assert!(h.signer.multi_layer_verify(tx));
    assert!(h.chain.verify_integrity().valid);
    assert_eq!(h.coordinator.history().unwrap().len(), 1);
}

#[tokio::test]
async fn test_critical_risk_is_security_blocked() {
    let h = TestHarness::new();
    h.risk.set(RiskLevel::Critical);

    let outcome = h.machine.execute_transfer(TestHarness::request(100)).await;
    assert_eq!(outcome.final_state, TransferState::Failed);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::SecurityBlocked));
    assert!(!outcome.error.as_ref().unwrap().is_retryable());
    assert_eq!(
        outcome.path,
        vec![
            TransferState::Idle,
            TransferState::Validating,
            TransferState::Failed
        ]
    );
    h.assert_untouched();
}

#[tokio::test]
async fn test_high_risk_requires_reconfirmation() {
    let h = TestHarness::new();
    h.risk.set(RiskLevel::High);

    let outcome = h.machine.execute_transfer(TestHarness::request(100)).await;
    assert!(outcome.is_committed());

    h.confirmation.set(false);
    let outcome = h.machine.execute_transfer(TestHarness::request(100)).await;
    assert_eq!(outcome.final_state, TransferState::Cancelled);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(h.chain.len(), 1);
    assert_eq!(h.balance("alice"), Decimal::from(400));
}

#[tokio::test]
async fn test_medium_risk_proceeds() {
    let h = TestHarness::new();
    h.risk.set(RiskLevel::Medium);
    h.confirmation.set(false);
    assert!(h.machine.execute_transfer(TestHarness::request(1)).await.is_committed());
}

/// Two transfers on the same account+currency: the second finds the lock held
#[tokio::test]
async fn test_concurrent_transfers_same_pair() {
    let config = EngineConfig {
        lock_retry_attempts: 0,
        ..Default::default()
    };
    let h = TestHarness::build(
        config,
        Arc::new(MemoryStore::new()),
        Some(Duration::from_millis(50)),
    );
    let cancel = CancelSignal::new();
    let first = TestHarness::request(100);
    let second = TestHarness::request(100);

    let (a, b) = tokio::join!(
        h.machine.run_once(&first, &cancel),
        h.machine.run_once(&second, &cancel)
    );

    assert!(a.is_committed());
    assert_eq!(b.final_state, TransferState::Failed);
    assert_eq!(b.error_kind(), Some(ErrorKind::LockContention));
    assert!(b.error.as_ref().unwrap().is_retryable());
    assert_eq!(
        b.path,
        vec![
            TransferState::Idle,
            TransferState::Validating,
            TransferState::Verified,
            TransferState::Failed
        ]
    );

    assert_eq!(h.chain.len(), 1);
    assert_eq!(h.balance("alice"), Decimal::from(400));
    assert!(!h.locks.is_held("SAR:alice"));
}

/// Contention is retried transparently, each retry as a new transaction
#[tokio::test]
async fn test_contention_retried_as_new_transaction() {
    let config = EngineConfig {
        lock_retry_attempts: 3,
        lock_retry_backoff_ms: 100,
        ..Default::default()
    };
    let h = TestHarness::build(
        config,
        Arc::new(MemoryStore::new()),
        Some(Duration::from_millis(20)),
    );

    let (a, b) = tokio::join!(
        h.machine.execute_transfer(TestHarness::request(100)),
        h.machine.execute_transfer(TestHarness::request(50))
    );

    assert!(a.is_committed());
    assert!(b.is_committed());
    assert_eq!(a.attempts, 1);
    assert_eq!(b.attempts, 2);
    assert_ne!(a.transaction_id, b.transaction_id);
    assert_eq!(h.chain.len(), 2);
    assert_eq!(h.balance("alice"), Decimal::from(350));
    assert!(h.chain.verify_integrity().valid);
}

#[tokio::test]
async fn test_contention_exhausts_retries() {
    let config = EngineConfig {
        lock_retry_attempts: 2,
        lock_retry_backoff_ms: 1,
        ..Default::default()
    };
    let h = TestHarness::with_config(config);
    let squatter = OwnerToken::new_v4();
    assert!(h.locks.acquire("SAR:alice", squatter, Duration::from_secs(30)));

    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::LockContention));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.locks.holder("SAR:alice"), Some(squatter));
}

#[tokio::test]
async fn test_stale_lock_reclaimed_by_transfer() {
    let h = TestHarness::new();
    assert!(h.locks.acquire("SAR:alice", OwnerToken::new_v4(), Duration::from_millis(5)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert!(outcome.is_committed());
    assert_eq!(outcome.attempts, 1);
}

/// Amount edited after commit: integrity walk pinpoints the entry and the
/// next transfer from the account is refused
#[tokio::test]
async fn test_post_hoc_amount_tampering() {
    let h = TestHarness::new();
    for amount in [10, 20, 30] {
        assert!(h.machine.execute_transfer(TestHarness::request(amount)).await.is_committed());
    }
    assert!(h.chain.verify_integrity().valid);

    h.chain.tamper(1, |entry| {
        if let ChainRecord::Transfer(tx) = &mut entry.record {
            tx.amount = Decimal::from(20_000);
        }
    });

    let report = h.chain.verify_integrity();
    assert!(!report.valid);
    assert_eq!(report.broken_at_index, Some(1));

    let outcome = h.machine.execute_transfer(TestHarness::request(5)).await;
    assert_eq!(outcome.final_state, TransferState::Failed);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::ChainIntegrityViolation));
    assert!(h.machine.is_frozen("alice"));
    assert_eq!(h.chain.len(), 3);

    // Frozen until cleared, even for a different currency
    let outcome = h
        .machine
        .execute_transfer(TransferRequest::new("alice", "bob", Decimal::ONE, "USD"))
        .await;
    assert!(matches!(outcome.error, Some(TransferError::AccountFrozen(_))));

    assert!(h.machine.clear_freeze("alice"));
    assert!(!h.machine.is_frozen("alice"));
}

/// A committed note is covered by the entry hash as well as the signature
#[tokio::test]
async fn test_post_hoc_note_edit_detected() {
    let h = TestHarness::new();
    let outcome = h
        .machine
        .execute_transfer(TestHarness::request(100).with_note("rent"))
        .await;
    assert!(outcome.is_committed());

    h.chain.tamper(0, |entry| {
        if let ChainRecord::Transfer(tx) = &mut entry.record {
            tx.note = "pay mallory".into();
        }
    });

    let report = h.chain.verify_integrity();
    assert!(!report.valid);
    assert_eq!(report.broken_at_index, Some(0));
    let entry = h.chain.get(0).unwrap();
    assert!(!h.signer.multi_layer_verify(entry.transaction().unwrap()));
}

/// Violation found after commit is reported, never unwound
#[tokio::test]
async fn test_post_commit_audit_is_non_blocking() {
    let config = EngineConfig {
        verify_chain_before_transfer: false,
        ..Default::default()
    };
    let h = TestHarness::with_config(config);
    assert!(h.machine.execute_transfer(TestHarness::request(10)).await.is_committed());
    h.chain.tamper(0, |entry| {
        if let ChainRecord::Transfer(tx) = &mut entry.record {
            tx.receiver = "mallory".into();
        }
    });

    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert!(outcome.is_committed());
    assert!(outcome.audit_warning.as_deref().unwrap().contains("index Some(0)"));
    assert!(h.machine.is_frozen("alice"));
    assert_eq!(h.chain.len(), 2);
    assert_eq!(h.balance("alice"), Decimal::from(480));
}

// ========================================================================
// Atomicity under injected faults
// ========================================================================

async fn commit_with_fault(fault: impl FnOnce(&FaultyStore)) -> (TestHarness, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    let h = TestHarness::build(EngineConfig::default(), store.clone(), None);
    fault(&store);

    let outcome = h.machine.execute_transfer(TestHarness::request(100)).await;
    assert_eq!(outcome.final_state, TransferState::Failed);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::CommitFailure));
    assert_eq!(
        outcome.path[outcome.path.len() - 2..],
        [TransferState::Committing, TransferState::Failed]
    );
    (h, store)
}

#[tokio::test]
async fn test_fault_on_chain_append() {
    let (h, _) = commit_with_fault(|s| s.fail_writes_to("chain")).await;
    h.assert_untouched();
}

#[tokio::test]
async fn test_fault_on_balance_update() {
    let (h, store) = commit_with_fault(|s| s.fail_writes_to("balances")).await;
    h.assert_untouched();
    assert!(store.list("chain").unwrap().is_empty());
}

#[tokio::test]
async fn test_fault_on_history() {
    let (h, store) = commit_with_fault(|s| s.fail_writes_to("history")).await;
    h.assert_untouched();
    assert!(store.list("chain").unwrap().is_empty());
    assert!(h.coordinator.history().unwrap().is_empty());

    // Reopen from the store: nothing of the failed commit survives
    let chain = HashChain::open(store.clone()).unwrap();
    assert!(chain.is_empty());
    let coordinator =
        LedgerCommitCoordinator::open(Arc::new(chain), Arc::new(LockManager::default()), store)
            .unwrap();
    assert_eq!(coordinator.balance("alice", &h.sar), Decimal::from(500));
}

/// History fails, then the balance restore write fails too: memory still
/// goes back to the pre-commit balances
#[tokio::test]
async fn test_fault_on_history_and_balance_restore() {
    let (h, store) = commit_with_fault(|s| {
        s.fail_writes_to("history");
        s.fail_writes_to_after("balances", 1);
    })
    .await;
    h.assert_untouched();
    assert!(store.list("chain").unwrap().is_empty());

    // The store missed the restore; the next balance write brings it in line
    let receipt = h.coordinator.deposit("carol", &h.sar, Decimal::ONE);
    assert!(receipt.is_err());
    store.budgets.lock().clear();
    h.coordinator.deposit("carol", &h.sar, Decimal::ONE).unwrap();

    let chain = Arc::new(HashChain::open(store.clone()).unwrap());
    let reopened =
        LedgerCommitCoordinator::open(chain, Arc::new(LockManager::default()), store).unwrap();
    assert_eq!(reopened.balance("alice", &h.sar), Decimal::from(500));
    assert_eq!(reopened.balance("bob", &h.sar), Decimal::ZERO);
}

/// Entry cannot be removed: a reversal marker is appended instead
#[tokio::test]
async fn test_fault_with_unremovable_entry_appends_reversal() {
    let (h, _) = commit_with_fault(|s| {
        s.fail_writes_to("history");
        s.fail_truncates();
    })
    .await;

    assert_eq!(h.chain.len(), 2);
    let entries = h.chain.entries();
    let reversed = entries[0].transaction().unwrap().id;
    assert!(matches!(entries[1].record, ChainRecord::Reversal { .. }));
    assert!(h.chain.is_reversed(reversed));
    assert!(h.chain.verify_integrity().valid);
    assert_eq!(h.balance("alice"), Decimal::from(500));
    assert_eq!(h.balance("bob"), Decimal::ZERO);
    assert!(!h.locks.is_held("SAR:alice"));
}

// ========================================================================
// Gates and validation
// ========================================================================

#[tokio::test]
async fn test_invalid_requests_fail_before_validating() {
    let h = TestHarness::new();
    let cases = [
        (TransferRequest::new("alice", "bob", Decimal::ZERO, "SAR"), "INVALID_AMOUNT"),
        (TransferRequest::new("alice", "bob", Decimal::from(-5), "SAR"), "INVALID_AMOUNT"),
        (TransferRequest::new("alice", "bob", Decimal::ONE, ""), "MISSING_CURRENCY"),
        (TransferRequest::new("alice", "bob", Decimal::ONE, "sar1"), "INVALID_CURRENCY"),
        (TransferRequest::new("alice", " ", Decimal::ONE, "SAR"), "MISSING_RECEIVER"),
        (TransferRequest::new("alice", "alice", Decimal::ONE, "SAR"), "SAME_ACCOUNT"),
        (
            TransferRequest::new("alice", "bob", Decimal::new(1, 9), "SAR"),
            "PRECISION_OVERFLOW",
        ),
        (
            TransferRequest::new("alice", "bob", Decimal::ONE, "SAR").with_note("x".repeat(257)),
            "NOTE_TOO_LONG",
        ),
    ];

    for (request, code) in cases {
        let outcome = h.machine.execute_transfer(request).await;
        assert_eq!(outcome.final_state, TransferState::Failed);
        assert_eq!(outcome.error.as_ref().map(TransferError::code), Some(code));
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationError));
        assert_eq!(outcome.path, vec![TransferState::Idle, TransferState::Failed]);
    }
    assert_eq!(h.biometric.prompts(), 0);
    h.assert_untouched();
}

#[tokio::test]
async fn test_device_and_biometric_gates() {
    let h = TestHarness::new();

    h.device.set_tampered(true);
    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::SecurityBlocked));
    assert_eq!(h.biometric.prompts(), 0);

    h.device.set_tampered(false);
    h.device.set_secure(false);
    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert_eq!(outcome.error, Some(TransferError::DeviceCompromised));

    h.device.set_secure(true);
    h.biometric.set(false);
    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert_eq!(outcome.error, Some(TransferError::BiometricRejected));
    assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationError));
    h.assert_untouched();
}

#[tokio::test]
async fn test_insufficient_balance() {
    let h = TestHarness::new();
    let outcome = h.machine.execute_transfer(TestHarness::request(501)).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::InsufficientBalance));
    assert_eq!(
        outcome.error.as_ref().unwrap().user_message(),
        "Your balance is too low for this transfer. Add funds or lower the amount."
    );
    h.assert_untouched();
}

#[tokio::test]
async fn test_signing_failure_releases_lock() {
    let h = TestHarness::new();
    h.keys.remove("alice");

    let outcome = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert_eq!(outcome.final_state, TransferState::Failed);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::SignatureFailure));
    assert_eq!(
        outcome.path.last().copied(),
        Some(TransferState::Failed)
    );
    assert!(outcome.path.contains(&TransferState::Signing));
    h.assert_untouched();
}

// ========================================================================
// Cancellation and terminal states
// ========================================================================

#[tokio::test]
async fn test_cancel_before_lock() {
    let h = TestHarness::new();
    let cancel = CancelSignal::new();
    cancel.cancel();

    let outcome = h
        .machine
        .execute_transfer_with_cancel(TestHarness::request(10), &cancel)
        .await;
    assert_eq!(outcome.final_state, TransferState::Cancelled);
    assert_eq!(
        outcome.path,
        vec![
            TransferState::Idle,
            TransferState::Validating,
            TransferState::Cancelled
        ]
    );
    h.assert_untouched();
}

/// Cancel arriving with the last gate lands in VERIFIED, before the lock
#[tokio::test]
async fn test_cancel_in_verified() {
    let h = TestHarness::new();
    let cancel = CancelSignal::new();
    let gates = Gates {
        risk: Arc::new(FixedRiskGate::new(RiskLevel::High)),
        device: Arc::new(FixedDeviceTrust::trusted()),
        biometric: Arc::new(FixedBiometric::new(true)),
        confirmation: Arc::new(CancelOnReconfirm {
            cancel: cancel.clone(),
        }),
    };
    let machine = TransferStateMachine::new(
        EngineConfig::default(),
        h.chain.clone(),
        h.signer.clone(),
        h.locks.clone(),
        h.coordinator.clone(),
        gates,
    );

    let outcome = machine
        .execute_transfer_with_cancel(TestHarness::request(10), &cancel)
        .await;
    assert_eq!(outcome.final_state, TransferState::Cancelled);
    assert_eq!(
        outcome.path,
        vec![
            TransferState::Idle,
            TransferState::Validating,
            TransferState::Verified,
            TransferState::Cancelled
        ]
    );
    h.assert_untouched();
}

#[tokio::test]
async fn test_cancel_ignored_once_lock_held() {
    let h = TestHarness::build(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        Some(Duration::from_millis(40)),
    );
    let cancel = CancelSignal::new();

    let (outcome, ()) = tokio::join!(
        h.machine
            .execute_transfer_with_cancel(TestHarness::request(10), &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        }
    );
    assert!(outcome.is_committed());
}

#[tokio::test]
async fn test_failed_transfer_restarts_with_new_id() {
    let h = TestHarness::new();
    h.biometric.set(false);
    let failed = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert!(failed.final_state.is_terminal());

    h.biometric.set(true);
    let retried = h.machine.execute_transfer(TestHarness::request(10)).await;
    assert!(retried.is_committed());
    assert_ne!(failed.transaction_id, retried.transaction_id);
    assert_eq!(h.biometric.prompts(), 2);

    for state in [
        TransferState::Validating,
        TransferState::Signing,
        TransferState::Idle,
    ] {
        assert!(!retried.final_state.can_transition_to(state));
        assert!(!failed.final_state.can_transition_to(state));
    }
}
