//! Transfer State Machine
//!
//! Drives one transfer request through
//!
//! ```text
//! IDLE → VALIDATING → VERIFIED → SIGNING → SIGNED → COMMITTING → COMMITTED
//!   │         │           │          │        │          │
//!   └─────────┴─────┬─────┴──────────┴────────┴──────────┘
//!                   ▼
//!       FAILED (any)   CANCELLED (VALIDATING / VERIFIED only)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Lock before signing**: no transaction enters SIGNING without the
//!    `currency:account` lock, and the lock is held until a terminal state
//! 2. **Gates before the lock**: every gate call (device, biometric, risk,
//!    re-confirmation) completes before the lock is taken
//! 3. **Full unwind**: any failure after the lock is taken goes through
//!    [`LedgerCommitCoordinator::rollback`]
//! 4. **Fresh retries**: a retried attempt is a new transaction with a new id

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainEntry, HashChain};
use crate::config::EngineConfig;
use crate::core_types::AccountId;
use crate::ledger::LedgerCommitCoordinator;
use crate::lock::{LockHandle, LockManager};
use crate::money::{Currency, normalize_amount};
use crate::signing::SignatureService;

use super::error::TransferError;
use super::gates::Gates;
use super::state::TransferState;
use super::types::{RiskLevel, Transaction, TransactionId, TransferOutcome, TransferRequest};

/// Cooperative cancellation flag shared with the UI layer.
///
/// Checked at each boundary before the lock is taken; ignored afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One attempt: a single transaction and the states it visited
struct Attempt {
    tx: Transaction,
    path: Vec<TransferState>,
    lock: Option<LockHandle>,
}

impl Attempt {
    fn advance(&mut self, next: TransferState) -> Result<(), TransferError> {
        let from = self.tx.status;
        if !from.can_transition_to(next) {
            return Err(TransferError::InvalidStateTransition { from, to: next });
        }
        debug!(tx_id = %self.tx.id, from = %from, to = %next, "Transfer state changed");
        self.tx.status = next;
        self.path.push(next);
        Ok(())
    }
}

pub struct TransferStateMachine {
    config: EngineConfig,
    chain: Arc<HashChain>,
    signer: Arc<SignatureService>,
    locks: Arc<LockManager>,
    coordinator: Arc<LedgerCommitCoordinator>,
    gates: Gates,
    frozen: DashSet<AccountId>,
}

impl TransferStateMachine {
    pub fn new(
        config: EngineConfig,
        chain: Arc<HashChain>,
        signer: Arc<SignatureService>,
        locks: Arc<LockManager>,
        coordinator: Arc<LedgerCommitCoordinator>,
        gates: Gates,
    ) -> Self {
        Self {
            config,
            chain,
            signer,
            locks,
            coordinator,
            gates,
            frozen: DashSet::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<HashChain> {
        &self.chain
    }

    pub fn coordinator(&self) -> &Arc<LedgerCommitCoordinator> {
        &self.coordinator
    }

    // ============================================================
    // ACCOUNT FREEZE
    // ============================================================

    pub fn is_frozen(&self, account: &str) -> bool {
        self.frozen.contains(account)
    }

    /// Lift a freeze after the integrity violation has been reviewed
    pub fn clear_freeze(&self, account: &str) -> bool {
        let cleared = self.frozen.remove(account).is_some();
        if cleared {
            info!(target: "ledger_audit", account, "Account freeze cleared");
        }
        cleared
    }

    pub fn frozen_accounts(&self) -> Vec<AccountId> {
        self.frozen.iter().map(|a| a.key().clone()).collect()
    }

    fn freeze(&self, account: &str, reason: &str) {
        if self.frozen.insert(account.to_string()) {
            error!(target: "ledger_audit", account, reason, "Account frozen");
        }
    }

    // ============================================================
    // ENTRY POINTS
    // ============================================================

    /// Run a transfer to a terminal state, retrying lock contention.
    ///
    /// Never panics and never returns an error: every failure is reported in
    /// the outcome.
    pub async fn execute_transfer(&self, request: TransferRequest) -> TransferOutcome {
        self.execute_transfer_with_cancel(request, &CancelSignal::new())
            .await
    }

    pub async fn execute_transfer_with_cancel(
        &self,
        request: TransferRequest,
        cancel: &CancelSignal,
    ) -> TransferOutcome {
        let max_attempts = self.config.lock_retry_attempts.saturating_add(1);
        let mut attempt = 1;

        loop {
            let mut outcome = self.run_once(&request, cancel).await;
            outcome.attempts = attempt;

            let contended = matches!(outcome.error, Some(TransferError::LockContention { .. }));
            if !contended || attempt >= max_attempts {
                return outcome;
            }

            let backoff = self.config.retry_backoff() * attempt;
            debug!(
                tx_id = %outcome.transaction_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Lock contention, retrying with a new transaction"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Single attempt with no retry
    pub async fn run_once(
        &self,
        request: &TransferRequest,
        cancel: &CancelSignal,
    ) -> TransferOutcome {
        let (currency, amount) = match self.validate_request(request) {
            Ok(valid) => valid,
            Err(e) => {
                let transaction_id = TransactionId::new();
                info!(
                    tx_id = %transaction_id,
                    code = e.code(),
                    error = %e,
                    "Transfer request rejected"
                );
                return TransferOutcome {
                    final_state: TransferState::Failed,
                    transaction_id,
                    error: Some(e),
                    attempts: 1,
                    path: vec![TransferState::Idle, TransferState::Failed],
                    audit_warning: None,
                    chain_index: None,
                };
            }
        };

        let tx = Transaction::draft(
            request.sender.trim().to_string(),
            request.receiver.trim().to_string(),
            amount,
            currency,
            request.note.clone(),
        );
        let mut attempt = Attempt {
            path: vec![TransferState::Idle, tx.status],
            tx,
            lock: None,
        };

        match self.drive(&mut attempt, cancel).await {
            Ok(entry) => {
                self.coordinator.finish(attempt.tx.id);
                let audit_warning = self.post_commit_audit(&attempt.tx);
                TransferOutcome {
                    final_state: attempt.tx.status,
                    transaction_id: attempt.tx.id,
                    error: None,
                    attempts: 1,
                    path: attempt.path,
                    audit_warning,
                    chain_index: Some(entry.index),
                }
            }
            Err(e) => self.abort(attempt, e),
        }
    }

    // ============================================================
    // PHASES
    // ============================================================

    /// IDLE → VALIDATING input checks
    fn validate_request(
        &self,
        request: &TransferRequest,
    ) -> Result<(Currency, Decimal), TransferError> {
        if request.sender.trim().is_empty() {
            return Err(TransferError::MissingSender);
        }
        let amount = normalize_amount(request.amount)?;
        let currency = Currency::parse(&request.currency)?;

        let receiver = request.receiver.trim();
        if receiver.is_empty() {
            return Err(TransferError::MissingReceiver);
        }
        if receiver == request.sender.trim() {
            return Err(TransferError::SameAccount);
        }
        if request.note.chars().count() > self.config.max_note_len {
            return Err(TransferError::NoteTooLong {
                max: self.config.max_note_len,
            });
        }
        Ok((currency, amount))
    }

    async fn drive(
        &self,
        attempt: &mut Attempt,
        cancel: &CancelSignal,
    ) -> Result<ChainEntry, TransferError> {
        self.validating(attempt, cancel).await?;
        attempt.advance(TransferState::Verified)?;
        check_cancel(cancel)?;

        self.acquire_lock(attempt)?;
        attempt.advance(TransferState::Signing)?;

        self.sign(attempt).await?;
        attempt.advance(TransferState::Signed)?;

        attempt.advance(TransferState::Committing)?;
        let entry = self.coordinator.commit(&attempt.tx)?;
        attempt.advance(TransferState::Committed)?;

        info!(
            tx_id = %attempt.tx.id,
            index = entry.index,
            sender = %attempt.tx.sender,
            receiver = %attempt.tx.receiver,
            amount = %attempt.tx.amount,
            currency = %attempt.tx.currency,
            "Transfer committed"
        );
        Ok(entry)
    }

    /// VALIDATING: freeze, chain, device, biometric, balance, risk
    async fn validating(
        &self,
        attempt: &Attempt,
        cancel: &CancelSignal,
    ) -> Result<(), TransferError> {
        let tx = &attempt.tx;
        check_cancel(cancel)?;

        if self.is_frozen(&tx.sender) {
            return Err(TransferError::AccountFrozen(tx.sender.clone()));
        }

        if self.config.verify_chain_before_transfer {
            let report = self.chain.verify_integrity();
            if !report.valid {
                let reason = report.reason.unwrap_or_default();
                self.freeze(&tx.sender, &reason);
                return Err(TransferError::ChainIntegrity {
                    index: report.broken_at_index,
                    reason,
                });
            }
        }

        let device = &self.gates.device;
        if !device.is_device_secure().await || device.is_tampered().await {
            warn!(target: "ledger_audit", tx_id = %tx.id, "Untrusted device");
            return Err(TransferError::DeviceCompromised);
        }
        check_cancel(cancel)?;

        if !self.gates.biometric.confirm(&tx.sender).await {
            return Err(TransferError::BiometricRejected);
        }
        check_cancel(cancel)?;

        let available = self.coordinator.balance(&tx.sender, &tx.currency);
        if available < tx.amount {
            return Err(TransferError::InsufficientBalance {
                available,
                required: tx.amount,
            });
        }

        let assessment = self.gates.risk.assess(tx).await;
        match assessment.level {
            RiskLevel::Critical => {
                warn!(
                    target: "ledger_audit",
                    tx_id = %tx.id,
                    flags = ?assessment.flags,
                    "Transfer blocked by risk gate"
                );
                return Err(TransferError::CriticalRisk {
                    flags: assessment.flags,
                });
            }
            RiskLevel::High => {
                if !self.gates.confirmation.reconfirm(tx, &assessment).await {
                    return Err(TransferError::Cancelled(
                        "high-risk transfer was not re-confirmed".to_string(),
                    ));
                }
                debug!(tx_id = %tx.id, "High-risk transfer re-confirmed");
            }
            RiskLevel::Low | RiskLevel::Medium => {}
        }
        Ok(())
    }

    /// VERIFIED → SIGNING: take the `currency:account` lock
    fn acquire_lock(&self, attempt: &mut Attempt) -> Result<(), TransferError> {
        let handle = LockHandle::for_account(&attempt.tx.sender, &attempt.tx.currency);
        if !self
            .locks
            .acquire(&handle.key, handle.owner, self.config.lock_timeout())
        {
            return Err(TransferError::LockContention {
                resource: handle.key,
            });
        }
        self.coordinator.register_lock(attempt.tx.id, handle.clone());
        attempt.lock = Some(handle);
        Ok(())
    }

    /// SIGNING: link to head, sign, run every verification layer
    async fn sign(&self, attempt: &mut Attempt) -> Result<(), TransferError> {
        let tx = &mut attempt.tx;
        tx.seal(self.chain.head_hash())?;

        let key_ref = tx.sender.clone();
        self.signer.sign_transaction(tx, &key_ref).await?;

        self.signer.check_layers(tx).map_err(|layer| {
            warn!(
                target: "ledger_audit",
                tx_id = %tx.id,
                layer = %layer,
                "Multi-layer verification failed"
            );
            TransferError::VerificationFailed { layer }
        })
    }

    /// Terminal failure: unwind whatever the attempt holds
    fn abort(&self, mut attempt: Attempt, e: TransferError) -> TransferOutcome {
        if attempt.lock.is_some()
            && let Err(rollback_err) = self.coordinator.rollback(attempt.tx.id)
        {
            error!(
                target: "ledger_audit",
                tx_id = %attempt.tx.id,
                error = %rollback_err,
                "Rollback incomplete"
            );
        }

        let terminal = match e {
            TransferError::Cancelled(_) if attempt.tx.status.is_cancellable() => {
                TransferState::Cancelled
            }
            _ => TransferState::Failed,
        };
        if let Err(transition) = attempt.advance(terminal) {
            error!(tx_id = %attempt.tx.id, error = %transition, "Terminal transition refused");
            attempt.tx.status = TransferState::Failed;
            attempt.path.push(TransferState::Failed);
        }

        info!(
            tx_id = %attempt.tx.id,
            state = %attempt.tx.status,
            kind = %e.kind(),
            code = e.code(),
            error = %e,
            "Transfer ended without commit"
        );
        TransferOutcome {
            final_state: attempt.tx.status,
            transaction_id: attempt.tx.id,
            error: Some(e),
            attempts: 1,
            path: attempt.path,
            audit_warning: None,
            chain_index: None,
        }
    }

    /// Best-effort chain walk after a commit; findings never unwind it
    fn post_commit_audit(&self, tx: &Transaction) -> Option<String> {
        let report = self.chain.verify_integrity();
        if report.valid {
            return None;
        }
        let warning = format!(
            "chain integrity check failed at index {:?}: {}",
            report.broken_at_index,
            report.reason.as_deref().unwrap_or("unknown")
        );
        warn!(target: "ledger_audit", tx_id = %tx.id, warning = %warning, "Post-commit audit");
        self.freeze(&tx.sender, &warning);
        Some(warning)
    }
}

fn check_cancel(cancel: &CancelSignal) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled("cancelled by user".to_string()));
    }
    Ok(())
}
