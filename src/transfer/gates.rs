//! External Gates
//!
//! Outside services the state machine consults while validating a transfer.
//! Each is a trait so hosts can plug in their own implementation; the
//! `Fixed*` gates return configurable answers and [`AmountRiskGate`] scores
//! by amount.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{RiskAssessment, RiskLevel, Transaction};

/// Risk / fraud scoring
#[async_trait]
pub trait RiskGate: Send + Sync {
    async fn assess(&self, tx: &Transaction) -> RiskAssessment;
}

/// Device integrity attestation
#[async_trait]
pub trait DeviceTrustGate: Send + Sync {
    async fn is_device_secure(&self) -> bool;
    async fn is_tampered(&self) -> bool;
}

/// User presence check
#[async_trait]
pub trait BiometricGate: Send + Sync {
    async fn confirm(&self, user_id: &str) -> bool;
}

/// Explicit user re-confirmation of a high-risk transfer.
///
/// Returning `false` means the user declined and the transfer is cancelled.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn reconfirm(&self, tx: &Transaction, assessment: &RiskAssessment) -> bool;
}

/// The full set of gates injected into the state machine
#[derive(Clone)]
pub struct Gates {
    pub risk: Arc<dyn RiskGate>,
    pub device: Arc<dyn DeviceTrustGate>,
    pub biometric: Arc<dyn BiometricGate>,
    pub confirmation: Arc<dyn ConfirmationGate>,
}

impl Gates {
    /// Low risk, trusted device, biometric approved, re-confirmation accepted
    pub fn permissive() -> Self {
        Self {
            risk: Arc::new(FixedRiskGate::new(RiskLevel::Low)),
            device: Arc::new(FixedDeviceTrust::trusted()),
            biometric: Arc::new(FixedBiometric::new(true)),
            confirmation: Arc::new(FixedConfirmation::new(true)),
        }
    }
}

// ============================================================
// AMOUNT-BASED RISK
// ============================================================

/// Scores a transfer by amount against fixed thresholds
#[derive(Debug, Clone)]
pub struct AmountRiskGate {
    pub medium_above: Decimal,
    pub high_above: Decimal,
    pub critical_above: Decimal,
}

#[async_trait]
impl RiskGate for AmountRiskGate {
    async fn assess(&self, tx: &Transaction) -> RiskAssessment {
        let (level, flag) = if tx.amount > self.critical_above {
            (RiskLevel::Critical, Some("amount_critical"))
        } else if tx.amount > self.high_above {
            (RiskLevel::High, Some("amount_high"))
        } else if tx.amount > self.medium_above {
            (RiskLevel::Medium, None)
        } else {
            (RiskLevel::Low, None)
        };
        RiskAssessment::with_flags(level, flag.into_iter().map(String::from).collect())
    }
}

// ============================================================
// FIXED GATES
// ============================================================

/// Risk gate returning a settable level
#[derive(Debug)]
pub struct FixedRiskGate {
    level: AtomicU8,
}

impl FixedRiskGate {
    pub fn new(level: RiskLevel) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
        }
    }

    pub fn set(&self, level: RiskLevel) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    fn level(&self) -> RiskLevel {
        match self.level.load(Ordering::SeqCst) {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            2 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

#[async_trait]
impl RiskGate for FixedRiskGate {
    async fn assess(&self, _tx: &Transaction) -> RiskAssessment {
        let level = self.level();
        let flags = match level {
            RiskLevel::Low | RiskLevel::Medium => Vec::new(),
            other => vec![format!("fixed_{}", other.as_str())],
        };
        RiskAssessment::with_flags(level, flags)
    }
}

/// Device attestation with settable answers
#[derive(Debug)]
pub struct FixedDeviceTrust {
    secure: AtomicBool,
    tampered: AtomicBool,
}

impl FixedDeviceTrust {
    pub fn new(secure: bool, tampered: bool) -> Self {
        Self {
            secure: AtomicBool::new(secure),
            tampered: AtomicBool::new(tampered),
        }
    }

    pub fn trusted() -> Self {
        Self::new(true, false)
    }

    pub fn set_secure(&self, secure: bool) {
        self.secure.store(secure, Ordering::SeqCst);
    }

    pub fn set_tampered(&self, tampered: bool) {
        self.tampered.store(tampered, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceTrustGate for FixedDeviceTrust {
    async fn is_device_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    async fn is_tampered(&self) -> bool {
        self.tampered.load(Ordering::SeqCst)
    }
}

/// Biometric gate with a settable answer; counts prompts
#[derive(Debug)]
pub struct FixedBiometric {
    approve: AtomicBool,
    prompts: AtomicUsize,
}

impl FixedBiometric {
    pub fn new(approve: bool) -> Self {
        Self {
            approve: AtomicBool::new(approve),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, approve: bool) {
        self.approve.store(approve, Ordering::SeqCst);
    }

    /// Number of times the user was prompted
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricGate for FixedBiometric {
    async fn confirm(&self, _user_id: &str) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.approve.load(Ordering::SeqCst)
    }
}

/// Re-confirmation gate with a settable answer
#[derive(Debug)]
pub struct FixedConfirmation {
    accept: AtomicBool,
}

impl FixedConfirmation {
    pub fn new(accept: bool) -> Self {
        Self {
            accept: AtomicBool::new(accept),
        }
    }

    pub fn set(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfirmationGate for FixedConfirmation {
    async fn reconfirm(&self, _tx: &Transaction, _assessment: &RiskAssessment) -> bool {
        self.accept.load(Ordering::SeqCst)
    }
}
