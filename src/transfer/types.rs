//! Transfer Core Types
//!
//! Type definitions for the transfer FSM and the ledger data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::{Digest, compute_merkle_root};
use crate::core_types::{AccountId, ChainIndex};
use crate::money::{Currency, canonical_amount};

use super::error::{ErrorKind, TransferError};
use super::state::TransferState;

/// Transaction ID type - ULID-based unique identifier
///
/// Using ULID provides:
/// - Monotonic, sortable IDs
/// - No coordination needed
/// - 128-bit with good entropy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    /// Generate a new unique TransactionId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Isolation level requested by a transaction. This engine only runs
/// serializable transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "serializable",
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Transfer request from the UI layer
///
/// `receiver` and `currency` are raw strings: an empty value means the user
/// left the field blank and is rejected during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Authenticated account initiating the transfer
    pub sender: AccountId,
    pub receiver: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub note: String,
}

impl TransferRequest {
    pub fn new(
        sender: impl Into<AccountId>,
        receiver: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            currency: currency.into(),
            note: String::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Ledger transaction
///
/// Created in memory when validation starts; appended to the chain only once
/// it reaches `committing`. The signature is private so it can only be set
/// once, through [`Transaction::attach_signature`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub timestamp: DateTime<Utc>,
    pub note: String,
    pub status: TransferState,
    pub previous_hash: Option<Digest>,
    pub merkle_root: Option<Digest>,
    #[serde(default, with = "hex_signature")]
    signature: Option<Vec<u8>>,
    /// Hex-encoded public key of the signer
    pub signer_key: Option<String>,
    pub isolation: IsolationLevel,
}

impl Transaction {
    /// Build an unsigned transaction in `validating`
    pub fn draft(
        sender: AccountId,
        receiver: AccountId,
        amount: Decimal,
        currency: Currency,
        note: String,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            sender,
            receiver,
            amount,
            currency,
            // Millisecond precision is what the Merkle leaf covers
            timestamp: Utc::now().trunc_subsecs(3),
            note,
            status: TransferState::Validating,
            previous_hash: None,
            merkle_root: None,
            signature: None,
            signer_key: None,
            isolation: IsolationLevel::Serializable,
        }
    }

    /// Canonical Merkle leaves: id, sender, receiver, amount, currency, timestamp
    pub fn canonical_fields(&self) -> [String; 6] {
        [
            self.id.to_string(),
            self.sender.clone(),
            self.receiver.clone(),
            canonical_amount(&self.amount),
            self.currency.to_string(),
            self.timestamp.timestamp_millis().to_string(),
        ]
    }

    /// Recompute the Merkle root from the transaction's own fields
    pub fn compute_merkle_root(&self) -> Digest {
        compute_merkle_root(&self.canonical_fields())
    }

    /// Whether the stored Merkle root matches the fields
    pub fn merkle_matches(&self) -> bool {
        self.merkle_root == Some(self.compute_merkle_root())
    }

    /// Link to the chain head and fix the Merkle root.
    ///
    /// # Errors
    /// `SignatureImmutable` once signed: the link is covered by the signature.
    pub fn seal(&mut self, previous_hash: Digest) -> Result<(), TransferError> {
        if self.signature.is_some() {
            return Err(TransferError::SignatureImmutable(self.id));
        }
        self.previous_hash = Some(previous_hash);
        self.merkle_root = Some(self.compute_merkle_root());
        Ok(())
    }

    /// Bytes covered by the signature, `None` until sealed.
    ///
    /// Every part is length-prefixed (u32 LE) so field boundaries cannot shift.
    pub fn signing_payload(&self) -> Option<Vec<u8>> {
        let previous = self.previous_hash?.to_hex();
        let root = self.merkle_root?.to_hex();

        let mut payload = Vec::with_capacity(256);
        let fields = self.canonical_fields();
        let parts = fields.iter().map(String::as_str).chain([
            self.note.as_str(),
            previous.as_str(),
            root.as_str(),
            self.isolation.as_str(),
        ]);
        for part in parts {
            payload.extend_from_slice(&(part.len() as u32).to_le_bytes());
            payload.extend_from_slice(part.as_bytes());
        }
        Some(payload)
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Attach the signature exactly once.
    pub fn attach_signature(
        &mut self,
        signature: Vec<u8>,
        signer_key: String,
    ) -> Result<(), TransferError> {
        if self.signature.is_some() {
            return Err(TransferError::SignatureImmutable(self.id));
        }
        self.signature = Some(signature);
        self.signer_key = Some(signer_key);
        Ok(())
    }

    /// First structural defect, if any.
    ///
    /// Checks presence and shape of every field a committed transaction must
    /// carry; cryptographic validity is checked elsewhere.
    pub fn structural_defect(&self) -> Option<&'static str> {
        if self.sender.trim().is_empty() {
            return Some("sender missing");
        }
        if self.receiver.trim().is_empty() {
            return Some("receiver missing");
        }
        if self.sender == self.receiver {
            return Some("sender equals receiver");
        }
        if self.amount <= Decimal::ZERO {
            return Some("amount not positive");
        }
        if self.previous_hash.is_none() {
            return Some("previous hash missing");
        }
        if self.merkle_root.is_none() {
            return Some("merkle root missing");
        }
        match &self.signature {
            None => return Some("signature missing"),
            Some(sig) if sig.len() != 64 => return Some("signature length"),
            _ => {}
        }
        match &self.signer_key {
            None => return Some("signer key missing"),
            Some(key) if key.len() != 64 => return Some("signer key length"),
            _ => {}
        }
        if self.isolation != IsolationLevel::Serializable {
            return Some("isolation level");
        }
        None
    }
}

mod hex_signature {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ============================================================================
// External gate contracts
// ============================================================================

/// Risk level reported by the fraud gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fraud gate verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl RiskAssessment {
    pub fn new(level: RiskLevel) -> Self {
        Self {
            level,
            flags: Vec::new(),
        }
    }

    pub fn with_flags(level: RiskLevel, flags: Vec<String>) -> Self {
        Self { level, flags }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of `execute_transfer`, reported to the UI layer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Terminal state reached by the last attempt
    pub final_state: TransferState,
    /// Id of the last attempt's transaction
    pub transaction_id: TransactionId,
    /// Failure or cancellation reason, `None` when committed
    pub error: Option<TransferError>,
    /// Number of attempts made (lock contention retries create new transactions)
    pub attempts: u32,
    /// States visited by the last attempt, in order
    pub path: Vec<TransferState>,
    /// Non-blocking post-commit audit finding
    pub audit_warning: Option<String>,
    /// Chain position of the committed entry
    pub chain_index: Option<ChainIndex>,
}

impl TransferOutcome {
    pub fn is_committed(&self) -> bool {
        self.final_state == TransferState::Committed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(TransferError::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction::draft(
            "alice".into(),
            "bob".into(),
            Decimal::from(100),
            Currency::parse("SAR").unwrap(),
            "rent".into(),
        )
    }

    #[test]
    fn test_transaction_id_unique_and_parses() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<TransactionId>().unwrap(), a);
    }

    #[test]
    fn test_seal_sets_merkle_root() {
        let mut tx = sample();
        assert!(!tx.merkle_matches());
        assert!(tx.signing_payload().is_none());

        tx.seal(crate::chain::GENESIS_HASH).unwrap();
        assert!(tx.merkle_matches());
        assert!(tx.signing_payload().is_some());
    }

    #[test]
    fn test_merkle_detects_field_mutation() {
        let mut tx = sample();
        tx.seal(crate::chain::GENESIS_HASH).unwrap();

        let mut tampered = tx.clone();
        tampered.amount = Decimal::from(1000);
        assert!(!tampered.merkle_matches());

        let mut tampered = tx.clone();
        tampered.receiver = "mallory".into();
        assert!(!tampered.merkle_matches());

        // Note is not a Merkle leaf (covered by the signature instead)
        let mut renoted = tx.clone();
        renoted.note = "other".into();
        assert!(renoted.merkle_matches());
        assert_ne!(renoted.signing_payload(), tx.signing_payload());
    }

    #[test]
    fn test_signature_is_immutable() {
        let mut tx = sample();
        tx.seal(crate::chain::GENESIS_HASH).unwrap();
        tx.attach_signature(vec![1; 64], "ab".repeat(32)).unwrap();

        assert!(matches!(
            tx.attach_signature(vec![2; 64], "cd".repeat(32)),
            Err(TransferError::SignatureImmutable(_))
        ));
        assert!(matches!(
            tx.seal(crate::chain::GENESIS_HASH),
            Err(TransferError::SignatureImmutable(_))
        ));
        assert_eq!(tx.signature(), Some(&[1u8; 64][..]));
    }

    #[test]
    fn test_structural_defects() {
        let mut tx = sample();
        assert_eq!(tx.structural_defect(), Some("previous hash missing"));

        tx.seal(crate::chain::GENESIS_HASH).unwrap();
        assert_eq!(tx.structural_defect(), Some("signature missing"));

        tx.attach_signature(vec![0; 64], "00".repeat(32)).unwrap();
        assert_eq!(tx.structural_defect(), None);

        tx.receiver = tx.sender.clone();
        assert_eq!(tx.structural_defect(), Some("sender equals receiver"));
    }

    #[test]
    fn test_json_round_trip_keeps_merkle_valid() {
        let mut tx = sample();
        tx.seal(crate::chain::GENESIS_HASH).unwrap();
        tx.attach_signature(vec![7; 64], "11".repeat(32)).unwrap();

        let json = serde_json::to_vec(&tx).unwrap();
        let back: Transaction = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, tx);
        assert!(back.merkle_matches());
    }
}
