//! Signature Service
//!
//! Ed25519 signing and verification of transaction payloads, plus the
//! multi-layer check a transaction must pass before it may be committed:
//!
//! 1. **Signature** - the signature verifies against the signer's public key
//! 2. **Merkle root** - the stored root matches the transaction's own fields
//! 3. **Structure** - every required field is present and well-formed
//!
//! The layers run in that order and stop at the first failure. Which layer
//! failed goes to the audit log; callers only learn that verification failed.

pub mod keystore;

pub use keystore::{KeyStore, LocalKeyStore, PUBLIC_KEY_LEN, SIGNATURE_LEN};

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transfer::types::{Transaction, TransactionId};

/// Signature errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("No signing key registered for {0}")]
    UnknownKey(String),

    #[error("Transaction {0} has no previous hash / Merkle root yet")]
    Unsealed(TransactionId),

    #[error("Transaction {0} is already signed")]
    AlreadySigned(TransactionId),

    #[error("Key store failure: {0}")]
    KeyStore(String),
}

/// Verification layer, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLayer {
    Signature,
    MerkleRoot,
    Structure,
}

impl VerificationLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationLayer::Signature => "signature",
            VerificationLayer::MerkleRoot => "merkle_root",
            VerificationLayer::Structure => "structure",
        }
    }
}

impl fmt::Display for VerificationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verify an Ed25519 signature.
///
/// # Arguments
/// * `public_key` - 32-byte Ed25519 public key
/// * `message` - The message that was signed
/// * `signature` - 64-byte Ed25519 signature
///
/// # Returns
/// `true` if signature is valid, `false` otherwise (including malformed input).
pub fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let pk_bytes: [u8; PUBLIC_KEY_LEN] = match public_key.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };

    let sig_bytes: [u8; SIGNATURE_LEN] = match signature.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };

    let verifying_key = match VerifyingKey::from_bytes(&pk_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };

    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify_strict(message, &sig).is_ok()
}

/// Signs and verifies transaction payloads through an injected key store
pub struct SignatureService {
    keys: Arc<dyn KeyStore>,
}

impl SignatureService {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    /// Sign raw payload bytes with the key under `key_ref`
    pub async fn sign(&self, payload: &[u8], key_ref: &str) -> Result<Vec<u8>, SignatureError> {
        let sig = self.keys.sign(key_ref, payload).await?;
        Ok(sig.to_vec())
    }

    /// Verify raw payload bytes against a hex-encoded public key reference
    pub fn verify(&self, payload: &[u8], signature: &[u8], public_key_ref: &str) -> bool {
        match hex::decode(public_key_ref) {
            Ok(pk) => verify_ed25519(&pk, payload, signature),
            Err(_) => false,
        }
    }

    /// Hex public key reference for `key_ref`, if the store knows it
    pub fn public_key_ref(&self, key_ref: &str) -> Option<String> {
        self.keys.public_key(key_ref).map(hex::encode)
    }

    /// Sign a sealed transaction and attach the signature.
    pub async fn sign_transaction(
        &self,
        tx: &mut Transaction,
        key_ref: &str,
    ) -> Result<(), SignatureError> {
        if tx.signature().is_some() {
            return Err(SignatureError::AlreadySigned(tx.id));
        }
        let payload = tx.signing_payload().ok_or(SignatureError::Unsealed(tx.id))?;
        let public = self
            .public_key_ref(key_ref)
            .ok_or_else(|| SignatureError::UnknownKey(key_ref.to_string()))?;

        let signature = self.sign(&payload, key_ref).await?;
        tx.attach_signature(signature, public)
            .map_err(|_| SignatureError::AlreadySigned(tx.id))?;

        debug!(tx_id = %tx.id, store = self.keys.name(), "Transaction signed");
        Ok(())
    }

    /// Run all verification layers, stopping at the first failure.
    pub fn check_layers(&self, tx: &Transaction) -> Result<(), VerificationLayer> {
        if !self.signature_valid(tx) {
            return Err(VerificationLayer::Signature);
        }
        if !tx.merkle_matches() {
            return Err(VerificationLayer::MerkleRoot);
        }
        if tx.structural_defect().is_some() {
            return Err(VerificationLayer::Structure);
        }
        Ok(())
    }

    /// `true` only if signature, Merkle root and structure all pass.
    ///
    /// The failing layer is written to the audit log.
    pub fn multi_layer_verify(&self, tx: &Transaction) -> bool {
        match self.check_layers(tx) {
            Ok(()) => true,
            Err(layer) => {
                warn!(
                    target: "ledger_audit",
                    tx_id = %tx.id,
                    layer = %layer,
                    defect = tx.structural_defect().unwrap_or("-"),
                    "Multi-layer verification failed"
                );
                false
            }
        }
    }

    fn signature_valid(&self, tx: &Transaction) -> bool {
        let (Some(signature), Some(key), Some(payload)) =
            (tx.signature(), tx.signer_key.as_deref(), tx.signing_payload())
        else {
            return false;
        };
        self.verify(&payload, signature, key)
    }
}
