//! Signing key stores
//!
//! Private keys never leave the key store: callers hand over a payload and a
//! key reference and get back a signature. On a device this is the secure
//! enclave; [`LocalKeyStore`] keeps Ed25519 keys in process memory.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rustc_hash::FxHashMap;

use super::SignatureError;

/// Ed25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// Key store trait
///
/// `sign` is async because hardware-backed stores suspend while the secure
/// element works.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Get store name for logging
    fn name(&self) -> &'static str;

    /// Sign `payload` with the key registered under `key_ref`
    async fn sign(
        &self,
        key_ref: &str,
        payload: &[u8],
    ) -> Result<[u8; SIGNATURE_LEN], SignatureError>;

    /// Public half of the key registered under `key_ref`
    fn public_key(&self, key_ref: &str) -> Option<[u8; PUBLIC_KEY_LEN]>;
}

/// In-memory Ed25519 key store
#[derive(Default)]
pub struct LocalKeyStore {
    keys: RwLock<FxHashMap<String, SigningKey>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh keypair for `key_ref`, replacing any existing one.
    ///
    /// Returns the public key.
    pub fn generate(&self, key_ref: &str) -> [u8; PUBLIC_KEY_LEN] {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = signing_key.verifying_key().to_bytes();
        self.keys.write().insert(key_ref.to_string(), signing_key);
        public
    }

    /// Register a key from its 32-byte secret
    pub fn insert_secret(&self, key_ref: &str, secret: &[u8; 32]) -> [u8; PUBLIC_KEY_LEN] {
        let signing_key = SigningKey::from_bytes(secret);
        let public = signing_key.verifying_key().to_bytes();
        self.keys.write().insert(key_ref.to_string(), signing_key);
        public
    }

    pub fn remove(&self, key_ref: &str) -> bool {
        self.keys.write().remove(key_ref).is_some()
    }

    pub fn contains(&self, key_ref: &str) -> bool {
        self.keys.read().contains_key(key_ref)
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn sign(
        &self,
        key_ref: &str,
        payload: &[u8],
    ) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
        let keys = self.keys.read();
        let key = keys
            .get(key_ref)
            .ok_or_else(|| SignatureError::UnknownKey(key_ref.to_string()))?;
        Ok(key.sign(payload).to_bytes())
    }

    fn public_key(&self, key_ref: &str) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.keys
            .read()
            .get(key_ref)
            .map(|k| k.verifying_key().to_bytes())
    }
}
