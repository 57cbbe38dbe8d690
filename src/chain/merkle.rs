//! Digests and Merkle roots
//!
//! Leaves and inner nodes are domain-separated (`0x00` / `0x01` prefix) so a
//! leaf value can never be confused with a concatenation of child hashes.
//! An odd node at any level is paired with itself.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Digest length in bytes (SHA-256)
pub const DIGEST_LEN: usize = 32;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// 32-byte SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

/// Head hash of an empty chain
pub const GENESIS_HASH: Digest = Digest([0u8; DIGEST_LEN]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// SHA-256 over the concatenation of `parts`
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid digest hex: {s}")))
    }
}

// ============================================================
// MERKLE ROOT
// ============================================================

fn leaf_hash(value: &str) -> Digest {
    Digest::of_parts(&[&[LEAF_PREFIX], value.as_bytes()])
}

fn node_hash(left: &Digest, right: &Digest) -> Digest {
    Digest::of_parts(&[&[NODE_PREFIX], left.as_bytes(), right.as_bytes()])
}

/// Deterministic Merkle root over an ordered list of leaf values.
///
/// Pure function: the same input always yields the same root. An empty list
/// hashes to the leaf hash of the empty string.
pub fn compute_merkle_root<S: AsRef<str>>(fields: &[S]) -> Digest {
    if fields.is_empty() {
        return leaf_hash("");
    }

    let mut level: Vec<Digest> = fields.iter().map(|f| leaf_hash(f.as_ref())).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => node_hash(left, right),
                [single] => node_hash(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_deterministic() {
        let fields = ["tx1", "alice", "bob", "100", "SAR", "1700000000000"];
        assert_eq!(compute_merkle_root(&fields), compute_merkle_root(&fields));
    }

    #[test]
    fn test_merkle_sensitive_to_every_field() {
        let base = ["tx1", "alice", "bob", "100", "SAR", "1700000000000"];
        let root = compute_merkle_root(&base);
        for i in 0..base.len() {
            let mut changed = base.map(String::from);
            changed[i].push('x');
            assert_ne!(compute_merkle_root(&changed), root, "field {i} not covered");
        }
    }

    #[test]
    fn test_merkle_sensitive_to_order() {
        assert_ne!(
            compute_merkle_root(&["a", "b"]),
            compute_merkle_root(&["b", "a"])
        );
    }

    #[test]
    fn test_single_leaf_differs_from_pair_node() {
        // Domain separation: a leaf is not an inner node of the same bytes
        let a = leaf_hash("a");
        let b = leaf_hash("b");
        assert_ne!(compute_merkle_root(&["a", "b"]), leaf_hash(""));
        assert_eq!(compute_merkle_root(&["a", "b"]), node_hash(&a, &b));
        assert_eq!(compute_merkle_root(&["a"]), a);
    }

    #[test]
    fn test_digest_hex_round_trip() {
        let d = Digest::of_parts(&[b"hello"]);
        assert_eq!(Digest::from_hex(&d.to_hex()), Some(d));
        assert_eq!(Digest::from_hex("zz"), None);
        assert_eq!(GENESIS_HASH.to_hex(), "0".repeat(64));

        let json = serde_json::to_string(&d).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
