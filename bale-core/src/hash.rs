//! Content hash: fixed-width digest identifying a node's canonical encoding.
//!
//! `ContentHash` is both identity and address. It is computed once, over the
//! node's serialized bytes; interior and directory encodings embed their
//! children's hashes, so the digest covers the whole subtree (Merkle-style).
//!
//! The string form is lowercase hex, used in logs and debugging. The binary
//! form is the raw 32 bytes, used everywhere on the wire.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Width of a content hash in bytes.
pub const HASH_SIZE: usize = 32;

/// SHA-256 digest of a node's canonical serialized bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// Hash the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.into())
    }

    /// Wrap an existing digest.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a hash from a wire slice. Fails if the slice is not exactly
    /// `HASH_SIZE` bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::decode(format!("content hash must be {} bytes, got {}", HASH_SIZE, bytes.len())))?;
        Ok(Self(arr))
    }

    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Re-hash `bytes` and check the result matches this digest.
    ///
    /// Used when accepting node data fetched from the collaborator store.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        Sha256::digest(bytes).as_slice() == self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is noisy in debug output; eight chars identify a node
        // as well as git's short hashes do.
        write!(f, "ContentHash({}..)", &hex::encode(self.0)[..8])
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::decode(format!("invalid hash hex: {e}")))?;
        Self::try_from_slice(&bytes)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Serialized as lowercase hex, matching the Display form, so hashes embedded
// in config or fixtures read the same as hashes in logs.
impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_and_verify() {
        let hash = ContentHash::of(b"hello world");
        assert!(hash.verify(b"hello world"));
        assert!(!hash.verify(b"hello worlf"));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(ContentHash::of(b"same"), ContentHash::of(b"same"));
        assert_ne!(ContentHash::of(b"a"), ContentHash::of(b"b"));
    }

    #[test]
    fn test_display_roundtrip() {
        let hash = ContentHash::of(b"roundtrip");
        let s = hash.to_string();
        assert_eq!(s.len(), HASH_SIZE * 2);
        let parsed: ContentHash = s.parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_try_from_slice_rejects_short() {
        assert!(ContentHash::try_from_slice(&[0u8; 16]).is_err());
        assert!(ContentHash::try_from_slice(&[0u8; 33]).is_err());
        assert!(ContentHash::try_from_slice(&[0u8; 32]).is_ok());
    }
}
