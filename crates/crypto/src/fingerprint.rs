//! Diagnostic fingerprints of key material.
//!
//! A fingerprint is a SHA-256 digest of raw key bytes. It answers "is this the
//! same key as before?" and is not a trust or identity-verification mechanism.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of private-key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(digest_hex(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, suitable for log lines.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of arbitrary bytes. Also used to key decryption-failure caches
/// by ciphertext.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
