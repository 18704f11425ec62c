//! Error types for the veilchat-crypto crate.

use thiserror::Error;

/// Errors that can occur during cryptographic and vault operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The operation needs a key pair but none is loaded.
    #[error("no key pair loaded")]
    NoKey,

    /// Private key material could not be parsed.
    #[error("key import failed: {0}")]
    Import(String),

    /// Envelope could not be decrypted (no key, malformed, or tampered).
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// A public key or other key input is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encryption could not be performed.
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// The vault's protection key is absent and the vault was opened read-only.
    #[error("vault unavailable: protection key missing")]
    VaultUnavailable,

    /// The vault has not been opened, or its last open failed.
    #[error("vault not ready: {0}")]
    VaultNotReady(String),

    /// Database storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// OS keychain operation failed.
    #[error("keychain error: {0}")]
    Keychain(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for CryptoError {
    fn from(err: keyring::Error) -> Self {
        CryptoError::Keychain(err.to_string())
    }
}

impl From<CryptoError> for veilchat_shared::error::VeilChatError {
    fn from(err: CryptoError) -> Self {
        veilchat_shared::error::VeilChatError::Crypto(err.to_string())
    }
}
