//! Protection keys for per-user vaults.
//!
//! Each user's vault is protected by a random 32-byte key held outside the
//! vault database (normally the OS keychain). Record encryption keys are
//! derived from it with HKDF-SHA256, so the stored secret is never used
//! directly as a cipher key.

use std::collections::HashMap;
use std::sync::Mutex;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use veilchat_shared::ids::UserId;

const KEYCHAIN_SERVICE: &str = "com.veilchat.vault";
const RECORD_KEY_INFO: &[u8] = b"veilchat-vault-records-v1";

/// A 32-byte vault protection key, securely wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProtectionKey {
    key: [u8; 32],
}

impl std::fmt::Debug for ProtectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ProtectionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey("protection key must be 32 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Derive the AES-256 key used for individual vault records.
    pub fn derive_record_key(&self) -> Result<RecordKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut okm = [0u8; 32];
        hk.expand(RECORD_KEY_INFO, &mut okm)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(RecordKey { key: okm })
    }
}

/// AES-256-GCM key for vault records, derived from a [`ProtectionKey`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecordKey {
    key: [u8; 32],
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordKey").field("key", &"[REDACTED]").finish()
    }
}

impl RecordKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Where protection keys live. Implementations must never generate a key
/// as a side effect of `load`.
pub trait ProtectionKeyStore: Send + Sync {
    fn load(&self, user: &UserId) -> Result<Option<ProtectionKey>, CryptoError>;
    fn store(&self, user: &UserId, key: &ProtectionKey) -> Result<(), CryptoError>;
    fn delete(&self, user: &UserId) -> Result<(), CryptoError>;
}

/// Protection keys in the OS keychain, one hex-encoded entry per user.
#[derive(Debug, Default)]
pub struct KeychainKeyStore;

impl KeychainKeyStore {
    fn entry(user: &UserId) -> Result<keyring::Entry, CryptoError> {
        keyring::Entry::new(KEYCHAIN_SERVICE, &user.to_string())
            .map_err(|e| CryptoError::Keychain(format!("keychain unavailable: {e}")))
    }
}

impl ProtectionKeyStore for KeychainKeyStore {
    fn load(&self, user: &UserId) -> Result<Option<ProtectionKey>, CryptoError> {
        match Self::entry(user)?.get_password() {
            Ok(hex_string) => {
                let hex_string = Zeroizing::new(hex_string);
                let bytes = Zeroizing::new(hex::decode(hex_string.as_bytes()).map_err(|_| {
                    CryptoError::Keychain("malformed protection key in keychain".into())
                })?);
                ProtectionKey::from_bytes(&bytes).map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CryptoError::from(e)),
        }
    }

    fn store(&self, user: &UserId, key: &ProtectionKey) -> Result<(), CryptoError> {
        let hex_string = Zeroizing::new(hex::encode(key.as_bytes()));
        Self::entry(user)?.set_password(&hex_string)?;
        Ok(())
    }

    fn delete(&self, user: &UserId) -> Result<(), CryptoError> {
        match Self::entry(user)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CryptoError::from(e)),
        }
    }
}

/// Process-local protection keys. Used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<UserId, ProtectionKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<UserId, ProtectionKey>>, CryptoError> {
        self.keys
            .lock()
            .map_err(|e| CryptoError::Keychain(format!("key store lock poisoned: {e}")))
    }
}

impl ProtectionKeyStore for MemoryKeyStore {
    fn load(&self, user: &UserId) -> Result<Option<ProtectionKey>, CryptoError> {
        Ok(self.lock()?.get(user).cloned())
    }

    fn store(&self, user: &UserId, key: &ProtectionKey) -> Result<(), CryptoError> {
        self.lock()?.insert(*user, key.clone());
        Ok(())
    }

    fn delete(&self, user: &UserId) -> Result<(), CryptoError> {
        self.lock()?.remove(user);
        Ok(())
    }
}
