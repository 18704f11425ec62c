//! Per-user encrypted key-value vault.
//!
//! One SQLite database per user under the vault directory. Every record is
//! sealed individually with AES-256-GCM under a key derived from the user's
//! protection key, with the record's application key bound as AAD so a
//! ciphertext cannot be moved to another slot.
//!
//! Opening read-only never provisions anything: if the protection key is
//! absent the open fails with [`CryptoError::VaultUnavailable`] and the
//! filesystem and keychain are left untouched. Together with
//! [`KeyVault::database_exists`] this tells a brand-new user apart from a
//! vault whose key material was lost.

pub mod migrations;
pub mod value;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use veilchat_shared::ids::UserId;
use zeroize::Zeroizing;

use crate::envelope::NONCE_SIZE;
use crate::error::CryptoError;
use crate::protection_key::{ProtectionKey, ProtectionKeyStore, RecordKey};

pub use value::VaultValue;

/// Logical name of the record holding the user's private key.
pub const PRIVATE_KEY_RECORD: &str = "private_key";

/// Open state of the vault, observed by [`KeyVault::wait_until_ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Closed,
    Opening,
    Ready,
    Failed(String),
}

struct OpenVault {
    user_id: UserId,
    conn: Connection,
    record_key: RecordKey,
    read_only: bool,
}

/// The per-user encrypted store. Cheap to share behind an `Arc`.
pub struct KeyVault {
    root: PathBuf,
    key_store: Arc<dyn ProtectionKeyStore>,
    inner: Mutex<Option<OpenVault>>,
    ready: watch::Sender<Readiness>,
    undecryptable: AtomicU64,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("root", &self.root)
            .field("readiness", &*self.ready.borrow())
            .finish()
    }
}

impl KeyVault {
    pub fn new(root: impl Into<PathBuf>, key_store: Arc<dyn ProtectionKeyStore>) -> Self {
        let (ready, _) = watch::channel(Readiness::Closed);
        Self {
            root: root.into(),
            key_store,
            inner: Mutex::new(None),
            ready,
            undecryptable: AtomicU64::new(0),
        }
    }

    pub fn database_path(&self, user: &UserId) -> PathBuf {
        self.root.join(format!("{user}.vault.db"))
    }

    /// Whether a vault database has ever been created for `user`.
    pub fn database_exists(&self, user: &UserId) -> bool {
        self.database_path(user).exists()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.lock().ok().and_then(|g| g.as_ref().map(|v| v.user_id))
    }

    /// Open the vault for `user`, or no-op if it is already open for that
    /// user in a mode at least as permissive as requested.
    pub async fn set_current_user(&self, user: UserId, read_only: bool) -> Result<(), CryptoError> {
        {
            let guard = self.lock()?;
            if let Some(open) = guard.as_ref() {
                if open.user_id == user && (read_only || !open.read_only) {
                    return Ok(());
                }
            }
        }

        self.ready.send_replace(Readiness::Opening);
        let opened = self.open(user, read_only);
        let mut guard = self.lock()?;
        match opened {
            Ok(vault) => {
                *guard = Some(vault);
                self.ready.send_replace(Readiness::Ready);
                tracing::debug!(user_id = %user, read_only, "vault opened");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                self.ready.send_replace(Readiness::Failed(e.to_string()));
                tracing::debug!(user_id = %user, read_only, error = %e, "vault open failed");
                Err(e)
            }
        }
    }

    /// Resolve once the pending open completes. Errors if the open failed or
    /// no user has been opened.
    pub async fn wait_until_ready(&self) -> Result<(), CryptoError> {
        let mut rx = self.ready.subscribe();
        let state = rx
            .wait_for(|s| *s != Readiness::Opening)
            .await
            .map_err(|_| CryptoError::VaultNotReady("vault dropped".into()))?
            .clone();
        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(CryptoError::VaultNotReady(reason)),
            Readiness::Closed | Readiness::Opening => {
                Err(CryptoError::VaultNotReady("no user opened".into()))
            }
        }
    }

    /// Store `value` under `key`, or delete the entry when `value` is `None`.
    pub async fn set(&self, key: &str, value: Option<VaultValue>) -> Result<(), CryptoError> {
        self.wait_until_ready().await?;
        let guard = self.lock()?;
        let open = guard
            .as_ref()
            .ok_or_else(|| CryptoError::VaultNotReady("vault closed".into()))?;

        match value {
            None => {
                open.conn
                    .execute("DELETE FROM vault_records WHERE key = ?1", [key])?;
            }
            Some(value) => {
                let plaintext = Zeroizing::new(serde_json::to_vec(&value)?);
                let (iv, data) = seal(&open.record_key, key, &plaintext)?;
                open.conn.execute(
                    "INSERT INTO vault_records (key, iv, data, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO UPDATE SET iv = excluded.iv, data = excluded.data,
                                                    updated_at = excluded.updated_at",
                    rusqlite::params![key, iv, data, now_secs()],
                )?;
            }
        }
        Ok(())
    }

    /// Fetch and decrypt `key`. Missing entries, a closed vault, and records
    /// that no longer decrypt (rotated or lost protection key) all yield `None`.
    pub async fn get(&self, key: &str) -> Option<VaultValue> {
        if let Err(e) = self.wait_until_ready().await {
            tracing::debug!(error = %e, "vault read before ready");
            return None;
        }
        let guard = self.lock().ok()?;
        let open = guard.as_ref()?;

        let row: Option<(Vec<u8>, Vec<u8>)> = match open
            .conn
            .query_row(
                "SELECT iv, data FROM vault_records WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, "vault read failed");
                return None;
            }
        };
        let (iv, data) = row?;

        let decoded = open_record(&open.record_key, key, &iv, &data)
            .and_then(|plaintext| Ok(serde_json::from_slice::<VaultValue>(&plaintext)?));
        match decoded {
            Ok(value) => Some(value),
            Err(e) => {
                self.undecryptable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "vault record could not be decrypted");
                None
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).await.and_then(VaultValue::into_json)
    }

    pub async fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).await.and_then(VaultValue::into_text)
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).await.and_then(VaultValue::into_bytes)
    }

    /// All stored keys beginning with `prefix`, sorted.
    pub async fn keys_starting_with(&self, prefix: &str) -> Result<Vec<String>, CryptoError> {
        self.wait_until_ready().await?;
        let guard = self.lock()?;
        let open = guard
            .as_ref()
            .ok_or_else(|| CryptoError::VaultNotReady("vault closed".into()))?;
        let mut stmt = open.conn.prepare(
            "SELECT key FROM vault_records WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> Result<usize, CryptoError> {
        self.wait_until_ready().await?;
        let guard = self.lock()?;
        let open = guard
            .as_ref()
            .ok_or_else(|| CryptoError::VaultNotReady("vault closed".into()))?;
        let count: i64 = open
            .conn
            .query_row("SELECT COUNT(*) FROM vault_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Records found but not decryptable since this vault was created.
    pub fn undecryptable_reads(&self) -> u64 {
        self.undecryptable.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.lock() {
            *guard = None;
        }
        self.ready.send_replace(Readiness::Closed);
    }

    /// Delete the user's database and protection key. Leaves the vault closed.
    pub fn reset_user(&self, user: &UserId) -> Result<(), CryptoError> {
        {
            let mut guard = self.lock()?;
            if guard.as_ref().map(|v| v.user_id) == Some(*user) {
                *guard = None;
            }
        }
        self.ready.send_replace(Readiness::Closed);

        let path = self.database_path(user);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", path.display()));
            remove_if_exists(&file)?;
        }
        self.key_store.delete(user)?;
        tracing::info!(user_id = %user, "vault reset");
        Ok(())
    }

    fn open(&self, user: UserId, read_only: bool) -> Result<OpenVault, CryptoError> {
        let protection_key = match self.key_store.load(&user)? {
            Some(key) => key,
            None if read_only => return Err(CryptoError::VaultUnavailable),
            None => {
                let key = ProtectionKey::generate();
                self.key_store.store(&user, &key)?;
                tracing::info!(user_id = %user, "provisioned new vault protection key");
                key
            }
        };

        std::fs::create_dir_all(&self.root)?;
        let conn = Connection::open(self.database_path(&user))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;",
        )?;
        migrations::run_vault_migrations(&conn)?;

        Ok(OpenVault {
            user_id: user,
            conn,
            record_key: protection_key.derive_record_key()?,
            read_only,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<OpenVault>>, CryptoError> {
        self.inner
            .lock()
            .map_err(|e| CryptoError::Storage(format!("vault lock poisoned: {e}")))
    }
}

fn seal(key: &RecordKey, aad: &str, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let data = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    Ok((nonce_bytes.to_vec(), data))
}

fn open_record(
    key: &RecordKey,
    aad: &str,
    iv: &[u8],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if iv.len() != NONCE_SIZE {
        return Err(CryptoError::Decrypt("record nonce has wrong length".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: data,
                aad: aad.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decrypt("record authentication failed".into()))
}

fn remove_if_exists(path: &Path) -> Result<(), CryptoError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
