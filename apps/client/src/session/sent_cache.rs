//! Vault-backed plaintext cache for my own sent messages.
//!
//! Keys live under `sent_<me>_<peer>/` with one of three suffixes:
//! the permanent message id, `pending::<local ts>` before the server has
//! acknowledged the send, or `server::<server ts>`. Lookups prefer the id key
//! and migrate anything found elsewhere onto it.

use std::sync::Arc;

use veilchat_crypto::vault::{KeyVault, VaultValue};
use veilchat_shared::chat::SentCacheEntry;
use veilchat_shared::ids::{MessageId, UserId};

use crate::error::ClientError;

const PENDING_PREFIX: &str = "pending::";
const SERVER_PREFIX: &str = "server::";

/// Outcome of looking up a sent message's plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Found(String),
    Missing,
    /// A record existed but the vault could not decrypt it.
    Undecryptable,
}

pub struct SentCache {
    vault: Arc<KeyVault>,
    prefix: String,
}

impl SentCache {
    pub fn new(vault: Arc<KeyVault>, me: UserId, peer: UserId) -> Self {
        Self {
            vault,
            prefix: cache_prefix(me, peer),
        }
    }

    pub fn id_key(&self, id: MessageId) -> String {
        format!("{}{id}", self.prefix)
    }

    pub fn pending_key(&self, ts: i64) -> String {
        format!("{}{PENDING_PREFIX}{ts}", self.prefix)
    }

    pub fn server_key(&self, ts: i64) -> String {
        format!("{}{SERVER_PREFIX}{ts}", self.prefix)
    }

    pub async fn store_pending(&self, text: &str, ts: i64) -> Result<(), ClientError> {
        let entry = SentCacheEntry {
            id: None,
            text: text.to_string(),
            ts,
        };
        self.put(&self.pending_key(ts), &entry).await
    }

    /// Move a pending entry onto its permanent id after acknowledgement.
    pub async fn promote(&self, local_ts: i64, id: MessageId, server_ts: i64) -> Result<(), ClientError> {
        let pending_key = self.pending_key(local_ts);
        let Some(mut entry) = self.vault.get_json::<SentCacheEntry>(&pending_key).await else {
            tracing::debug!(%id, "no pending cache entry to promote");
            return Ok(());
        };
        entry.id = Some(id);
        entry.ts = server_ts;
        self.put(&self.id_key(id), &entry).await?;
        self.vault.set(&pending_key, None).await?;
        Ok(())
    }

    pub async fn update_text(&self, id: MessageId, text: &str, ts: i64) -> Result<(), ClientError> {
        let entry = SentCacheEntry {
            id: Some(id),
            text: text.to_string(),
            ts,
        };
        self.put(&self.id_key(id), &entry).await
    }

    pub async fn remove(&self, id: MessageId) -> Result<(), ClientError> {
        self.vault.set(&self.id_key(id), None).await?;
        Ok(())
    }

    pub async fn remove_pending(&self, ts: i64) -> Result<(), ClientError> {
        self.vault.set(&self.pending_key(ts), None).await?;
        Ok(())
    }

    /// Recover the plaintext of my message `id` sent at server time `ts`.
    ///
    /// Tries the id key, then `server::<ts>`, then the nearest
    /// `pending::<t>` with `|t - ts| <= tolerance_ms`. A hit on a fallback
    /// key is rewritten under the id key.
    pub async fn resolve(&self, id: MessageId, ts: i64, tolerance_ms: i64) -> CacheLookup {
        let failures_before = self.vault.undecryptable_reads();

        if let Some(entry) = self.vault.get_json::<SentCacheEntry>(&self.id_key(id)).await {
            return CacheLookup::Found(entry.text);
        }

        let server_key = self.server_key(ts);
        if let Some(entry) = self.vault.get_json::<SentCacheEntry>(&server_key).await {
            self.migrate(&server_key, id, ts, &entry.text).await;
            return CacheLookup::Found(entry.text);
        }

        if let Some(pending_key) = self.nearest_pending(ts, tolerance_ms).await {
            if let Some(entry) = self.vault.get_json::<SentCacheEntry>(&pending_key).await {
                self.migrate(&pending_key, id, ts, &entry.text).await;
                return CacheLookup::Found(entry.text);
            }
        }

        if self.vault.undecryptable_reads() > failures_before {
            CacheLookup::Undecryptable
        } else {
            CacheLookup::Missing
        }
    }

    async fn nearest_pending(&self, ts: i64, tolerance_ms: i64) -> Option<String> {
        let scan = format!("{}{PENDING_PREFIX}", self.prefix);
        let keys = match self.vault.keys_starting_with(&scan).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!(error = %e, "pending cache scan failed");
                return None;
            }
        };
        keys.into_iter()
            .filter_map(|key| {
                let pending_ts: i64 = key[scan.len()..].parse().ok()?;
                let distance = (pending_ts - ts).abs();
                (distance <= tolerance_ms).then_some((distance, key))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, key)| key)
    }

    async fn migrate(&self, from: &str, id: MessageId, ts: i64, text: &str) {
        let result = async {
            self.update_text(id, text, ts).await?;
            self.vault.set(from, None).await?;
            Ok::<_, ClientError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(%id, error = %e, "sent cache migration failed");
        }
    }

    async fn put(&self, key: &str, entry: &SentCacheEntry) -> Result<(), ClientError> {
        self.vault.set(key, Some(VaultValue::json(entry)?)).await?;
        Ok(())
    }
}

pub fn cache_prefix(me: UserId, peer: UserId) -> String {
    format!("sent_{me}_{peer}/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilchat_crypto::protection_key::MemoryKeyStore;

    async fn cache() -> (SentCache, Arc<KeyVault>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(KeyVault::new(dir.path(), Arc::new(MemoryKeyStore::new())));
        let me = UserId::new();
        vault.set_current_user(me, false).await.unwrap();
        (SentCache::new(vault.clone(), me, UserId::new()), vault, dir)
    }

    #[test]
    fn key_layout() {
        let me = UserId::new();
        let peer = UserId::new();
        assert_eq!(cache_prefix(me, peer), format!("sent_{me}_{peer}/"));
    }

    #[tokio::test]
    async fn promote_moves_pending_to_id() {
        let (cache, vault, _dir) = cache().await;
        let id = MessageId::new();
        cache.store_pending("hello", 1_000).await.unwrap();
        cache.promote(1_000, id, 1_050).await.unwrap();

        assert!(vault.get(&cache.pending_key(1_000)).await.is_none());
        let entry: SentCacheEntry = vault.get_json(&cache.id_key(id)).await.unwrap();
        assert_eq!(entry.text, "hello");
        assert_eq!(entry.id, Some(id));
        assert_eq!(entry.ts, 1_050);
    }

    #[tokio::test]
    async fn resolve_prefers_id_key() {
        let (cache, _vault, _dir) = cache().await;
        let id = MessageId::new();
        cache.update_text(id, "by id", 10).await.unwrap();
        assert_eq!(cache.resolve(id, 10, 0).await, CacheLookup::Found("by id".into()));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_server_key_and_migrates() {
        let (cache, vault, _dir) = cache().await;
        let id = MessageId::new();
        let entry = SentCacheEntry { id: None, text: "srv".into(), ts: 500 };
        vault
            .set(&cache.server_key(500), Some(VaultValue::json(&entry).unwrap()))
            .await
            .unwrap();

        assert_eq!(cache.resolve(id, 500, 0).await, CacheLookup::Found("srv".into()));
        assert!(vault.get(&cache.server_key(500)).await.is_none());
        assert!(vault.get(&cache.id_key(id)).await.is_some());
    }

    #[tokio::test]
    async fn resolve_picks_nearest_pending_within_tolerance() {
        let (cache, vault, _dir) = cache().await;
        cache.store_pending("far", 1_000).await.unwrap();
        cache.store_pending("near", 4_900).await.unwrap();
        let id = MessageId::new();

        assert_eq!(cache.resolve(id, 5_000, 5_000).await, CacheLookup::Found("near".into()));
        assert!(vault.get(&cache.pending_key(4_900)).await.is_none());
        assert!(vault.get(&cache.pending_key(1_000)).await.is_some());
    }

    #[tokio::test]
    async fn resolve_ignores_pending_outside_tolerance() {
        let (cache, _vault, _dir) = cache().await;
        cache.store_pending("old", 1_000).await.unwrap();
        assert_eq!(cache.resolve(MessageId::new(), 20_000, 5_000).await, CacheLookup::Missing);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let (cache, _vault, _dir) = cache().await;
        let id = MessageId::new();
        cache.update_text(id, "bye", 1).await.unwrap();
        cache.remove(id).await.unwrap();
        assert_eq!(cache.resolve(id, 1, 0).await, CacheLookup::Missing);
    }
}
