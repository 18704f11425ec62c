//! Fallback reconciliation against the REST history.
//!
//! The server history is authoritative for ids, timestamps, and the
//! read/edit/delete flags. Every record is either matched to a local
//! message and used to patch it, or, when it is newer than anything held
//! locally, turned into a new local message. Applying the same history
//! twice leaves the list unchanged.

use veilchat_shared::api::message::HistoryRecord;
use veilchat_shared::chat::{ChatMsg, MessageStatus};
use veilchat_shared::constants::{TOMBSTONE_TEXT, UNRECOVERABLE_SENT_TEXT};
use veilchat_shared::ids::MessageId;

use super::messages::{tombstone, MessageList};
use super::scheduler::TaskKey;
use super::sent_cache::CacheLookup;
use super::{ChatSession, CORRUPTION_THRESHOLD};
use crate::error::ClientError;

impl ChatSession {
    /// Fetch the full history and reconcile it into the message list.
    ///
    /// Returns whether the list changed. Does nothing if another pass is
    /// already in flight.
    pub async fn perform_fallback_sync(&mut self) -> Result<bool, ClientError> {
        let peer = self.peer.ok_or(ClientError::NotInitialized)?;
        if self.sync_in_progress {
            tracing::debug!(%peer, "reconciliation already running");
            return Ok(false);
        }
        self.sync_in_progress = true;
        let fetched = self.history.conversation_history(peer).await;
        self.sync_in_progress = false;
        Ok(self.apply_history(fetched?).await)
    }

    /// Kick off a reconciliation whose HTTP fetch runs off the session task.
    /// The result comes back as [`SessionTask::SyncFetched`](super::SessionTask::SyncFetched).
    pub(super) fn start_background_sync(&mut self) {
        let Some(peer) = self.peer else { return };
        if !self.initialized || self.sync_in_progress {
            return;
        }
        self.sync_in_progress = true;
        let history = self.history.clone();
        let tx = self.scheduler.sender();
        tokio::spawn(async move {
            let result = history
                .conversation_history(peer)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(super::SessionTask::SyncFetched { peer, result });
        });
    }

    pub(super) async fn apply_history(&mut self, mut records: Vec<HistoryRecord>) -> bool {
        let Some(peer) = self.peer else { return false };
        let me = self.me;
        records.retain(|r| {
            (r.sender_id == me && r.recipient_id == peer)
                || (r.sender_id == peer && r.recipient_id == me)
        });
        records.sort_by_key(HistoryRecord::ts_millis);

        let tolerance = self.settings.timestamp_tolerance_ms;
        let mut next = self.messages.clone();
        let newest = next.newest_ts();
        let mut cache_failures = 0u32;

        for record in &records {
            let ts = record.ts_millis();

            if let Some(idx) = next.position_by_id(record.id) {
                self.patch_from_record(&mut next, idx, record).await;
                continue;
            }

            if record.sender_id == me {
                if let Some(idx) = next.oldest_pending_near(ts, tolerance) {
                    self.adopt_pending(&mut next, idx, record).await;
                    self.patch_from_record(&mut next, idx, record).await;
                    continue;
                }
            } else if let Some(idx) = next.position_idless(peer, ts) {
                if let Some(msg) = next.get_mut(idx) {
                    msg.id = Some(record.id);
                }
                self.patch_from_record(&mut next, idx, record).await;
                continue;
            }

            if newest.map_or(true, |n| ts > n) {
                let msg = self.synthesize(record, &mut cache_failures).await;
                next.insert_sorted(msg);
            }
        }
        next.sort();

        if cache_failures > 0 {
            self.note_cache_failures(cache_failures).await;
        }
        if next == self.messages {
            return false;
        }
        tracing::debug!(%peer, before = self.messages.len(), after = next.len(), "reconciled history");
        self.messages = next;
        self.publish_messages();
        true
    }

    /// Give a pending send the server's identity after its ack was lost.
    async fn adopt_pending(&mut self, next: &mut MessageList, idx: usize, record: &HistoryRecord) {
        let status = self.ack_status();
        let Some(msg) = next.get_mut(idx) else { return };
        let local_ts = msg.ts;
        msg.id = Some(record.id);
        msg.ts = record.ts_millis();
        msg.status = Some(status);

        self.awaiting_ack.remove(&local_ts);
        self.scheduler.cancel(TaskKey::PendingTimeout(local_ts));
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.promote(local_ts, record.id, record.ts_millis()).await {
                tracing::debug!(id = %record.id, error = %e, "sent cache promotion failed");
            }
        }
    }

    /// Copy server-side flags onto an already matched message.
    async fn patch_from_record(&mut self, next: &mut MessageList, idx: usize, record: &HistoryRecord) {
        let me = self.me;
        let Some(msg) = next.get_mut(idx) else { return };
        let mine = msg.sender == me;

        if record.is_deleted {
            if !msg.is_deleted() {
                tombstone(msg, record.edited_at_millis().unwrap_or(record.ts_millis()));
                if mine {
                    self.drop_cached(record.id).await;
                }
            }
            return;
        }

        if let Some(read_at) = record.read_at_millis() {
            if mine {
                msg.status = Some(MessageStatus::Read);
            }
            msg.read_at.get_or_insert(read_at);
        }

        if let Some(edited_at) = record.edited_at_millis() {
            if msg.edited_at != Some(edited_at) && !msg.is_deleted() {
                msg.edited_at = Some(edited_at);
                if !mine && msg.ct.as_deref() != Some(record.ciphertext.as_str()) {
                    msg.text = self.decrypt_cached(&record.ciphertext);
                    msg.ct = Some(record.ciphertext.clone());
                }
            }
        }
    }

    async fn synthesize(&mut self, record: &HistoryRecord, cache_failures: &mut u32) -> ChatMsg {
        let ts = record.ts_millis();
        let mut msg = if record.sender_id == self.me {
            let text = if record.is_deleted {
                TOMBSTONE_TEXT.to_string()
            } else {
                self.resolve_sent_text(record.id, ts, cache_failures).await
            };
            let status = if record.read_at.is_some() {
                MessageStatus::Read
            } else {
                self.ack_status()
            };
            let mut msg = ChatMsg::pending(self.me, text, ts);
            msg.id = Some(record.id);
            msg.status = Some(status);
            msg
        } else {
            let text = if record.is_deleted {
                TOMBSTONE_TEXT.to_string()
            } else {
                self.decrypt_cached(&record.ciphertext)
            };
            let ct = (!record.is_deleted).then(|| record.ciphertext.clone());
            ChatMsg::inbound(Some(record.id), record.sender_id, text, ts, ct)
        };
        msg.read_at = record.read_at_millis();
        msg.edited_at = record.edited_at_millis();
        if record.is_deleted {
            tombstone(&mut msg, record.edited_at_millis().unwrap_or(ts));
        }
        msg
    }

    async fn resolve_sent_text(&self, id: MessageId, ts: i64, cache_failures: &mut u32) -> String {
        let Some(cache) = &self.sent_cache else {
            return UNRECOVERABLE_SENT_TEXT.to_string();
        };
        match cache
            .resolve(id, ts, self.settings.timestamp_tolerance_ms)
            .await
        {
            CacheLookup::Found(text) => text,
            CacheLookup::Missing => UNRECOVERABLE_SENT_TEXT.to_string(),
            CacheLookup::Undecryptable => {
                *cache_failures += 1;
                UNRECOVERABLE_SENT_TEXT.to_string()
            }
        }
    }

    async fn drop_cached(&self, id: MessageId) {
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.remove(id).await {
                tracing::debug!(%id, error = %e, "sent cache cleanup failed");
            }
        }
    }

    /// Repeated undecryptable cache records mean the vault key no longer
    /// matches its contents.
    async fn note_cache_failures(&mut self, count: u32) {
        self.cache_failures += count;
        if self.cache_failures >= CORRUPTION_THRESHOLD && self.own_key != super::OwnKey::Corrupted {
            tracing::warn!(
                user_id = %self.me,
                failures = self.cache_failures,
                "vault records keep failing to decrypt; entering recovery"
            );
            self.enter_local_corruption().await;
        }
    }
}
