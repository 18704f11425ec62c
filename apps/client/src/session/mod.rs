//! Per-conversation chat session.
//!
//! A [`ChatSession`] owns everything mutable about one direct-message
//! conversation: the message list, the partner-key cache, pending sends and
//! the key-availability state. It is driven from a single task (see
//! [`driver`]); handlers take `&mut self` and run to completion one at a
//! time, so no state is shared with other tasks.

pub mod driver;
pub mod key_state;
pub mod messages;
pub mod observe;
pub mod scheduler;
pub mod sent_cache;
mod sync;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use veilchat_crypto::engine::CryptoEngine;
use veilchat_crypto::error::CryptoError;
use veilchat_crypto::fingerprint::digest_hex;
use veilchat_crypto::vault::{KeyVault, VaultValue, PRIVATE_KEY_RECORD};
use veilchat_shared::api::message::UnreadOverview;
use veilchat_shared::api::user::UserProfile;
use veilchat_shared::api::ws::{ClientEvent, ServerEvent};
use veilchat_shared::chat::{ChatMsg, MessageStatus};
use veilchat_shared::constants::{MAX_MESSAGE_SIZE_BYTES, UNDECRYPTABLE_TEXT};
use veilchat_shared::ids::{MessageId, UserId};

use crate::config::SessionSettings;
use crate::error::ClientError;
use crate::history::HistoryApi;
use crate::transport::{ConnectionState, Transport};

pub use driver::{spawn_session, SessionHandle};
pub use key_state::{KeyState, OwnKey, PartnerBlock, PartnerKey};
pub use observe::SessionView;
pub use scheduler::SessionTask;

use messages::{tombstone, MessageList};
use observe::SessionObservers;
use scheduler::{Scheduler, TaskKey};
use sent_cache::SentCache;

/// Undecryptable sent-cache records tolerated before the vault is treated
/// as corrupted.
pub const CORRUPTION_THRESHOLD: u32 = 3;

/// External collaborators of a session.
pub struct SessionDeps {
    pub vault: Arc<KeyVault>,
    pub history: Arc<dyn HistoryApi>,
    pub transport: Arc<dyn Transport>,
}

enum PartnerLookup {
    Usable(String),
    Missing,
    NotPublished,
}

pub struct ChatSession {
    me: UserId,
    peer: Option<UserId>,
    settings: SessionSettings,
    engine: CryptoEngine,
    vault: Arc<KeyVault>,
    history: Arc<dyn HistoryApi>,
    transport: Arc<dyn Transport>,
    sent_cache: Option<SentCache>,
    messages: MessageList,
    own_key: OwnKey,
    own_profile: Option<UserProfile>,
    partner_key: PartnerKey,
    partner_public_key: Option<String>,
    online_users: HashSet<UserId>,
    /// Local timestamps of sends still inside their pending timeout.
    awaiting_ack: BTreeSet<i64>,
    last_stamp: i64,
    /// Ciphertext digests that already failed to decrypt.
    decrypt_failures: HashSet<String>,
    cache_failures: u32,
    unread: HashMap<UserId, u32>,
    sync_in_progress: bool,
    initialized: bool,
    last_connection: ConnectionState,
    last_typing_sent: Option<Instant>,
    scheduler: Scheduler,
    observers: SessionObservers,
}

impl ChatSession {
    /// Create a session for the current user `me`. The returned receiver
    /// carries timer and background-fetch results; feed each one to
    /// [`ChatSession::handle_task`].
    pub fn new(
        me: UserId,
        deps: SessionDeps,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionTask>) {
        let (scheduler, tasks) = Scheduler::new();
        let last_connection = deps.transport.connection_state();
        let session = Self {
            me,
            peer: None,
            settings,
            engine: CryptoEngine::new(),
            vault: deps.vault,
            history: deps.history,
            transport: deps.transport,
            sent_cache: None,
            messages: MessageList::new(),
            own_key: OwnKey::Unknown,
            own_profile: None,
            partner_key: PartnerKey::Unknown,
            partner_public_key: None,
            online_users: HashSet::new(),
            awaiting_ack: BTreeSet::new(),
            last_stamp: 0,
            decrypt_failures: HashSet::new(),
            cache_failures: 0,
            unread: HashMap::new(),
            sync_in_progress: false,
            initialized: false,
            last_connection,
            last_typing_sent: None,
            scheduler,
            observers: SessionObservers::new(),
        };
        (session, tasks)
    }

    pub fn view(&self) -> SessionView {
        self.observers.view(self.transport.watch_connection())
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn peer(&self) -> Option<UserId> {
        self.peer
    }

    pub fn messages(&self) -> &[ChatMsg] {
        self.messages.as_slice()
    }

    pub fn key_state(&self) -> KeyState {
        if self.peer.is_none() {
            return KeyState::Unknown;
        }
        KeyState::resolve(self.own_key, self.partner_key)
    }

    pub fn my_private_key_missing(&self) -> bool {
        self.key_state().my_private_key_missing()
    }

    pub fn partner_online(&self) -> bool {
        self.peer.is_some_and(|p| self.online_users.contains(&p))
    }

    pub fn partner_public_key(&self) -> Option<&str> {
        self.partner_public_key.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    /// Open the conversation with `peer`.
    ///
    /// Re-entering for the peer that is already open only revalidates key
    /// state; history is kept.
    pub async fn init(&mut self, peer: UserId) -> Result<(), ClientError> {
        if self.initialized && self.peer == Some(peer) {
            tracing::debug!(%peer, "conversation already open; revalidating keys");
            self.revalidate_keys().await;
            return Ok(());
        }
        if peer == self.me {
            return Err(ClientError::InvalidMessage(
                "cannot open a conversation with yourself".into(),
            ));
        }

        self.reset_conversation();
        self.peer = Some(peer);
        self.sent_cache = Some(SentCache::new(self.vault.clone(), self.me, peer));
        self.observers.set_loading(true);
        self.publish_key_state();
        self.observers.set_partner_online(self.partner_online());

        self.load_profiles(peer).await;
        self.ensure_own_key().await;
        if self.own_key == OwnKey::Present {
            self.heal_own_bundle().await;
        }
        self.refresh_partner_key().await;

        match self.perform_fallback_sync().await {
            Ok(_) => self.mark_history_read().await,
            Err(e) => tracing::warn!(%peer, error = %e, "initial history load failed"),
        }

        self.scheduler
            .schedule_every(TaskKey::PeriodicSync, self.settings.sync_interval, || {
                SessionTask::PeriodicSync
            });
        self.scheduler
            .schedule_every(TaskKey::HealthProbe, self.settings.health_interval, || {
                SessionTask::HealthProbe
            });
        self.initialized = true;
        self.observers.set_loading(false);
        tracing::info!(%peer, key_state = ?self.key_state(), messages = self.messages.len(), "conversation opened");
        Ok(())
    }

    /// Encrypt `text` to the partner and send it.
    ///
    /// Refuses while disconnected so nothing sits pending without a chance
    /// of delivery. Completion is observed only through `message-sent`.
    pub async fn send(&mut self, text: &str) -> Result<(), ClientError> {
        if self.transport.connection_state() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        let peer = self.peer.ok_or(ClientError::NotInitialized)?;
        validate_text(text)?;
        let public_key = self.ready_partner_key()?;

        let ciphertext = self.engine.encrypt_with_public_key(text, &public_key)?;
        let ts = self.next_stamp();
        self.messages.insert_sorted(ChatMsg::pending(self.me, text, ts));
        self.publish_messages();
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.store_pending(text, ts).await {
                tracing::warn!(error = %e, "failed to cache sent plaintext");
            }
        }

        let event = ClientEvent::SendMessage {
            to_user_id: peer,
            ciphertext,
            avatar_url: self.own_profile.as_ref().and_then(|p| p.avatar_url.clone()),
        };
        if let Err(e) = self.transport.emit(event).await {
            if let Some(idx) = self.messages.position_idless(self.me, ts) {
                self.messages.remove(idx);
            }
            if let Some(cache) = &self.sent_cache {
                if let Err(e) = cache.remove_pending(ts).await {
                    tracing::debug!(ts, error = %e, "pending cache cleanup failed");
                }
            }
            self.publish_messages();
            return Err(e);
        }

        self.awaiting_ack.insert(ts);
        self.scheduler.schedule(
            TaskKey::PendingTimeout(ts),
            self.settings.pending_timeout,
            SessionTask::PendingTimeout { ts },
        );
        tracing::debug!(%peer, ts, "message sent; awaiting ack");
        Ok(())
    }

    /// Replace the text of one of my messages.
    pub async fn edit(&mut self, id: MessageId, text: &str) -> Result<(), ClientError> {
        if self.transport.connection_state() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        validate_text(text)?;
        let msg = self
            .messages
            .get_mut_by_id(id)
            .ok_or(ClientError::MessageNotFound)?;
        if msg.sender != self.me {
            return Err(ClientError::NotOwnMessage);
        }
        if msg.is_deleted() {
            return Err(ClientError::InvalidMessage("message was deleted".into()));
        }
        let ts = msg.ts;
        let public_key = self.ready_partner_key()?;

        let ciphertext = self.engine.encrypt_with_public_key(text, &public_key)?;
        self.transport
            .emit(ClientEvent::EditMessage {
                message_id: id,
                ciphertext,
            })
            .await?;

        if let Some(msg) = self.messages.get_mut_by_id(id) {
            msg.text = text.to_string();
            msg.edited_at = Some(now_millis());
        }
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.update_text(id, text, ts).await {
                tracing::warn!(%id, error = %e, "failed to update sent cache after edit");
            }
        }
        self.publish_messages();
        Ok(())
    }

    /// Delete one of my messages, leaving a tombstone in place.
    pub async fn delete(&mut self, id: MessageId) -> Result<(), ClientError> {
        if self.transport.connection_state() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        let msg = self
            .messages
            .get_mut_by_id(id)
            .ok_or(ClientError::MessageNotFound)?;
        if msg.sender != self.me {
            return Err(ClientError::NotOwnMessage);
        }
        if msg.is_deleted() {
            return Ok(());
        }

        self.transport
            .emit(ClientEvent::DeleteMessage { message_id: id })
            .await?;
        if let Some(msg) = self.messages.get_mut_by_id(id) {
            tombstone(msg, now_millis());
        }
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.remove(id).await {
                tracing::warn!(%id, error = %e, "failed to drop sent cache entry");
            }
        }
        self.publish_messages();
        Ok(())
    }

    /// Tell the partner I am typing, at most once per throttle window.
    pub async fn send_typing(&mut self) {
        let Some(peer) = self.peer else { return };
        if self.transport.connection_state() != ConnectionState::Connected {
            return;
        }
        if self
            .last_typing_sent
            .is_some_and(|t| t.elapsed() < self.settings.typing_throttle)
        {
            return;
        }
        self.last_typing_sent = Some(Instant::now());
        if let Err(e) = self.transport.emit(ClientEvent::Typing { to_user_id: peer }).await {
            tracing::debug!(error = %e, "typing notification not sent");
        }
    }

    /// Per-peer unread counts. Failures degrade to an empty overview.
    pub async fn unread_overview(&mut self) -> Vec<UnreadOverview> {
        match self.history.unread_overview().await {
            Ok(overview) => {
                self.unread = overview
                    .iter()
                    .map(|o| (o.peer_id, o.unread_count))
                    .collect();
                self.observers.set_unread(&self.unread);
                overview
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load unread overview");
                Vec::new()
            }
        }
    }

    /// Recovery for a lost private key: wipe the vault, create a fresh
    /// identity, publish it and tell the partner to refetch.
    ///
    /// Messages encrypted to the old key become permanently unreadable.
    pub async fn regenerate_keys(&mut self) -> Result<(), ClientError> {
        tracing::warn!(user_id = %self.me, "regenerating identity keys");
        self.engine.clear_private_key();
        self.vault.reset_user(&self.me)?;
        let public_key = self.create_identity().await?;
        self.history.upload_public_key(&public_key).await?;

        self.own_key = OwnKey::Present;
        self.cache_failures = 0;
        self.decrypt_failures.clear();
        self.publish_key_state();

        if let Some(peer) = self.peer {
            if let Err(e) = self
                .transport
                .emit(ClientEvent::NotifyKeyRegenerated { room_id: peer })
                .await
            {
                tracing::warn!(%peer, error = %e, "could not notify partner of new keys");
            }
        }
        Ok(())
    }

    /// Apply one real-time event.
    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage {
                message_id,
                from_user_id,
                ciphertext,
                timestamp,
            } => {
                self.on_receive(message_id, from_user_id, ciphertext, timestamp)
                    .await
            }
            ServerEvent::MessageSent {
                message_id,
                timestamp,
            } => self.on_sent(message_id, timestamp).await,
            ServerEvent::MessageEdited {
                message_id,
                ciphertext,
                edited_at,
            } => self.on_remote_edit(message_id, ciphertext, edited_at),
            ServerEvent::MessageDeleted { message_id } => self.on_remote_delete(message_id).await,
            ServerEvent::MessageRead { message_id } => self.on_read_receipt(message_id),
            ServerEvent::Typing { from_user_id } => {
                if Some(from_user_id) == self.peer {
                    self.observers.set_partner_typing(true);
                    self.scheduler.schedule(
                        TaskKey::TypingExpiry,
                        self.settings.typing_timeout,
                        SessionTask::TypingExpired,
                    );
                }
            }
            ServerEvent::KeyRegenerated {
                from_user_id,
                from_username,
            } => self.on_partner_key_regenerated(from_user_id, &from_username),
            ServerEvent::UserOnline { user_id } => {
                self.online_users.insert(user_id);
                self.observers.set_partner_online(self.partner_online());
            }
            ServerEvent::UserOffline { user_id } => {
                self.online_users.remove(&user_id);
                self.observers.set_partner_online(self.partner_online());
            }
            ServerEvent::OnlineUsers { user_ids } => {
                self.online_users = user_ids.into_iter().collect();
                self.observers.set_partner_online(self.partner_online());
            }
            ServerEvent::Pong { ts } => {
                let rtt = (now_millis() - ts).max(0) as u64;
                self.observers.set_latency(Duration::from_millis(rtt));
            }
        }
    }

    /// Apply one timer or background-fetch result.
    pub async fn handle_task(&mut self, task: SessionTask) {
        match task {
            SessionTask::PeriodicSync | SessionTask::ReconnectSync => self.start_background_sync(),
            SessionTask::RetryPartnerKey { attempt } => self.retry_partner_key(attempt).await,
            SessionTask::PendingTimeout { ts } => {
                if self.awaiting_ack.remove(&ts) {
                    tracing::debug!(ts, "send not acknowledged in time; left for reconciliation");
                }
            }
            SessionTask::TypingExpired => self.observers.set_partner_typing(false),
            SessionTask::HealthProbe => {
                if self.transport.connection_state() == ConnectionState::Connected {
                    if let Err(e) = self.transport.emit(ClientEvent::Ping { ts: now_millis() }).await {
                        tracing::debug!(error = %e, "health ping not sent");
                    }
                }
            }
            SessionTask::SyncFetched { peer, result } => {
                self.sync_in_progress = false;
                if Some(peer) != self.peer {
                    return;
                }
                match result {
                    Ok(records) => {
                        self.apply_history(records).await;
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "background sync failed"),
                }
            }
        }
    }

    /// React to a transport connection-state change. Coming back online
    /// refetches the partner key and schedules a reconciliation pass after
    /// the settle delay.
    pub async fn on_connection_change(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.last_connection, state);
        match state {
            ConnectionState::Connected if previous != ConnectionState::Connected => {
                if !self.initialized {
                    return;
                }
                tracing::info!("connection restored; resynchronizing");
                self.refresh_partner_key().await;
                self.scheduler.schedule(
                    TaskKey::ReconnectSync,
                    self.settings.reconnect_settle,
                    SessionTask::ReconnectSync,
                );
            }
            ConnectionState::Disconnected => {
                self.scheduler.cancel(TaskKey::ReconnectSync);
                self.observers.set_partner_typing(false);
            }
            _ => {}
        }
    }

    /// Stop all timers. The session can be re-initialized afterwards.
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.initialized = false;
    }

    async fn on_receive(
        &mut self,
        message_id: Option<MessageId>,
        from: UserId,
        ciphertext: String,
        ts: i64,
    ) {
        if from == self.me {
            return;
        }
        if Some(from) != self.peer {
            *self.unread.entry(from).or_insert(0) += 1;
            self.observers.set_unread(&self.unread);
            return;
        }

        let mut msg = ChatMsg::inbound(message_id, from, String::new(), ts, None);
        if self.messages.is_duplicate(&msg) {
            tracing::debug!(?message_id, ts, "duplicate inbound message ignored");
            return;
        }

        msg.text = self.decrypt_cached(&ciphertext);
        msg.ct = Some(ciphertext);
        self.messages.insert_sorted(msg);
        self.observers.set_partner_typing(false);
        self.publish_messages();

        if let Some(id) = message_id {
            if let Err(e) = self.transport.emit(ClientEvent::ReadMessage { message_id: id }).await {
                tracing::debug!(%id, error = %e, "read receipt not sent");
            }
        }
    }

    async fn on_sent(&mut self, id: MessageId, server_ts: i64) {
        if self.messages.contains_id(id) {
            tracing::debug!(%id, "ack for already known message ignored");
            return;
        }
        let Some(idx) = self.messages.oldest_pending() else {
            tracing::debug!(%id, "ack without a pending message; scheduling sync");
            self.start_background_sync();
            return;
        };
        let status = self.ack_status();
        let Some(msg) = self.messages.get_mut(idx) else { return };
        let local_ts = msg.ts;
        msg.id = Some(id);
        msg.ts = server_ts;
        msg.status = Some(status);

        self.awaiting_ack.remove(&local_ts);
        self.scheduler.cancel(TaskKey::PendingTimeout(local_ts));
        if let Some(cache) = &self.sent_cache {
            if let Err(e) = cache.promote(local_ts, id, server_ts).await {
                tracing::warn!(%id, error = %e, "failed to migrate sent cache entry");
            }
        }
        self.messages.sort();
        self.publish_messages();
    }

    fn on_remote_edit(&mut self, id: MessageId, ciphertext: String, edited_at: i64) {
        let Some(idx) = self.messages.position_by_id(id) else {
            self.start_background_sync();
            return;
        };
        let inbound = self.messages.get(idx).is_some_and(|m| m.sender != self.me);
        let text = inbound.then(|| self.decrypt_cached(&ciphertext));
        if let Some(msg) = self.messages.get_mut(idx) {
            if msg.is_deleted() {
                return;
            }
            if let Some(text) = text {
                msg.text = text;
                msg.ct = Some(ciphertext);
            }
            msg.edited_at = Some(edited_at);
        }
        self.publish_messages();
    }

    async fn on_remote_delete(&mut self, id: MessageId) {
        let Some(msg) = self.messages.get_mut_by_id(id) else {
            self.start_background_sync();
            return;
        };
        let mine = msg.sender == self.me;
        tombstone(msg, now_millis());
        if mine {
            if let Some(cache) = &self.sent_cache {
                if let Err(e) = cache.remove(id).await {
                    tracing::debug!(%id, error = %e, "sent cache cleanup failed");
                }
            }
        }
        self.publish_messages();
    }

    fn on_read_receipt(&mut self, id: MessageId) {
        let me = self.me;
        let Some(msg) = self.messages.get_mut_by_id(id) else {
            self.start_background_sync();
            return;
        };
        if msg.sender != me {
            return;
        }
        msg.status = Some(MessageStatus::Read);
        msg.read_at.get_or_insert_with(now_millis);
        self.publish_messages();
    }

    fn on_partner_key_regenerated(&mut self, from: UserId, username: &str) {
        if Some(from) != self.peer {
            return;
        }
        tracing::info!(peer = %from, username, "partner regenerated keys; refetching");
        self.partner_public_key = None;
        self.partner_key = PartnerKey::Regenerating { attempt: 1 };
        self.publish_key_state();
        self.scheduler.schedule(
            TaskKey::PartnerKeyRetry,
            self.settings.key_retry_delay(1),
            SessionTask::RetryPartnerKey { attempt: 1 },
        );
    }

    async fn retry_partner_key(&mut self, attempt: u32) {
        let Some(peer) = self.peer else { return };
        let regenerating = matches!(self.partner_key, PartnerKey::Regenerating { .. });
        match self.lookup_partner_key(peer).await {
            Ok(PartnerLookup::Usable(key)) => {
                tracing::info!(%peer, attempt, "partner key available");
                self.apply_partner_lookup(PartnerLookup::Usable(key));
                return;
            }
            Ok(lookup) if !regenerating => {
                self.apply_partner_lookup(lookup);
                return;
            }
            Ok(_) => tracing::debug!(%peer, attempt, "partner key not yet republished"),
            Err(e) => tracing::warn!(%peer, attempt, error = %e, "partner key fetch failed"),
        }

        if attempt >= self.settings.key_retry_attempts {
            if regenerating {
                tracing::warn!(%peer, attempt, "partner key retries exhausted");
                self.partner_key = PartnerKey::RetryExhausted;
                self.publish_key_state();
            }
            return;
        }
        let next = attempt + 1;
        if regenerating {
            self.partner_key = PartnerKey::Regenerating { attempt: next };
            self.publish_key_state();
        }
        self.scheduler.schedule(
            TaskKey::PartnerKeyRetry,
            self.settings.key_retry_delay(next),
            SessionTask::RetryPartnerKey { attempt: next },
        );
    }

    /// Fetch the partner bundle and apply it. A partner still mid-regeneration
    /// stays blocked until a usable key shows up.
    async fn refresh_partner_key(&mut self) {
        let Some(peer) = self.peer else { return };
        match self.lookup_partner_key(peer).await {
            Ok(PartnerLookup::Usable(key)) => self.apply_partner_lookup(PartnerLookup::Usable(key)),
            Ok(_) if matches!(self.partner_key, PartnerKey::Regenerating { .. }) => {}
            Ok(lookup) => self.apply_partner_lookup(lookup),
            Err(e) => {
                tracing::warn!(%peer, error = %e, "partner key fetch failed; retrying");
                if self.partner_key == PartnerKey::Unknown {
                    self.scheduler.schedule(
                        TaskKey::PartnerKeyRetry,
                        self.settings.key_retry_delay(1),
                        SessionTask::RetryPartnerKey { attempt: 1 },
                    );
                }
            }
        }
    }

    async fn lookup_partner_key(&self, peer: UserId) -> Result<PartnerLookup, ClientError> {
        let bundle = self.history.public_key_bundle(peer).await?;
        if bundle.is_key_missing {
            return Ok(PartnerLookup::Missing);
        }
        Ok(match bundle.usable_key() {
            Some(key) => PartnerLookup::Usable(key.to_string()),
            None => PartnerLookup::NotPublished,
        })
    }

    fn apply_partner_lookup(&mut self, lookup: PartnerLookup) {
        match lookup {
            PartnerLookup::Usable(key) => {
                self.partner_public_key = Some(key);
                self.partner_key = PartnerKey::Usable;
                self.scheduler.cancel(TaskKey::PartnerKeyRetry);
            }
            PartnerLookup::Missing => {
                self.partner_public_key = None;
                self.partner_key = PartnerKey::Missing;
            }
            PartnerLookup::NotPublished => {
                self.partner_public_key = None;
                self.partner_key = PartnerKey::NotPublished;
            }
        }
        self.publish_key_state();
    }

    async fn revalidate_keys(&mut self) {
        if !self.engine.has_private_key() {
            self.own_key = OwnKey::Unknown;
            self.ensure_own_key().await;
        }
        if self.own_key == OwnKey::Present {
            self.heal_own_bundle().await;
        }
        self.refresh_partner_key().await;
        self.publish_key_state();
    }

    /// Load my private key from the vault, provisioning a new identity when
    /// there is no vault at all and entering recovery when the vault exists
    /// but the key cannot be recovered.
    async fn ensure_own_key(&mut self) {
        if self.own_key == OwnKey::Present && self.engine.has_private_key() {
            return;
        }

        match self.vault.set_current_user(self.me, true).await {
            Ok(()) => {}
            Err(CryptoError::VaultUnavailable) => {
                if self.vault.database_exists(&self.me) {
                    tracing::warn!(user_id = %self.me, "vault exists without its protection key");
                    self.enter_local_corruption().await;
                } else {
                    tracing::info!(user_id = %self.me, "no vault found; provisioning new identity");
                    self.provision_identity().await;
                }
                return;
            }
            Err(e) => {
                tracing::error!(user_id = %self.me, error = %e, "failed to open vault");
                self.own_key = OwnKey::Corrupted;
                self.publish_key_state();
                return;
            }
        }

        match self.vault.get_bytes(PRIVATE_KEY_RECORD).await {
            Some(der) => match self.engine.import_private_key(&der) {
                Ok(fingerprint) => {
                    tracing::debug!(fingerprint = fingerprint.short(), "private key loaded");
                    self.own_key = OwnKey::Present;
                }
                Err(e) => {
                    tracing::warn!(user_id = %self.me, error = %e, "stored private key is unusable");
                    self.enter_local_corruption().await;
                }
            },
            None => match self.vault.record_count().await {
                Ok(0) => {
                    tracing::info!(user_id = %self.me, "vault is empty; provisioning new identity");
                    self.provision_identity().await;
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(user_id = %self.me, "private key missing from vault");
                    self.enter_local_corruption().await;
                }
            },
        }
        self.publish_key_state();
    }

    async fn provision_identity(&mut self) {
        match self.create_identity().await {
            Ok(public_key) => {
                self.own_key = OwnKey::Present;
                if let Err(e) = self.history.upload_public_key(&public_key).await {
                    tracing::warn!(error = %e, "public key upload failed; will retry on revalidation");
                }
            }
            Err(e) => {
                tracing::error!(user_id = %self.me, error = %e, "failed to provision identity");
                self.engine.clear_private_key();
                self.own_key = OwnKey::Corrupted;
            }
        }
        self.publish_key_state();
    }

    /// Generate a key pair and persist the private half. Returns the public key.
    async fn create_identity(&mut self) -> Result<String, ClientError> {
        self.vault.set_current_user(self.me, false).await?;
        let public_key = self.engine.generate_key_pair()?;
        let der = self.engine.export_private_key()?;
        self.vault
            .set(PRIVATE_KEY_RECORD, Some(VaultValue::Bytes(der.to_vec())))
            .await?;
        if let Ok(fingerprint) = self.engine.fingerprint() {
            tracing::info!(user_id = %self.me, fingerprint = fingerprint.short(), "identity created");
        }
        Ok(public_key)
    }

    async fn enter_local_corruption(&mut self) {
        self.engine.clear_private_key();
        self.own_key = OwnKey::Corrupted;
        self.publish_key_state();
        if let Err(e) = self.history.mark_keys_missing().await {
            tracing::warn!(error = %e, "failed to report missing keys");
        }
    }

    /// Re-upload my public key if the directory says it is missing while I
    /// still hold the private key.
    async fn heal_own_bundle(&mut self) {
        let bundle = match self.history.public_key_bundle(self.me).await {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::debug!(error = %e, "could not check own key bundle");
                return;
            }
        };
        let Ok(local) = self.engine.export_current_public_key() else { return };
        match bundle.usable_key() {
            None => {
                tracing::info!(user_id = %self.me, "directory lacks my public key; re-uploading");
                if let Err(e) = self.history.upload_public_key(&local).await {
                    tracing::warn!(error = %e, "public key re-upload failed");
                }
            }
            Some(published) if published != local => {
                tracing::warn!(user_id = %self.me, "published public key differs from local key");
            }
            Some(_) => {}
        }
    }

    async fn load_profiles(&mut self, peer: UserId) {
        match self.history.user_profile(peer).await {
            Ok(profile) => self.observers.set_partner(Some(profile)),
            Err(e) => tracing::warn!(%peer, error = %e, "failed to load partner profile"),
        }
        if self.own_profile.is_none() {
            match self.history.user_profile(self.me).await {
                Ok(profile) => self.own_profile = Some(profile),
                Err(e) => tracing::debug!(error = %e, "failed to load own profile"),
            }
        }
    }

    async fn mark_history_read(&mut self) {
        let Some(peer) = self.peer else { return };
        let unread: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| m.sender == peer && m.read_at.is_none() && !m.is_deleted())
            .filter_map(|m| m.id)
            .collect();
        if unread.is_empty() {
            return;
        }
        match self.history.mark_read(peer, &unread).await {
            Ok(()) => {
                self.unread.remove(&peer);
                self.observers.set_unread(&self.unread);
            }
            Err(e) => tracing::warn!(%peer, error = %e, "failed to mark history read"),
        }
    }

    fn reset_conversation(&mut self) {
        self.scheduler.cancel_all();
        self.messages.clear();
        self.awaiting_ack.clear();
        self.partner_key = PartnerKey::Unknown;
        self.partner_public_key = None;
        self.decrypt_failures.clear();
        self.sync_in_progress = false;
        self.initialized = false;
        self.observers.set_partner(None);
        self.observers.set_partner_typing(false);
        self.publish_messages();
    }

    fn ready_partner_key(&self) -> Result<String, ClientError> {
        let state = self.key_state();
        match (&self.partner_public_key, state) {
            (Some(key), KeyState::Ready) => Ok(key.clone()),
            _ => Err(ClientError::KeysUnavailable(state)),
        }
    }

    fn decrypt_cached(&mut self, ciphertext: &str) -> String {
        let digest = digest_hex(ciphertext.as_bytes());
        if self.decrypt_failures.contains(&digest) {
            return UNDECRYPTABLE_TEXT.to_string();
        }
        match self.engine.decrypt_message(ciphertext) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(error = %e, "inbound message could not be decrypted");
                self.decrypt_failures.insert(digest);
                UNDECRYPTABLE_TEXT.to_string()
            }
        }
    }

    fn ack_status(&self) -> MessageStatus {
        if self.partner_online() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// Local send timestamp, strictly increasing so pending entries never collide.
    fn next_stamp(&mut self) -> i64 {
        let ts = now_millis().max(self.last_stamp + 1);
        self.last_stamp = ts;
        ts
    }

    fn publish_messages(&self) {
        self.observers.publish_messages(self.messages.as_slice());
    }

    fn publish_key_state(&self) {
        self.observers.set_key_state(self.key_state());
    }
}

fn validate_text(text: &str) -> Result<(), ClientError> {
    if text.trim().is_empty() {
        return Err(ClientError::InvalidMessage("message is empty".into()));
    }
    if text.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(ClientError::InvalidMessage(format!(
            "message exceeds {MAX_MESSAGE_SIZE_BYTES} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
