//! Shared fixtures for session integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;
use veilchat_client::config::SessionSettings;
use veilchat_client::error::ClientError;
use veilchat_client::history::HistoryApi;
use veilchat_client::session::{ChatSession, SessionDeps, SessionTask};
use veilchat_client::transport::{channel_transport, ChannelPeer, Transport};
use veilchat_crypto::engine::CryptoEngine;
use veilchat_crypto::protection_key::MemoryKeyStore;
use veilchat_crypto::vault::KeyVault;
use veilchat_shared::api::keys::PublicKeyBundle;
use veilchat_shared::api::message::{HistoryRecord, UnreadOverview};
use veilchat_shared::api::user::UserProfile;
use veilchat_shared::api::ws::ServerEvent;
use veilchat_shared::error::VeilChatError;
use veilchat_shared::ids::{MessageId, UserId};

// ---------------------------------------------------------------------------
// Key fixtures
// ---------------------------------------------------------------------------

fn fixture_key(cell: &'static OnceLock<Vec<u8>>) -> CryptoEngine {
    let der = cell.get_or_init(|| {
        let mut engine = CryptoEngine::new();
        engine.generate_key_pair().unwrap();
        engine.export_private_key().unwrap().to_vec()
    });
    let mut engine = CryptoEngine::new();
    engine.import_private_key(der).unwrap();
    engine
}

/// The conversation partner's current key pair.
pub fn partner_engine() -> CryptoEngine {
    static KEY: OnceLock<Vec<u8>> = OnceLock::new();
    fixture_key(&KEY)
}

/// The partner's key pair after they regenerated.
pub fn regenerated_partner_engine() -> CryptoEngine {
    static KEY: OnceLock<Vec<u8>> = OnceLock::new();
    fixture_key(&KEY)
}

// ---------------------------------------------------------------------------
// Fake REST API
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeState {
    pub records: Vec<HistoryRecord>,
    pub bundles: HashMap<UserId, PublicKeyBundle>,
    pub profiles: HashMap<UserId, UserProfile>,
    pub uploads: Vec<String>,
    pub keys_missing_reports: u32,
    pub marked_read: Vec<MessageId>,
    pub unread: Vec<UnreadOverview>,
    pub history_calls: u32,
    pub fail_history: bool,
}

/// In-memory stand-in for the server, acting as user `me`.
pub struct FakeHistory {
    me: UserId,
    state: Mutex<FakeState>,
}

impl FakeHistory {
    pub fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self {
            me,
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn publish_key(&self, user: UserId, public_key: &str) {
        self.with(|s| {
            s.bundles.insert(
                user,
                PublicKeyBundle {
                    user_id: user,
                    public_key: Some(public_key.to_string()),
                    has_public_key: true,
                    is_key_missing: false,
                },
            )
        });
    }

    pub fn mark_missing(&self, user: UserId) {
        self.with(|s| {
            s.bundles.insert(
                user,
                PublicKeyBundle {
                    user_id: user,
                    public_key: None,
                    has_public_key: false,
                    is_key_missing: true,
                },
            )
        });
    }

    pub fn published_key(&self, user: UserId) -> Option<String> {
        self.with(|s| s.bundles.get(&user).and_then(|b| b.usable_key().map(str::to_string)))
    }

    pub fn add_record(&self, record: HistoryRecord) {
        self.with(|s| s.records.push(record));
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn conversation_history(&self, _peer: UserId) -> Result<Vec<HistoryRecord>, ClientError> {
        self.with(|s| {
            s.history_calls += 1;
            if s.fail_history {
                return Err(ClientError::Http("could not connect to server".into()));
            }
            Ok(s.records.clone())
        })
    }

    async fn unread_overview(&self) -> Result<Vec<UnreadOverview>, ClientError> {
        Ok(self.with(|s| s.unread.clone()))
    }

    async fn mark_read(&self, _peer: UserId, message_ids: &[MessageId]) -> Result<(), ClientError> {
        self.with(|s| s.marked_read.extend_from_slice(message_ids));
        Ok(())
    }

    async fn public_key_bundle(&self, user: UserId) -> Result<PublicKeyBundle, ClientError> {
        Ok(self.with(|s| {
            s.bundles.get(&user).cloned().unwrap_or(PublicKeyBundle {
                user_id: user,
                public_key: None,
                has_public_key: false,
                is_key_missing: false,
            })
        }))
    }

    async fn upload_public_key(&self, public_key: &str) -> Result<(), ClientError> {
        self.with(|s| s.uploads.push(public_key.to_string()));
        self.publish_key(self.me, public_key);
        Ok(())
    }

    async fn mark_keys_missing(&self) -> Result<(), ClientError> {
        self.with(|s| s.keys_missing_reports += 1);
        self.mark_missing(self.me);
        Ok(())
    }

    async fn user_profile(&self, user: UserId) -> Result<UserProfile, ClientError> {
        self.with(|s| s.profiles.get(&user).cloned())
            .ok_or(ClientError::Api(VeilChatError::NotFound))
    }
}

pub fn record(id: MessageId, sender: UserId, recipient: UserId, ciphertext: &str, ts: i64) -> HistoryRecord {
    HistoryRecord {
        id,
        sender_id: sender,
        recipient_id: recipient,
        ciphertext: ciphertext.to_string(),
        created_at: DateTime::<Utc>::from_timestamp_millis(ts).unwrap(),
        read_at: None,
        edited_at: None,
        is_deleted: false,
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Session harness
// ---------------------------------------------------------------------------

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        sync_interval: Duration::from_secs(3600),
        reconnect_settle: Duration::from_millis(10),
        pending_timeout: Duration::from_secs(3600),
        key_retry_base: Duration::from_millis(5),
        key_retry_max: Duration::from_millis(20),
        key_retry_attempts: 3,
        timestamp_tolerance_ms: 5_000,
        typing_timeout: Duration::from_secs(3600),
        typing_throttle: Duration::from_millis(0),
        health_interval: Duration::from_secs(3600),
    }
}

pub struct Harness {
    pub me: UserId,
    pub peer: UserId,
    pub session: ChatSession,
    pub tasks: mpsc::UnboundedReceiver<SessionTask>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub server: ChannelPeer,
    pub history: Arc<FakeHistory>,
    pub vault: Arc<KeyVault>,
    pub key_store: Arc<MemoryKeyStore>,
    pub partner: CryptoEngine,
    pub dir: Arc<TempDir>,
}

impl Harness {
    /// A connected session for a brand-new user whose partner has a key.
    pub async fn new() -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        Self::with_storage(UserId::new(), UserId::new(), dir, Arc::new(MemoryKeyStore::new())).await
    }

    /// A connected session over existing vault storage, as after a restart.
    pub async fn with_storage(
        me: UserId,
        peer: UserId,
        dir: Arc<TempDir>,
        key_store: Arc<MemoryKeyStore>,
    ) -> Self {
        let history = FakeHistory::new(me);
        let partner = partner_engine();
        history.publish_key(peer, &partner.export_current_public_key().unwrap());
        history.with(|s| {
            s.profiles.insert(
                peer,
                UserProfile {
                    id: peer,
                    username: "partner".into(),
                    avatar_url: None,
                },
            )
        });

        let vault = Arc::new(KeyVault::new(dir.path(), key_store.clone()));
        let (transport, events, server) = channel_transport();
        transport.connect().await.unwrap();

        let deps = SessionDeps {
            vault: vault.clone(),
            history: history.clone(),
            transport: Arc::new(transport),
        };
        let (session, tasks) = ChatSession::new(me, deps, test_settings());

        Self {
            me,
            peer,
            session,
            tasks,
            events,
            server,
            history,
            vault,
            key_store,
            partner,
            dir,
        }
    }

    pub async fn init(&mut self) {
        self.session.init(self.peer).await.unwrap();
        self.server.drain();
    }

    /// Ciphertext the partner would send me.
    pub fn from_partner(&self, text: &str) -> String {
        let my_key = self.history.published_key(self.me).expect("my key is published");
        self.partner.encrypt_with_public_key(text, &my_key).unwrap()
    }

    pub async fn next_task(&mut self) -> SessionTask {
        tokio::time::timeout(Duration::from_secs(5), self.tasks.recv())
            .await
            .expect("task within timeout")
            .expect("task channel open")
    }

    pub fn texts(&self) -> Vec<String> {
        self.session.messages().iter().map(|m| m.text.clone()).collect()
    }
}
