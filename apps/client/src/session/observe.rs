//! Observable session state.
//!
//! The session owns one `watch` sender per field and only publishes when a
//! value actually changed; consumers hold a [`SessionView`] of receivers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use veilchat_shared::api::user::UserProfile;
use veilchat_shared::chat::ChatMsg;
use veilchat_shared::ids::UserId;

use super::key_state::KeyState;
use crate::transport::ConnectionState;

pub(crate) struct SessionObservers {
    messages: watch::Sender<Arc<Vec<ChatMsg>>>,
    key_state: watch::Sender<KeyState>,
    loading: watch::Sender<bool>,
    partner_online: watch::Sender<bool>,
    partner_typing: watch::Sender<bool>,
    partner: watch::Sender<Option<UserProfile>>,
    unread: watch::Sender<Arc<HashMap<UserId, u32>>>,
    latency: watch::Sender<Option<Duration>>,
}

/// Read side of a session's state. Cheap to clone.
#[derive(Clone)]
pub struct SessionView {
    pub messages: watch::Receiver<Arc<Vec<ChatMsg>>>,
    pub key_state: watch::Receiver<KeyState>,
    pub loading: watch::Receiver<bool>,
    pub partner_online: watch::Receiver<bool>,
    pub partner_typing: watch::Receiver<bool>,
    pub partner: watch::Receiver<Option<UserProfile>>,
    /// Unread counts per peer, including peers other than the open one.
    pub unread: watch::Receiver<Arc<HashMap<UserId, u32>>>,
    /// Round trip of the last health probe.
    pub latency: watch::Receiver<Option<Duration>>,
    pub connection: watch::Receiver<ConnectionState>,
}

impl SessionObservers {
    pub(crate) fn new() -> Self {
        Self {
            messages: watch::channel(Arc::new(Vec::new())).0,
            key_state: watch::channel(KeyState::Unknown).0,
            loading: watch::channel(false).0,
            partner_online: watch::channel(false).0,
            partner_typing: watch::channel(false).0,
            partner: watch::channel(None).0,
            unread: watch::channel(Arc::new(HashMap::new())).0,
            latency: watch::channel(None).0,
        }
    }

    pub(crate) fn view(&self, connection: watch::Receiver<ConnectionState>) -> SessionView {
        SessionView {
            messages: self.messages.subscribe(),
            key_state: self.key_state.subscribe(),
            loading: self.loading.subscribe(),
            partner_online: self.partner_online.subscribe(),
            partner_typing: self.partner_typing.subscribe(),
            partner: self.partner.subscribe(),
            unread: self.unread.subscribe(),
            latency: self.latency.subscribe(),
            connection,
        }
    }

    pub(crate) fn publish_messages(&self, messages: &[ChatMsg]) {
        self.messages.send_if_modified(|current| {
            if current.as_slice() == messages {
                return false;
            }
            *current = Arc::new(messages.to_vec());
            true
        });
    }

    pub(crate) fn set_key_state(&self, state: KeyState) {
        set_if_changed(&self.key_state, state);
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        set_if_changed(&self.loading, loading);
    }

    pub(crate) fn set_partner_online(&self, online: bool) {
        set_if_changed(&self.partner_online, online);
    }

    pub(crate) fn set_partner_typing(&self, typing: bool) {
        set_if_changed(&self.partner_typing, typing);
    }

    pub(crate) fn set_partner(&self, profile: Option<UserProfile>) {
        set_if_changed(&self.partner, profile);
    }

    pub(crate) fn set_unread(&self, unread: &HashMap<UserId, u32>) {
        self.unread.send_if_modified(|current| {
            if **current == *unread {
                return false;
            }
            *current = Arc::new(unread.clone());
            true
        });
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.latency.send_replace(Some(latency));
    }
}

fn set_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            return false;
        }
        *current = value;
        true
    });
}
