use crate::ids::{MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Events sent from the client to the server over the real-time channel.
///
/// `ciphertext` fields always carry an encoded envelope; the server never
/// sees plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendMessage {
        to_user_id: UserId,
        ciphertext: String,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        ciphertext: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    Typing {
        to_user_id: UserId,
    },
    ReadMessage {
        message_id: MessageId,
    },
    NotifyKeyRegenerated {
        room_id: UserId,
    },
    Ping {
        ts: i64,
    },
}

/// Events pushed from the server to the client over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    ReceiveMessage {
        #[serde(default)]
        message_id: Option<MessageId>,
        from_user_id: UserId,
        ciphertext: String,
        timestamp: i64,
    },
    MessageSent {
        message_id: MessageId,
        timestamp: i64,
    },
    MessageEdited {
        message_id: MessageId,
        ciphertext: String,
        edited_at: i64,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    MessageRead {
        message_id: MessageId,
    },
    Typing {
        from_user_id: UserId,
    },
    KeyRegenerated {
        from_user_id: UserId,
        from_username: String,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    Pong {
        ts: i64,
    },
}
