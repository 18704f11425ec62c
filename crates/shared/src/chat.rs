//! Client-side chat data model.

use crate::ids::{MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Delivery status of one of my own messages. Inbound messages carry no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

/// A single message as held in a conversation's local list.
///
/// `ts`, `edited_at`, `deleted_at` and `read_at` are milliseconds since the
/// Unix epoch. `id` is `None` only while the message is awaiting its server
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender: UserId,
    pub text: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
}

impl ChatMsg {
    /// A freshly composed outbound message, not yet acknowledged.
    pub fn pending(sender: UserId, text: impl Into<String>, ts: i64) -> Self {
        Self {
            id: None,
            sender,
            text: text.into(),
            ts,
            status: Some(MessageStatus::Pending),
            edited_at: None,
            deleted_at: None,
            read_at: None,
            ct: None,
        }
    }

    /// An inbound message from the conversation partner.
    pub fn inbound(
        id: Option<MessageId>,
        sender: UserId,
        text: impl Into<String>,
        ts: i64,
        ct: Option<String>,
    ) -> Self {
        Self {
            id,
            sender,
            text: text.into(),
            ts,
            status: None,
            edited_at: None,
            deleted_at: None,
            read_at: None,
            ct,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none() && self.status == Some(MessageStatus::Pending)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Plaintext of one of my own sent messages, cached in the vault because the
/// ciphertext on the server is encrypted to the partner's key, not mine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentCacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub text: String,
    pub ts: i64,
}
