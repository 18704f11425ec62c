use crate::ids::{MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serde helper for binary fields carried as standard base64 strings.
pub mod base64_serde {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One message as stored by the server: opaque ciphertext plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl HistoryRecord {
    pub fn ts_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    pub fn read_at_millis(&self) -> Option<i64> {
        self.read_at.map(|t| t.timestamp_millis())
    }

    pub fn edited_at_millis(&self) -> Option<i64> {
        self.edited_at.map(|t| t.timestamp_millis())
    }
}

/// Unread message count for one conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadOverview {
    pub peer_id: UserId,
    pub unread_count: u32,
}

/// Request to mark messages from a partner as read by the current user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub peer_id: UserId,
    pub message_ids: Vec<MessageId>,
}
