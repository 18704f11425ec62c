//! Typed values stored in the vault.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use veilchat_shared::api::message::base64_serde;

use crate::error::CryptoError;

/// A vault value tagged by coarse type so it can be restored faithfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum VaultValue {
    Bytes(#[serde(with = "base64_serde")] Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl VaultValue {
    /// Wrap any serializable structure.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CryptoError> {
        Ok(VaultValue::Json(serde_json::to_value(value)?))
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            VaultValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            VaultValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_json<T: DeserializeOwned>(self) -> Option<T> {
        match self {
            VaultValue::Json(v) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for VaultValue {
    fn from(bytes: Vec<u8>) -> Self {
        VaultValue::Bytes(bytes)
    }
}

impl From<String> for VaultValue {
    fn from(s: String) -> Self {
        VaultValue::Text(s)
    }
}

impl From<&str> for VaultValue {
    fn from(s: &str) -> Self {
        VaultValue::Text(s.to_string())
    }
}
