use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// A user's published public key, as returned by the key directory.
///
/// `is_key_missing` is set when the user has reported losing their private
/// key; it is distinct from never having published one (`has_public_key`
/// false).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub user_id: UserId,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub has_public_key: bool,
    #[serde(default)]
    pub is_key_missing: bool,
}

impl PublicKeyBundle {
    /// The public key, if the bundle carries one that can be used for encryption.
    pub fn usable_key(&self) -> Option<&str> {
        if self.is_key_missing || !self.has_public_key {
            return None;
        }
        self.public_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Request to publish the current user's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPublicKeyRequest {
    pub public_key: String,
}
