use async_trait::async_trait;
use veilchat_shared::api::keys::PublicKeyBundle;
use veilchat_shared::api::message::{HistoryRecord, UnreadOverview};
use veilchat_shared::api::user::UserProfile;
use veilchat_shared::ids::{MessageId, UserId};

use crate::error::ClientError;

/// REST surface the chat session depends on. All calls act as the
/// authenticated current user.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Full message history between the current user and `peer`.
    async fn conversation_history(&self, peer: UserId) -> Result<Vec<HistoryRecord>, ClientError>;

    async fn unread_overview(&self) -> Result<Vec<UnreadOverview>, ClientError>;

    async fn mark_read(&self, peer: UserId, message_ids: &[MessageId]) -> Result<(), ClientError>;

    async fn public_key_bundle(&self, user: UserId) -> Result<PublicKeyBundle, ClientError>;

    /// Publish the current user's public key, clearing any missing flag.
    async fn upload_public_key(&self, public_key: &str) -> Result<(), ClientError>;

    /// Report that the current user's private key has been lost.
    async fn mark_keys_missing(&self) -> Result<(), ClientError>;

    async fn user_profile(&self, user: UserId) -> Result<UserProfile, ClientError>;
}
