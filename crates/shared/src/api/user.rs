use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// Public profile of a conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar_url: Option<String>,
}
