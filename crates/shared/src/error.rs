/// Shared error type for API-level failures seen by the client.
#[derive(Debug, thiserror::Error)]
pub enum VeilChatError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl VeilChatError {
    /// Map a non-success HTTP status code to the matching variant.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            400 | 422 => VeilChatError::Validation(detail),
            401 => VeilChatError::Unauthorized,
            403 => VeilChatError::Forbidden,
            404 => VeilChatError::NotFound,
            429 => VeilChatError::RateLimited,
            500..=599 => VeilChatError::ServiceUnavailable(detail),
            _ => VeilChatError::Internal(detail),
        }
    }
}
