//! Error types for the veilchat client.

use thiserror::Error;
use veilchat_crypto::error::CryptoError;
use veilchat_shared::error::VeilChatError;

use crate::session::key_state::KeyState;

/// Errors surfaced by the chat session, transport, and REST client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Api(#[from] VeilChatError),

    /// The request never produced an HTTP response.
    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The real-time transport is not connected; nothing was queued.
    #[error("not connected")]
    Disconnected,

    /// Messages cannot be encrypted or decrypted in the current key state.
    #[error("keys unavailable: {0:?}")]
    KeysUnavailable(KeyState),

    #[error("session has not been initialized for a conversation")]
    NotInitialized,

    #[error("message not found")]
    MessageNotFound,

    #[error("message was not sent by the current user")]
    NotOwnMessage,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The session task has stopped.
    #[error("session closed")]
    SessionClosed,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Http("request timed out".into())
        } else if e.is_connect() {
            Self::Http("could not connect to server".into())
        } else if e.is_decode() {
            Self::Serialization(e.to_string())
        } else {
            Self::Http("network request failed".into())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_is_transparent() {
        let err: ClientError = CryptoError::NoKey.into();
        assert_eq!(err.to_string(), "no key pair loaded");
    }

    #[test]
    fn api_error_converts() {
        let err: ClientError = VeilChatError::RateLimited.into();
        assert!(matches!(err, ClientError::Api(VeilChatError::RateLimited)));
    }

    #[test]
    fn keys_unavailable_names_state() {
        let err = ClientError::KeysUnavailable(KeyState::BlockedByLocalCorruption);
        assert!(err.to_string().contains("BlockedByLocalCorruption"));
    }
}
