//! veilchat-client: the direct-message chat session and its collaborators.
//!
//! [`session::ChatSession`] ties the crypto engine and key vault from
//! `veilchat-crypto` to a real-time [`transport::Transport`] and a REST
//! [`history::HistoryApi`], and keeps the local message list consistent
//! with the server under disconnects, lost acks, and partner key rotation.

pub mod config;
pub mod error;
pub mod history;
pub mod http;
pub mod session;
pub mod telemetry;
pub mod transport;
