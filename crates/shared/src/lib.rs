//! Shared veilchat types: ids, chat data model, and wire/API contracts shared
//! between the crypto layer and the client session.

pub mod api;
pub mod chat;
pub mod constants;
pub mod error;
pub mod ids;
