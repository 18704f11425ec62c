//! Contracts for the REST history/key API and the real-time event channel.

pub mod keys;
pub mod message;
pub mod user;
pub mod ws;
