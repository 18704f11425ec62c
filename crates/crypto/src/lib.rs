//! veilchat-crypto: client-side key material for veilchat.
//!
//! Provides the hybrid RSA-OAEP / AES-256-GCM message engine, the wire
//! envelope codec, private-key fingerprints, and the per-user encrypted
//! key vault backed by SQLite with its protection key held in the OS keychain.

pub mod engine;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod protection_key;
pub mod vault;
