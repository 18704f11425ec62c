//! Wire envelope for hybrid-encrypted messages.
//!
//! Format: `base64(json({ "k": b64(wrapped key), "c": b64(ciphertext || tag), "iv": b64(nonce) }))`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use veilchat_shared::api::message::base64_serde;

use crate::error::CryptoError;

pub(crate) const NONCE_SIZE: usize = 12; // 96-bit nonce for AES-256-GCM
const TAG_SIZE: usize = 16;

/// A hybrid-encryption envelope: RSA-wrapped one-time key, AES-GCM ciphertext, nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "base64_serde")]
    pub k: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub c: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub iv: Vec<u8>,
}

impl Envelope {
    /// Pack into the single string carried by the transport.
    pub fn encode(&self) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Parse a transported string. Any structural problem is a decryption failure.
    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Decrypt(format!("envelope is not base64: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&json)
            .map_err(|e| CryptoError::Decrypt(format!("malformed envelope: {e}")))?;

        if envelope.iv.len() != NONCE_SIZE {
            return Err(CryptoError::Decrypt("envelope nonce has wrong length".into()));
        }
        if envelope.c.len() < TAG_SIZE {
            return Err(CryptoError::Decrypt("envelope ciphertext too short".into()));
        }
        if envelope.k.is_empty() {
            return Err(CryptoError::Decrypt("envelope has no wrapped key".into()));
        }
        Ok(envelope)
    }
}
