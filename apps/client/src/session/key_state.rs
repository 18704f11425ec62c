//! Key availability for a conversation.
//!
//! Two independent facts, whether my own private key is usable and whether
//! the partner has a usable public key, collapse into one [`KeyState`] that
//! the UI renders. A partner-side block is only reported once my own key is
//! confirmed present, so the UI never blames the partner for a local loss.

/// State of my own private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnKey {
    Unknown,
    Present,
    /// The vault exists but the key could not be recovered from it.
    Corrupted,
}

/// State of the partner's public key as last seen from the key directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerKey {
    Unknown,
    Usable,
    /// The partner reported losing their key.
    Missing,
    /// The partner never published a key.
    NotPublished,
    /// The partner announced a new key; fetching it, `attempt` is 1-based.
    Regenerating { attempt: u32 },
    /// Every fetch attempt after a regeneration failed.
    RetryExhausted,
}

/// Why the partner side blocks the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerBlock {
    KeyMissing,
    NotPublished,
    Regenerating { attempt: u32 },
    RetryExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Unknown,
    Loading,
    BlockedByPartner(PartnerBlock),
    BlockedByLocalCorruption,
    Ready,
}

impl KeyState {
    pub fn resolve(own: OwnKey, partner: PartnerKey) -> Self {
        match (own, partner) {
            (OwnKey::Corrupted, _) => KeyState::BlockedByLocalCorruption,
            (OwnKey::Unknown, _) | (_, PartnerKey::Unknown) => KeyState::Loading,
            (OwnKey::Present, PartnerKey::Usable) => KeyState::Ready,
            (OwnKey::Present, PartnerKey::Missing) => {
                KeyState::BlockedByPartner(PartnerBlock::KeyMissing)
            }
            (OwnKey::Present, PartnerKey::NotPublished) => {
                KeyState::BlockedByPartner(PartnerBlock::NotPublished)
            }
            (OwnKey::Present, PartnerKey::Regenerating { attempt }) => {
                KeyState::BlockedByPartner(PartnerBlock::Regenerating { attempt })
            }
            (OwnKey::Present, PartnerKey::RetryExhausted) => {
                KeyState::BlockedByPartner(PartnerBlock::RetryExhausted)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, KeyState::Ready)
    }

    pub fn my_private_key_missing(&self) -> bool {
        matches!(self, KeyState::BlockedByLocalCorruption)
    }

    /// True when the partner is the reason messages cannot be sent.
    pub fn partner_blocked(&self) -> bool {
        matches!(self, KeyState::BlockedByPartner(_))
    }
}
