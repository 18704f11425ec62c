/// Maximum size for a single message plaintext in bytes.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024;
/// Text shown in place of a deleted message.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";
/// Text shown for an inbound message that cannot be decrypted.
pub const UNDECRYPTABLE_TEXT: &str = "[unable to decrypt this message]";
/// Text shown for one of my own messages whose plaintext is no longer cached.
pub const UNRECOVERABLE_SENT_TEXT: &str = "[sent message unavailable on this device]";
