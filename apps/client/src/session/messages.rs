//! The ordered message list of one conversation.

use veilchat_shared::chat::ChatMsg;
use veilchat_shared::constants::TOMBSTONE_TEXT;
use veilchat_shared::ids::{MessageId, UserId};

/// Messages sorted by timestamp. Equal timestamps keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    items: Vec<ChatMsg>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[ChatMsg] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Insert after every entry with a timestamp not greater than `msg.ts`.
    pub fn insert_sorted(&mut self, msg: ChatMsg) {
        let pos = self.items.partition_point(|m| m.ts <= msg.ts);
        self.items.insert(pos, msg);
    }

    /// Stable re-sort after timestamps were patched.
    pub fn sort(&mut self) {
        self.items.sort_by_key(|m| m.ts);
    }

    pub fn position_by_id(&self, id: MessageId) -> Option<usize> {
        self.items.iter().position(|m| m.id == Some(id))
    }

    pub fn get_mut_by_id(&mut self, id: MessageId) -> Option<&mut ChatMsg> {
        self.items.iter_mut().find(|m| m.id == Some(id))
    }

    pub fn get(&self, index: usize) -> Option<&ChatMsg> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ChatMsg> {
        self.items.get_mut(index)
    }

    pub fn remove(&mut self, index: usize) -> ChatMsg {
        self.items.remove(index)
    }

    pub fn contains_id(&self, id: MessageId) -> bool {
        self.position_by_id(id).is_some()
    }

    /// Id-less entry from `sender` at exactly `ts`.
    pub fn position_idless(&self, sender: UserId, ts: i64) -> Option<usize> {
        self.items
            .iter()
            .position(|m| m.id.is_none() && m.sender == sender && m.ts == ts)
    }

    /// Whether `msg` duplicates an entry already in the list: same id, or for
    /// id-less messages the same `(sender, ts)`.
    pub fn is_duplicate(&self, msg: &ChatMsg) -> bool {
        match msg.id {
            Some(id) => self.contains_id(id),
            None => self.position_idless(msg.sender, msg.ts).is_some(),
        }
    }

    /// The oldest message still awaiting its acknowledgement.
    pub fn oldest_pending(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_pending())
            .min_by_key(|(_, m)| m.ts)
            .map(|(i, _)| i)
    }

    /// The oldest awaiting-ack message within `tolerance_ms` of `ts`. Acks
    /// arrive in send order, so the oldest candidate owns the record.
    pub fn oldest_pending_near(&self, ts: i64, tolerance_ms: i64) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_pending() && (m.ts - ts).abs() <= tolerance_ms)
            .min_by_key(|(_, m)| m.ts)
            .map(|(i, _)| i)
    }

    pub fn newest_ts(&self) -> Option<i64> {
        self.items.iter().map(|m| m.ts).max()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMsg> {
        self.items.iter()
    }
}

/// Replace a message's content with the deletion marker. Timestamp and
/// position are untouched.
pub fn tombstone(msg: &mut ChatMsg, deleted_at: i64) {
    msg.text = TOMBSTONE_TEXT.to_string();
    msg.ct = None;
    if msg.deleted_at.is_none() {
        msg.deleted_at = Some(deleted_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(sender: UserId, ts: i64) -> ChatMsg {
        ChatMsg::inbound(Some(MessageId::new()), sender, format!("m{ts}"), ts, None)
    }

    #[test]
    fn insert_keeps_timestamp_order() {
        let peer = UserId::new();
        let mut list = MessageList::new();
        list.insert_sorted(inbound(peer, 30));
        list.insert_sorted(inbound(peer, 10));
        list.insert_sorted(inbound(peer, 20));
        let ts: Vec<i64> = list.iter().map(|m| m.ts).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let peer = UserId::new();
        let mut list = MessageList::new();
        let mut a = inbound(peer, 5);
        a.text = "first".into();
        let mut b = inbound(peer, 5);
        b.text = "second".into();
        list.insert_sorted(a);
        list.insert_sorted(b);
        assert_eq!(list.as_slice()[0].text, "first");
        assert_eq!(list.as_slice()[1].text, "second");
    }

    #[test]
    fn duplicate_detection_by_id_and_sender_ts() {
        let peer = UserId::new();
        let mut list = MessageList::new();
        let with_id = inbound(peer, 1);
        list.insert_sorted(with_id.clone());
        assert!(list.is_duplicate(&with_id));

        let idless = ChatMsg::inbound(None, peer, "x", 2, None);
        list.insert_sorted(idless.clone());
        assert!(list.is_duplicate(&ChatMsg::inbound(None, peer, "other text", 2, None)));
        assert!(!list.is_duplicate(&ChatMsg::inbound(None, peer, "x", 3, None)));
        assert!(!list.is_duplicate(&ChatMsg::inbound(None, UserId::new(), "x", 2, None)));
    }

    #[test]
    fn oldest_pending_is_fifo() {
        let me = UserId::new();
        let mut list = MessageList::new();
        list.insert_sorted(ChatMsg::pending(me, "a", 100));
        list.insert_sorted(ChatMsg::pending(me, "b", 200));
        let idx = list.oldest_pending().unwrap();
        assert_eq!(list.as_slice()[idx].text, "a");
    }

    #[test]
    fn pending_near_respects_tolerance() {
        let me = UserId::new();
        let mut list = MessageList::new();
        list.insert_sorted(ChatMsg::pending(me, "a", 1_000));
        list.insert_sorted(ChatMsg::pending(me, "b", 9_000));
        assert_eq!(list.oldest_pending_near(1_400, 500), Some(0));
        assert_eq!(list.oldest_pending_near(8_000, 1_000), Some(1));
        assert_eq!(list.oldest_pending_near(5_000, 500), None);
    }

    #[test]
    fn pending_near_prefers_the_oldest_candidate() {
        let me = UserId::new();
        let mut list = MessageList::new();
        list.insert_sorted(ChatMsg::pending(me, "first", 1_000));
        list.insert_sorted(ChatMsg::pending(me, "second", 1_001));
        // The record is closer to the second send but belongs to the first.
        let idx = list.oldest_pending_near(1_002, 5_000).unwrap();
        assert_eq!(list.as_slice()[idx].text, "first");
    }

    #[test]
    fn tombstone_preserves_position() {
        let peer = UserId::new();
        let mut msg = inbound(peer, 7);
        msg.ct = Some("ct".into());
        tombstone(&mut msg, 99);
        assert_eq!(msg.text, TOMBSTONE_TEXT);
        assert_eq!(msg.ts, 7);
        assert!(msg.ct.is_none());
        assert_eq!(msg.deleted_at, Some(99));
        tombstone(&mut msg, 150);
        assert_eq!(msg.deleted_at, Some(99));
    }
}
