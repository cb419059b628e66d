//! Expected-reply bookkeeping.
//!
//! When a method call that wants a reply is delivered, a slot keyed by the
//! caller and the call's serial is stored in the callee's [`ReplyRegistry`],
//! and the caller records `(callee, serial)` in its [`ReplyOwner`]. A reply
//! from the callee consumes the slot; a reply without a slot is refused.

use std::collections::{BTreeSet, HashMap};

use crate::error::PeerError;
use crate::protocol::PeerId;

/// One reply a callee owes a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySlot {
    /// The peer waiting for the reply.
    pub caller: PeerId,
    /// Serial of the call, from the caller's numbering.
    pub serial: u32,
    /// The peer expected to reply.
    pub callee: PeerId,
}

/// Replies a peer owes, keyed by `(caller, serial)`.
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    slots: HashMap<(PeerId, u32), ReplySlot>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `callee` owes `caller` a reply to `serial`.
    pub fn insert(&mut self, caller: PeerId, serial: u32, callee: PeerId) -> Result<(), PeerError> {
        if self.slots.contains_key(&(caller, serial)) {
            return Err(PeerError::ExpectedReplyExists);
        }
        self.slots.insert(
            (caller, serial),
            ReplySlot {
                caller,
                serial,
                callee,
            },
        );
        Ok(())
    }

    /// Consume the slot for a reply to `caller`'s `serial`.
    pub fn remove(&mut self, caller: PeerId, serial: u32) -> Option<ReplySlot> {
        self.slots.remove(&(caller, serial))
    }

    pub fn contains(&self, caller: PeerId, serial: u32) -> bool {
        self.slots.contains_key(&(caller, serial))
    }

    /// Take every outstanding slot.
    pub fn drain(&mut self) -> Vec<ReplySlot> {
        let mut slots: Vec<_> = self.slots.drain().map(|(_, slot)| slot).collect();
        slots.sort_by_key(|s| (s.caller, s.serial));
        slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Replies a peer is waiting for, as `(callee, serial)`.
#[derive(Debug, Default)]
pub struct ReplyOwner {
    pending: BTreeSet<(PeerId, u32)>,
}

impl ReplyOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, callee: PeerId, serial: u32) {
        self.pending.insert((callee, serial));
    }

    pub fn remove(&mut self, callee: PeerId, serial: u32) -> bool {
        self.pending.remove(&(callee, serial))
    }

    pub fn drain(&mut self) -> Vec<(PeerId, u32)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_slot_consumed_once() {
        let mut replies = ReplyRegistry::new();
        replies.insert(1, 5, 2).unwrap();

        let slot = replies.remove(1, 5).unwrap();
        assert_eq!(slot.callee, 2);
        assert!(replies.remove(1, 5).is_none());
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let mut replies = ReplyRegistry::new();
        replies.insert(1, 5, 2).unwrap();
        assert_eq!(replies.insert(1, 5, 2), Err(PeerError::ExpectedReplyExists));
        // same serial from a different caller is independent
        replies.insert(3, 5, 2).unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[test]
    fn test_drain_is_ordered() {
        let mut replies = ReplyRegistry::new();
        replies.insert(4, 1, 9).unwrap();
        replies.insert(1, 7, 9).unwrap();
        replies.insert(1, 2, 9).unwrap();

        let drained: Vec<_> = replies.drain().iter().map(|s| (s.caller, s.serial)).collect();
        assert_eq!(drained, vec![(1, 2), (1, 7), (4, 1)]);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_reply_owner() {
        let mut owner = ReplyOwner::new();
        owner.insert(2, 5);
        owner.insert(3, 5);
        assert!(owner.remove(2, 5));
        assert!(!owner.remove(2, 5));
        assert_eq!(owner.drain(), vec![(3, 5)]);
    }
}
