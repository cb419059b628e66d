//! Well-known name ownership.
//!
//! Every well-known name with at least one claim has a queue: the primary
//! owner plus the peers waiting for it, in order. When the primary owner
//! goes away the first waiter is promoted. Each transition of the primary
//! owner is reported as a [`NameChange`] so the driver can emit
//! `NameOwnerChanged`, `NameAcquired` and `NameLost`.
//!
//! The per-peer side is [`NameOwner`], the set of names a peer holds a claim
//! on (as owner or waiter). The bus keeps both sides in sync.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::PeerError;
use crate::protocol::{request_name_flags, PeerId};

/// A transition of a name's primary owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub name: String,
    pub old_owner: Option<PeerId>,
    pub new_owner: Option<PeerId>,
}

/// One peer's claim on a name.
#[derive(Debug, Clone, Copy)]
struct Claim {
    peer: PeerId,
    flags: u32,
}

impl Claim {
    fn allows_replacement(&self) -> bool {
        self.flags & request_name_flags::ALLOW_REPLACEMENT != 0
    }

    fn wants_queue(&self) -> bool {
        self.flags & request_name_flags::DO_NOT_QUEUE == 0
    }
}

/// Queue for a single name, tracking ownership and waiters.
#[derive(Debug, Default)]
struct NameQueue {
    primary_owner: Option<Claim>,
    waiters: VecDeque<Claim>,
}

impl NameQueue {
    fn is_primary_owner(&self, peer: PeerId) -> bool {
        self.primary_owner.is_some_and(|c| c.peer == peer)
    }

    fn waiter_position(&self, peer: PeerId) -> Option<usize> {
        self.waiters.iter().position(|c| c.peer == peer)
    }

    fn is_empty(&self) -> bool {
        self.primary_owner.is_none() && self.waiters.is_empty()
    }

    /// Drop the primary owner and promote the next waiter.
    fn promote(&mut self, name: &str) -> NameChange {
        let old_owner = self.primary_owner.take().map(|c| c.peer);
        self.primary_owner = self.waiters.pop_front();
        NameChange {
            name: name.to_string(),
            old_owner,
            new_owner: self.primary_owner.map(|c| c.peer),
        }
    }
}

/// Bus-wide index of name queues.
#[derive(Debug, Default)]
pub struct NameRegistry {
    queues: BTreeMap<String, NameQueue>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `name` for `peer`.
    ///
    /// Returns the ownership change when `peer` became primary owner.
    /// `NameAlreadyOwner`, `NameInQueue` and `NameExists` report the other
    /// outcomes. A replaced owner is queued at the front, or dropped if it
    /// asked not to be queued.
    pub fn request(&mut self, name: &str, peer: PeerId, flags: u32) -> Result<NameChange, PeerError> {
        let queue = self.queues.entry(name.to_string()).or_default();
        let claim = Claim { peer, flags };
        let replace_existing = flags & request_name_flags::REPLACE_EXISTING != 0;

        let Some(current) = queue.primary_owner else {
            queue.primary_owner = Some(claim);
            return Ok(NameChange {
                name: name.to_string(),
                old_owner: None,
                new_owner: Some(peer),
            });
        };
        if current.peer == peer {
            queue.primary_owner = Some(claim);
            return Err(PeerError::NameAlreadyOwner);
        }

        let queued_at = queue.waiter_position(peer);

        if replace_existing && current.allows_replacement() {
            if let Some(pos) = queued_at {
                queue.waiters.remove(pos);
            }
            if current.wants_queue() {
                queue.waiters.push_front(current);
            }
            queue.primary_owner = Some(claim);
            return Ok(NameChange {
                name: name.to_string(),
                old_owner: Some(current.peer),
                new_owner: Some(peer),
            });
        }

        if !claim.wants_queue() {
            if let Some(pos) = queued_at {
                queue.waiters.remove(pos);
            }
            return Err(PeerError::NameExists);
        }

        match queued_at {
            Some(pos) => queue.waiters[pos] = claim,
            None => queue.waiters.push_back(claim),
        }
        Err(PeerError::NameInQueue)
    }

    /// Release `peer`'s claim on `name`.
    ///
    /// Fails with `NameNotFound` if nobody claims the name and `NameNotOwner`
    /// if `peer` is not among the claimants.
    pub fn release(&mut self, name: &str, peer: PeerId) -> Result<Option<NameChange>, PeerError> {
        let queue = self.queues.get(name).ok_or(PeerError::NameNotFound)?;
        if !queue.is_primary_owner(peer) && queue.waiter_position(peer).is_none() {
            return Err(PeerError::NameNotOwner);
        }
        Ok(self.release_ownership(name, peer))
    }

    /// Remove `peer`'s claim on `name`, whatever it is.
    ///
    /// Returns the ownership change if `peer` was the primary owner.
    pub fn release_ownership(&mut self, name: &str, peer: PeerId) -> Option<NameChange> {
        let queue = self.queues.get_mut(name)?;

        let change = if queue.is_primary_owner(peer) {
            Some(queue.promote(name))
        } else {
            if let Some(pos) = queue.waiter_position(peer) {
                queue.waiters.remove(pos);
            }
            None
        };

        if queue.is_empty() {
            self.queues.remove(name);
        }
        change
    }

    pub fn primary_owner(&self, name: &str) -> Option<PeerId> {
        self.queues.get(name)?.primary_owner.map(|c| c.peer)
    }

    /// Owner first, then waiters in order.
    pub fn list_queued_owners(&self, name: &str) -> Vec<PeerId> {
        let Some(queue) = self.queues.get(name) else {
            return Vec::new();
        };
        queue
            .primary_owner
            .iter()
            .chain(queue.waiters.iter())
            .map(|c| c.peer)
            .collect()
    }

    /// Whether `peer` holds any claim on `name`.
    pub fn has_claim(&self, name: &str, peer: PeerId) -> bool {
        self.queues
            .get(name)
            .is_some_and(|q| q.is_primary_owner(peer) || q.waiter_position(peer).is_some())
    }

    /// Names that currently have a primary owner.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.queues
            .iter()
            .filter(|(_, q)| q.primary_owner.is_some())
            .map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// The names one peer holds a claim on.
#[derive(Debug, Default)]
pub struct NameOwner {
    names: BTreeSet<String>,
}

impl NameOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.names).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request_name_flags::{ALLOW_REPLACEMENT, DO_NOT_QUEUE, REPLACE_EXISTING};

    const NAME: &str = "org.example.Test";

    #[test]
    fn test_first_request_becomes_owner() {
        let mut names = NameRegistry::new();
        let change = names.request(NAME, 1, 0).unwrap();
        assert_eq!(change.old_owner, None);
        assert_eq!(change.new_owner, Some(1));
        assert_eq!(names.primary_owner(NAME), Some(1));
    }

    #[test]
    fn test_already_owner() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        assert_eq!(names.request(NAME, 1, 0), Err(PeerError::NameAlreadyOwner));
        assert_eq!(names.list_queued_owners(NAME), vec![1]);
    }

    #[test]
    fn test_queue_and_exists() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        assert_eq!(names.request(NAME, 2, 0), Err(PeerError::NameInQueue));
        assert_eq!(names.request(NAME, 3, DO_NOT_QUEUE), Err(PeerError::NameExists));
        assert_eq!(names.list_queued_owners(NAME), vec![1, 2]);
        assert!(!names.has_claim(NAME, 3));
    }

    #[test]
    fn test_queued_peer_leaves_queue_with_do_not_queue() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        names.request(NAME, 2, 0).unwrap_err();
        assert_eq!(names.request(NAME, 2, DO_NOT_QUEUE), Err(PeerError::NameExists));
        assert_eq!(names.list_queued_owners(NAME), vec![1]);
    }

    #[test]
    fn test_replacement_queues_old_owner_first() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, ALLOW_REPLACEMENT).unwrap();
        names.request(NAME, 2, 0).unwrap_err();

        let change = names.request(NAME, 3, REPLACE_EXISTING).unwrap();
        assert_eq!(change.old_owner, Some(1));
        assert_eq!(change.new_owner, Some(3));
        assert_eq!(names.list_queued_owners(NAME), vec![3, 1, 2]);
    }

    #[test]
    fn test_replacement_drops_owner_that_refused_queueing() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, ALLOW_REPLACEMENT | DO_NOT_QUEUE).unwrap();
        names.request(NAME, 2, REPLACE_EXISTING).unwrap();
        assert_eq!(names.list_queued_owners(NAME), vec![2]);
        assert!(!names.has_claim(NAME, 1));
    }

    #[test]
    fn test_replacement_refused_without_allow() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        assert_eq!(
            names.request(NAME, 2, REPLACE_EXISTING | DO_NOT_QUEUE),
            Err(PeerError::NameExists)
        );
        assert_eq!(names.primary_owner(NAME), Some(1));
    }

    #[test]
    fn test_release_promotes_waiter() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        names.request(NAME, 2, 0).unwrap_err();

        let change = names.release(NAME, 1).unwrap().unwrap();
        assert_eq!(change.old_owner, Some(1));
        assert_eq!(change.new_owner, Some(2));
        assert_eq!(names.primary_owner(NAME), Some(2));
    }

    #[test]
    fn test_release_errors() {
        let mut names = NameRegistry::new();
        assert_eq!(names.release(NAME, 1), Err(PeerError::NameNotFound));
        names.request(NAME, 1, 0).unwrap();
        assert_eq!(names.release(NAME, 2), Err(PeerError::NameNotOwner));
    }

    #[test]
    fn test_release_waiter_has_no_change() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        names.request(NAME, 2, 0).unwrap_err();
        assert_eq!(names.release(NAME, 2), Ok(None));
        assert_eq!(names.list_queued_owners(NAME), vec![1]);
    }

    #[test]
    fn test_last_release_removes_name() {
        let mut names = NameRegistry::new();
        names.request(NAME, 1, 0).unwrap();
        let change = names.release_ownership(NAME, 1).unwrap();
        assert_eq!(change.new_owner, None);
        assert!(names.is_empty());
        assert_eq!(names.names().count(), 0);
    }
}
