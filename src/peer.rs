//! Connected peers.
//!
//! A [`Peer`] is one authenticated connection together with everything it
//! holds on the bus: name claims, installed match rules, replies it owes and
//! replies it waits for, and its quota charges. The [`PeerRegistry`] owns
//! every peer and assigns identities.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PeerError;
use crate::match_rules::{MatchOwner, MatchRegistry};
use crate::message::Message;
use crate::name_registry::NameOwner;
use crate::policy::PeerPolicy;
use crate::protocol::{unique_name_from_id, PeerId};
use crate::reply::{ReplyOwner, ReplyRegistry};
use crate::user::UserCharge;

/// Credentials read from the socket at accept time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub pid: Option<u32>,
    pub seclabel: Option<String>,
}

/// Outgoing side of a peer's connection.
///
/// Messages are queued on a bounded channel drained by the peer's writer
/// task. A full queue is reported as a quota error, a closed one as a
/// refused connection.
#[derive(Debug, Clone)]
pub struct Connection {
    tx: mpsc::Sender<Arc<Message>>,
    unix_fd: bool,
}

impl Connection {
    /// Create a connection handle and the receiver its writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, unix_fd: false }, rx)
    }

    /// Record whether descriptor passing was negotiated.
    pub fn with_unix_fd(mut self, unix_fd: bool) -> Self {
        self.unix_fd = unix_fd;
        self
    }

    pub fn unix_fd(&self) -> bool {
        self.unix_fd
    }

    /// Enqueue a message without waiting.
    pub fn queue(&self, message: Arc<Message>) -> Result<(), PeerError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::Quota,
            mpsc::error::TrySendError::Closed(_) => PeerError::ConnectionRefused,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One connection's bus state.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub uid: u32,
    pub pid: Option<u32>,
    pub seclabel: Option<String>,
    pub charges: UserCharge,
    pub connection: Connection,
    pub policy: PeerPolicy,
    registered: bool,
    monitor: bool,
    /// Well-known names this peer claims (owned or queued).
    pub owned_names: NameOwner,
    /// Rules of other peers that name this peer as sender.
    pub matches: MatchRegistry,
    /// Rules this peer installed.
    pub owned_matches: MatchOwner,
    /// Replies this peer owes, keyed by caller and serial.
    pub replies_outgoing: ReplyRegistry,
    /// Replies this peer is waiting for.
    pub owned_replies: ReplyOwner,
}

impl Peer {
    pub fn new(id: PeerId, credentials: PeerCredentials, connection: Connection, policy: PeerPolicy) -> Self {
        Self {
            id,
            uid: credentials.uid,
            pid: credentials.pid,
            seclabel: credentials.seclabel,
            charges: UserCharge::default(),
            connection,
            policy,
            registered: false,
            monitor: false,
            owned_names: NameOwner::new(),
            matches: MatchRegistry::new(),
            owned_matches: MatchOwner::new(),
            replies_outgoing: ReplyRegistry::new(),
            owned_replies: ReplyOwner::new(),
        }
    }

    pub fn unique_name(&self) -> String {
        unique_name_from_id(self.id)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor
    }

    pub(crate) fn set_registered(&mut self) {
        self.registered = true;
    }

    pub(crate) fn set_monitor(&mut self) {
        self.monitor = true;
    }

    /// Root and the user the bus runs as.
    pub fn is_privileged(&self, bus_uid: u32) -> bool {
        self.uid == 0 || self.uid == bus_uid
    }
}

/// Every connected peer, by identity.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    next_id: PeerId,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Hand out the next identity. Identities are never reused.
    pub fn allocate_id(&mut self) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, peer: Peer) {
        trace!(peer_id = peer.id, "Peer inserted");
        self.peers.insert(peer.id, peer);
    }

    pub fn find(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn find_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    fn signal() -> Arc<Message> {
        Arc::new(
            MessageBuilder::signal("/org/example", "org.example.Iface", "Changed")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut registry = PeerRegistry::new();
        let a = registry.allocate_id();
        let (conn, _rx) = Connection::channel(4);
        registry.insert(Peer::new(a, PeerCredentials::default(), conn, PeerPolicy::allow_all()));
        registry.remove(a);
        let b = registry.allocate_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(registry.find(a).is_none());
    }

    #[test]
    fn test_connection_full_is_quota() {
        let (conn, _rx) = Connection::channel(1);
        conn.queue(signal()).unwrap();
        assert_eq!(conn.queue(signal()), Err(PeerError::Quota));
    }

    #[test]
    fn test_connection_closed_is_refused() {
        let (conn, rx) = Connection::channel(1);
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.queue(signal()), Err(PeerError::ConnectionRefused));
    }

    #[test]
    fn test_peer_state() {
        let (conn, _rx) = Connection::channel(1);
        let creds = PeerCredentials {
            uid: 1000,
            pid: Some(42),
            seclabel: None,
        };
        let mut peer = Peer::new(7, creds, conn, PeerPolicy::allow_all());
        assert_eq!(peer.unique_name(), ":1.7");
        assert!(!peer.is_registered());
        peer.set_registered();
        assert!(peer.is_registered());
        assert!(peer.is_privileged(1000));
        assert!(!peer.is_privileged(0));
    }
}
