//! The routing context.
//!
//! [`Bus`] owns every registry: peers, names, match rules and quotas. All
//! routing runs on one control flow that holds the bus exclusively, so no
//! operation can observe a half-torn-down peer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::PeerError;
use crate::match_rules::{MatchFilter, MatchIndex, MatchRegistry, MatchRule, MatchStore};
use crate::message::{Message, MessageMetadata};
use crate::name_registry::{NameChange, NameRegistry};
use crate::peer::{Connection, Peer, PeerCredentials, PeerRegistry};
use crate::policy::PolicyRegistry;
use crate::protocol::{
    flags, unique_name_to_id, MessageType, PeerId, DBUS_NAME, MESSAGE_SIZE_MAX,
};
use crate::reply::ReplySlot;
use crate::user::{Slot, UserLimits, UserRegistry};

/// Bus-wide settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub limits: UserLimits,
    /// Depth of each peer's outgoing queue.
    pub max_queue: usize,
    /// Largest declared message size accepted from a peer.
    pub max_message_size: u64,
    pub policy: PolicyRegistry,
    /// Server GUID, sent hex-encoded during the handshake.
    pub guid: [u8; 16],
    /// The user the bus runs as.
    pub uid: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            limits: UserLimits::default(),
            max_queue: 256,
            max_message_size: MESSAGE_SIZE_MAX,
            policy: PolicyRegistry::new(),
            guid: crate::auth::generate_guid(),
            uid: nix::unistd::getuid().as_raw(),
        }
    }
}

/// Who a message originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Driver,
    Peer(PeerId),
}

/// What a disconnect released.
#[derive(Debug, Default)]
pub struct Teardown {
    pub unique_name: String,
    /// Ownership transitions of names the peer held.
    pub name_changes: Vec<NameChange>,
    /// Calls other peers are still waiting on this peer to answer.
    pub orphaned_calls: Vec<ReplySlot>,
    pub was_registered: bool,
    pub was_monitor: bool,
}

/// The routing context of one bus.
#[derive(Debug)]
pub struct Bus {
    config: BusConfig,
    peers: PeerRegistry,
    names: NameRegistry,
    matches: MatchStore,
    wildcard_matches: MatchRegistry,
    driver_matches: MatchRegistry,
    monitor_matches: MatchRegistry,
    name_matches: BTreeMap<String, MatchRegistry>,
    users: UserRegistry,
}

impl Bus {
    pub fn new(config: BusConfig) -> Self {
        let users = UserRegistry::new(config.limits);
        Self {
            config,
            peers: PeerRegistry::new(),
            names: NameRegistry::new(),
            matches: MatchStore::new(),
            wildcard_matches: MatchRegistry::new(),
            driver_matches: MatchRegistry::new(),
            monitor_matches: MatchRegistry::new(),
            name_matches: BTreeMap::new(),
            users,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn guid(&self) -> &[u8; 16] {
        &self.config.guid
    }

    pub fn uid(&self) -> u32 {
        self.config.uid
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    /// Number of distinct installed rules.
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// Add a freshly authenticated connection.
    pub fn connect(&mut self, credentials: PeerCredentials, connection: Connection) -> PeerId {
        let id = self.peers.allocate_id();
        let policy = self.config.policy.instantiate(credentials.uid);
        info!(peer_id = id, uid = credentials.uid, pid = ?credentials.pid, "Peer connected");
        self.peers.insert(Peer::new(id, credentials, connection, policy));
        id
    }

    /// Mark a peer registered. Returns false if it already was.
    pub fn register(&mut self, peer_id: PeerId) -> bool {
        match self.peers.find_mut(peer_id) {
            Some(peer) if !peer.is_registered() => {
                peer.set_registered();
                true
            }
            _ => false,
        }
    }

    /// Resolve a bus name to the peer it currently addresses.
    pub fn resolve(&self, name: &str) -> Option<PeerId> {
        if name.starts_with(':') {
            let id = unique_name_to_id(name)?;
            return self
                .peers
                .find(id)
                .filter(|p| p.is_registered())
                .map(|p| p.id);
        }
        self.names.primary_owner(name)
    }

    /// Well-known names `peer_id` is primary owner of.
    pub fn peer_names(&self, peer_id: PeerId) -> Vec<String> {
        let Some(peer) = self.peers.find(peer_id) else {
            return Vec::new();
        };
        peer.owned_names
            .iter()
            .filter(|name| self.names.primary_owner(name) == Some(peer_id))
            .map(String::from)
            .collect()
    }

    // --- names ---

    fn check_ownable(name: &str) -> Result<(), PeerError> {
        if name.starts_with(':') {
            return Err(PeerError::NameUnique);
        }
        if name == DBUS_NAME {
            return Err(PeerError::NameReserved);
        }
        Ok(())
    }

    /// Bring a peer's claim set and quota in line with the name registry.
    fn sync_claim(&mut self, peer_id: PeerId, name: &str) {
        let has_claim = self.names.has_claim(name, peer_id);
        let Some(peer) = self.peers.find_mut(peer_id) else {
            return;
        };
        if has_claim {
            peer.owned_names.insert(name);
        } else if peer.owned_names.remove(name) {
            self.users.discharge(peer.uid, &mut peer.charges, Slot::Names, 1);
        }
    }

    /// Claim or queue for `name`.
    ///
    /// `Ok` means `peer_id` became primary owner; the other outcomes are
    /// reported as errors, see [`NameRegistry::request`].
    pub fn request_name(&mut self, peer_id: PeerId, name: &str, flags: u32) -> Result<NameChange, PeerError> {
        Self::check_ownable(name)?;
        let peer = self
            .peers
            .find_mut(peer_id)
            .ok_or(PeerError::ConnectionRefused)?;
        peer.policy.check_own(name)?;

        if !self.names.has_claim(name, peer_id) {
            self.users.charge(peer.uid, &mut peer.charges, Slot::Names, 1)?;
            peer.owned_names.insert(name);
        }

        let result = self.names.request(name, peer_id, flags);
        self.sync_claim(peer_id, name);
        if let Ok(NameChange {
            old_owner: Some(old_owner),
            ..
        }) = &result
        {
            self.sync_claim(*old_owner, name);
        }

        match &result {
            Ok(change) => debug!(peer_id = peer_id, name = %name, old_owner = ?change.old_owner,
                                 "Name acquired"),
            Err(e) => debug!(peer_id = peer_id, name = %name, result = %e, "Name not acquired"),
        }
        result
    }

    /// Drop `peer_id`'s claim on `name`.
    pub fn release_name(&mut self, peer_id: PeerId, name: &str) -> Result<Option<NameChange>, PeerError> {
        Self::check_ownable(name)?;
        let change = self.names.release(name, peer_id)?;
        self.sync_claim(peer_id, name);
        debug!(peer_id = peer_id, name = %name, new_owner = ?change.as_ref().and_then(|c| c.new_owner),
               "Name released");
        Ok(change)
    }

    /// Drop whatever claim `peer_id` has on `name`, without checks.
    pub fn release_name_ownership(&mut self, peer_id: PeerId, name: &str) -> Option<NameChange> {
        let change = self.names.release_ownership(name, peer_id);
        self.sync_claim(peer_id, name);
        change
    }

    fn release_all_names(&mut self, peer_id: PeerId) -> Vec<NameChange> {
        let Some(peer) = self.peers.find(peer_id) else {
            return Vec::new();
        };
        let names: Vec<String> = peer.owned_names.iter().map(String::from).collect();
        names
            .iter()
            .filter_map(|name| self.release_name_ownership(peer_id, name))
            .collect()
    }

    // --- matches ---

    fn match_index(&self, rule: &MatchRule, monitor: bool) -> MatchIndex {
        if monitor {
            return MatchIndex::Monitor;
        }
        match rule.sender.as_deref() {
            None => MatchIndex::Wildcard,
            Some(DBUS_NAME) => MatchIndex::Driver,
            Some(sender) if sender.starts_with(':') => match unique_name_to_id(sender) {
                Some(id) if self.peers.contains(id) => MatchIndex::Peer(id),
                _ => MatchIndex::Detached,
            },
            Some(sender) => MatchIndex::Name(sender.to_string()),
        }
    }

    fn link_match(&mut self, id: u64, index: &MatchIndex) {
        match index {
            MatchIndex::Wildcard => self.wildcard_matches.link(id),
            MatchIndex::Driver => self.driver_matches.link(id),
            MatchIndex::Monitor => self.monitor_matches.link(id),
            MatchIndex::Peer(peer_id) => {
                if let Some(peer) = self.peers.find_mut(*peer_id) {
                    peer.matches.link(id);
                }
            }
            MatchIndex::Name(name) => self.name_matches.entry(name.clone()).or_default().link(id),
            MatchIndex::Detached => {}
        }
    }

    fn unlink_match(&mut self, id: u64, index: &MatchIndex) {
        match index {
            MatchIndex::Wildcard => {
                self.wildcard_matches.unlink(id);
            }
            MatchIndex::Driver => {
                self.driver_matches.unlink(id);
            }
            MatchIndex::Monitor => {
                self.monitor_matches.unlink(id);
            }
            MatchIndex::Peer(peer_id) => {
                if let Some(peer) = self.peers.find_mut(*peer_id) {
                    peer.matches.unlink(id);
                }
            }
            MatchIndex::Name(name) => {
                if let Some(registry) = self.name_matches.get_mut(name) {
                    registry.unlink(id);
                    if registry.is_empty() {
                        self.name_matches.remove(name);
                    }
                }
            }
            MatchIndex::Detached => {}
        }
    }

    /// Install a match rule for `peer_id`.
    ///
    /// `eavesdrop='true'` is only honored for monitors or when forced.
    pub fn add_match(&mut self, peer_id: PeerId, rule: &str, force_eavesdrop: bool) -> Result<(), PeerError> {
        let rule = MatchRule::parse(rule).map_err(|e| {
            debug!(peer_id = peer_id, rule = %rule, error = %e, "Invalid match rule");
            PeerError::MatchInvalid
        })?;

        let peer = self
            .peers
            .find_mut(peer_id)
            .ok_or(PeerError::ConnectionRefused)?;
        let monitor = peer.is_monitor();
        let existing = peer.owned_matches.find(&rule);
        self.users.charge(peer.uid, &mut peer.charges, Slot::Matches, 1)?;
        if let Some(id) = existing {
            self.matches.acquire(id);
            trace!(peer_id = peer_id, rule = %rule, "Match rule reference added");
            return Ok(());
        }

        let index = self.match_index(&rule, monitor);
        let eavesdrop = rule.eavesdrop && (monitor || force_eavesdrop);
        let id = self.matches.insert(peer_id, rule.clone(), index.clone(), eavesdrop);
        if let Some(peer) = self.peers.find_mut(peer_id) {
            peer.owned_matches.insert(&rule, id);
        }
        self.link_match(id, &index);
        debug!(peer_id = peer_id, rule = %rule, index = ?index, "Match rule added");
        Ok(())
    }

    /// Drop one reference to an identical rule installed by `peer_id`.
    pub fn remove_match(&mut self, peer_id: PeerId, rule: &str) -> Result<(), PeerError> {
        let rule = MatchRule::parse(rule).map_err(|_| PeerError::MatchInvalid)?;
        let peer = self
            .peers
            .find_mut(peer_id)
            .ok_or(PeerError::ConnectionRefused)?;
        let id = peer
            .owned_matches
            .find(&rule)
            .ok_or(PeerError::MatchNotFound)?;
        self.users.discharge(peer.uid, &mut peer.charges, Slot::Matches, 1);

        if let Some(entry) = self.matches.release(id) {
            peer.owned_matches.remove(&rule);
            self.unlink_match(id, &entry.index);
            debug!(peer_id = peer_id, rule = %rule, "Match rule removed");
        }
        Ok(())
    }

    /// Remove every rule `peer_id` installed.
    pub fn flush_matches(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.find_mut(peer_id) else {
            return;
        };
        let ids = peer.owned_matches.drain();
        let charged = peer.charges.amount(Slot::Matches);
        self.users.discharge(peer.uid, &mut peer.charges, Slot::Matches, charged);

        for id in ids {
            if let Some(entry) = self.matches.remove(id) {
                self.unlink_match(id, &entry.index);
            }
        }
    }

    /// Turn `peer_id` into a monitor with the given rules.
    ///
    /// All rules are validated before anything changes. The peer's names
    /// are released and its rules replaced; an empty list monitors all
    /// traffic.
    pub fn become_monitor(&mut self, peer_id: PeerId, rules: &[String]) -> Result<Vec<NameChange>, PeerError> {
        let parsed = if rules.is_empty() {
            vec![MatchRule::default()]
        } else {
            rules
                .iter()
                .map(|r| MatchRule::parse(r).map_err(|_| PeerError::MatchInvalid))
                .collect::<Result<Vec<_>, _>>()?
        };
        if !self.peers.contains(peer_id) {
            return Err(PeerError::ConnectionRefused);
        }

        let changes = self.release_all_names(peer_id);
        self.flush_matches(peer_id);

        for rule in parsed {
            let Some(peer) = self.peers.find_mut(peer_id) else {
                break;
            };
            peer.set_monitor();
            if let Some(id) = peer.owned_matches.find(&rule) {
                self.matches.acquire(id);
                continue;
            }
            let id = self
                .matches
                .insert(peer_id, rule.clone(), MatchIndex::Monitor, true);
            peer.owned_matches.insert(&rule, id);
            self.monitor_matches.link(id);
        }

        info!(peer_id = peer_id, n_rules = rules.len(), "Peer became monitor");
        Ok(changes)
    }

    // --- delivery ---

    fn filter<'a>(
        metadata: &'a MessageMetadata,
        sender: Option<PeerId>,
        sender_names: &'a [String],
        destination: Option<PeerId>,
    ) -> MatchFilter<'a> {
        let fields = &metadata.fields;
        MatchFilter {
            msg_type: metadata.header.msg_type,
            sender,
            sender_names,
            destination,
            destination_name: fields.destination.as_deref(),
            interface: fields.interface.as_deref(),
            member: fields.member.as_deref(),
            path: fields.path.as_deref(),
            args: &metadata.args,
        }
    }

    /// Owners of rules matching `filter`, split into regular subscribers
    /// and monitors. With `eavesdrop_only` only eavesdropping rules count.
    fn collect_subscribers(
        &self,
        origin: Origin,
        filter: &MatchFilter<'_>,
        eavesdrop_only: bool,
    ) -> (BTreeSet<PeerId>, BTreeSet<PeerId>) {
        let mut monitors = BTreeSet::new();
        for id in self.monitor_matches.iter() {
            if let Some(entry) = self.matches.get(id) {
                if entry.rule.matches(filter) {
                    monitors.insert(entry.owner);
                }
            }
        }

        let mut registries: Vec<&MatchRegistry> = vec![&self.wildcard_matches];
        match origin {
            Origin::Driver => registries.push(&self.driver_matches),
            Origin::Peer(id) => {
                if let Some(peer) = self.peers.find(id) {
                    registries.push(&peer.matches);
                }
                for name in filter.sender_names {
                    if let Some(registry) = self.name_matches.get(name) {
                        registries.push(registry);
                    }
                }
            }
        }

        let mut subscribers = BTreeSet::new();
        for id in registries.into_iter().flat_map(|r| r.iter()) {
            let Some(entry) = self.matches.get(id) else {
                continue;
            };
            if eavesdrop_only && !entry.eavesdrop {
                continue;
            }
            if entry.rule.matches(filter) {
                subscribers.insert(entry.owner);
            }
        }
        (subscribers, monitors)
    }

    fn check_delivery(
        &self,
        origin: Origin,
        sender_names: &[String],
        receiver_id: PeerId,
        metadata: &MessageMetadata,
    ) -> Result<(), PeerError> {
        let Origin::Peer(sender_id) = origin else {
            return Ok(());
        };
        let sender = self.peers.find(sender_id).ok_or(PeerError::ConnectionRefused)?;
        let receiver = self.peers.find(receiver_id).ok_or(PeerError::ConnectionRefused)?;
        sender
            .policy
            .check_send(&self.peer_names(receiver_id), metadata)?;
        receiver.policy.check_receive(sender_names, metadata)
    }

    fn deliver(&self, receiver_id: PeerId, message: &Arc<Message>) -> Result<(), PeerError> {
        let receiver = self
            .peers
            .find(receiver_id)
            .ok_or(PeerError::ConnectionRefused)?;
        receiver.connection.queue(Arc::clone(message))
    }

    fn deliver_all(
        &self,
        origin: Origin,
        sender_names: &[String],
        subscribers: BTreeSet<PeerId>,
        monitors: BTreeSet<PeerId>,
        message: &Arc<Message>,
    ) -> usize {
        let metadata = message.metadata();
        let mut delivered = 0;
        for receiver_id in subscribers {
            let result = self
                .check_delivery(origin, sender_names, receiver_id, metadata)
                .and_then(|()| self.deliver(receiver_id, message));
            match result {
                Ok(()) => delivered += 1,
                Err(e) => debug!(receiver = receiver_id, error = %e, "Dropped broadcast delivery"),
            }
        }
        for monitor_id in monitors {
            match self.deliver(monitor_id, message) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(monitor = monitor_id, error = %e, "Dropped monitor delivery"),
            }
        }
        delivered
    }

    /// Deliver a message without destination to every matching subscriber.
    ///
    /// Returns how many peers received it; zero is not an error.
    pub fn broadcast(&self, origin: Origin, message: &Arc<Message>) -> usize {
        let metadata = message.metadata();
        let (sender_id, sender_names) = match origin {
            Origin::Driver => (None, Vec::new()),
            Origin::Peer(id) => (Some(id), self.peer_names(id)),
        };
        let filter = Self::filter(metadata, sender_id, &sender_names, None);
        let (subscribers, monitors) = self.collect_subscribers(origin, &filter, false);
        let delivered = self.deliver_all(origin, &sender_names, subscribers, monitors, message);
        trace!(origin = ?origin, member = ?metadata.fields.member, delivered = delivered, "Broadcast");
        delivered
    }

    /// Show a unicast message to monitors and eavesdroppers.
    ///
    /// `destination` already received the message and is skipped.
    pub fn eavesdrop(&self, origin: Origin, destination: Option<PeerId>, message: &Arc<Message>) -> usize {
        let metadata = message.metadata();
        let (sender_id, sender_names) = match origin {
            Origin::Driver => (None, Vec::new()),
            Origin::Peer(id) => (Some(id), self.peer_names(id)),
        };
        let filter = Self::filter(metadata, sender_id, &sender_names, destination);
        let (mut subscribers, mut monitors) = self.collect_subscribers(origin, &filter, true);
        if let Some(destination) = destination {
            subscribers.remove(&destination);
            monitors.remove(&destination);
        }
        self.deliver_all(origin, &sender_names, subscribers, monitors, message)
    }

    /// Deliver a unicast message from one peer to another.
    ///
    /// Method calls that expect a reply leave a reply slot on the receiver
    /// and charge the sender's reply quota.
    pub fn queue_call(&mut self, sender_id: PeerId, receiver_id: PeerId, message: &Arc<Message>) -> Result<(), PeerError> {
        let metadata = message.metadata();
        let sender_names = self.peer_names(sender_id);
        self.check_delivery(Origin::Peer(sender_id), &sender_names, receiver_id, metadata)?;

        let serial = metadata.header.serial;
        let expects_reply = metadata.header.msg_type == MessageType::MethodCall as u8
            && metadata.header.flags & flags::NO_REPLY_EXPECTED == 0;

        if expects_reply {
            let sender = self
                .peers
                .find_mut(sender_id)
                .ok_or(PeerError::ConnectionRefused)?;
            self.users.charge(sender.uid, &mut sender.charges, Slot::Replies, 1)?;

            let inserted = match self.peers.find_mut(receiver_id) {
                Some(receiver) => receiver.replies_outgoing.insert(sender_id, serial, receiver_id),
                None => Err(PeerError::ConnectionRefused),
            };
            if let Err(e) = inserted {
                self.discharge_reply(sender_id);
                return Err(e);
            }
            if let Some(sender) = self.peers.find_mut(sender_id) {
                sender.owned_replies.insert(receiver_id, serial);
            }
        }

        if let Err(e) = self.deliver(receiver_id, message) {
            if expects_reply {
                if let Some(receiver) = self.peers.find_mut(receiver_id) {
                    receiver.replies_outgoing.remove(sender_id, serial);
                }
                if let Some(sender) = self.peers.find_mut(sender_id) {
                    sender.owned_replies.remove(receiver_id, serial);
                }
                self.discharge_reply(sender_id);
            }
            return Err(e);
        }

        trace!(sender = sender_id, receiver = receiver_id, serial = serial, "Queued call");
        self.eavesdrop(Origin::Peer(sender_id), Some(receiver_id), message);
        Ok(())
    }

    fn discharge_reply(&mut self, caller_id: PeerId) {
        if let Some(caller) = self.peers.find_mut(caller_id) {
            self.users.discharge(caller.uid, &mut caller.charges, Slot::Replies, 1);
        }
    }

    /// Deliver a reply, consuming the slot left by the matching call.
    ///
    /// Fails with `UnexpectedReply` if `sender_id` owes `destination` no
    /// reply to `reply_serial`.
    pub fn queue_reply(
        &mut self,
        sender_id: PeerId,
        destination: &str,
        reply_serial: u32,
        message: &Arc<Message>,
    ) -> Result<(), PeerError> {
        let caller_id = unique_name_to_id(destination)
            .or_else(|| self.names.primary_owner(destination))
            .ok_or(PeerError::UnexpectedReply)?;

        let sender = self
            .peers
            .find_mut(sender_id)
            .ok_or(PeerError::ConnectionRefused)?;
        let slot = sender
            .replies_outgoing
            .remove(caller_id, reply_serial)
            .ok_or(PeerError::UnexpectedReply)?;

        let caller = self
            .peers
            .find_mut(slot.caller)
            .ok_or(PeerError::ConnectionRefused)?;
        caller.owned_replies.remove(sender_id, reply_serial);
        self.users.discharge(caller.uid, &mut caller.charges, Slot::Replies, 1);

        self.deliver(caller_id, message)?;
        trace!(sender = sender_id, receiver = caller_id, reply_serial = reply_serial, "Queued reply");
        self.eavesdrop(Origin::Peer(sender_id), Some(caller_id), message);
        Ok(())
    }

    /// Deliver a driver-originated unicast message.
    pub fn send_from_driver(&self, receiver_id: PeerId, message: &Arc<Message>) -> Result<(), PeerError> {
        self.deliver(receiver_id, message)?;
        self.eavesdrop(Origin::Driver, Some(receiver_id), message);
        Ok(())
    }

    // --- teardown ---

    /// Remove a peer and release everything it holds.
    pub fn disconnect(&mut self, peer_id: PeerId) -> Option<Teardown> {
        let peer = self.peers.find(peer_id)?;
        let mut teardown = Teardown {
            unique_name: peer.unique_name(),
            was_registered: peer.is_registered(),
            was_monitor: peer.is_monitor(),
            ..Default::default()
        };

        teardown.name_changes = self.release_all_names(peer_id);
        self.flush_matches(peer_id);

        let peer = self.peers.find_mut(peer_id)?;
        let detached = peer.matches.drain();
        let owed = peer.replies_outgoing.drain();
        let waiting = peer.owned_replies.drain();

        for id in detached {
            if let Some(entry) = self.matches.get_mut(id) {
                entry.index = MatchIndex::Detached;
            }
        }
        for slot in &owed {
            if let Some(caller) = self.peers.find_mut(slot.caller) {
                caller.owned_replies.remove(peer_id, slot.serial);
            }
            self.discharge_reply(slot.caller);
        }
        for (callee, serial) in waiting {
            if let Some(callee) = self.peers.find_mut(callee) {
                callee.replies_outgoing.remove(peer_id, serial);
            }
        }

        if let Some(mut peer) = self.peers.remove(peer_id) {
            self.users.discharge_all(peer.uid, &mut peer.charges);
        }
        teardown.orphaned_calls = owed.into_iter().filter(|s| s.caller != peer_id).collect();

        info!(peer_id = peer_id, n_names = teardown.name_changes.len(),
              n_orphaned = teardown.orphaned_calls.len(), "Peer disconnected");
        Some(teardown)
    }

    /// Disconnect every peer.
    pub fn flush_peers(&mut self) -> usize {
        let ids = self.peers.ids();
        let n = ids.len();
        for id in ids {
            self.disconnect(id);
        }
        n
    }
}
