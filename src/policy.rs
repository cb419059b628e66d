//! Access policy for name ownership and message delivery.
//!
//! A [`PolicyRegistry`] holds the bus-wide rule set. Each peer gets a
//! [`PeerPolicy`] at connect time, instantiated for its uid, which the
//! routing code consults as a synchronous predicate. Rules are evaluated in
//! order and the last matching rule decides; with no match, access is
//! allowed.

use crate::error::PeerError;
use crate::message::MessageMetadata;
use crate::protocol::MessageType;

/// Rule for owning well-known names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnRule {
    /// Restrict the rule to one user.
    pub uid: Option<u32>,
    pub name: String,
    /// Match `name` and every name below it (`name.*`).
    pub prefix: bool,
    pub allow: bool,
}

impl OwnRule {
    fn matches(&self, name: &str) -> bool {
        if self.prefix {
            name == self.name
                || name
                    .strip_prefix(self.name.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        } else {
            name == self.name
        }
    }
}

/// Rule for sending or receiving messages.
///
/// For send rules `peer_name` selects the destination, for receive rules
/// the sender; it matches when the other peer owns that name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRule {
    pub uid: Option<u32>,
    pub peer_name: Option<String>,
    pub msg_type: Option<MessageType>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub allow: bool,
}

impl MessageRule {
    fn matches(&self, names: &[String], metadata: &MessageMetadata) -> bool {
        if let Some(ref name) = self.peer_name {
            if !names.iter().any(|n| n == name) {
                return false;
            }
        }
        if let Some(msg_type) = self.msg_type {
            if msg_type as u8 != metadata.header.msg_type {
                return false;
            }
        }
        let fields = &metadata.fields;
        [
            (&self.interface, &fields.interface),
            (&self.member, &fields.member),
            (&self.path, &fields.path),
        ]
        .into_iter()
        .all(|(rule, actual)| rule.is_none() || rule == actual)
    }
}

fn applies(uid: Option<u32>, peer_uid: u32) -> bool {
    uid.map_or(true, |u| u == peer_uid)
}

/// Bus-wide policy rules.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    own: Vec<OwnRule>,
    send: Vec<MessageRule>,
    receive: Vec<MessageRule>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_own_rule(&mut self, rule: OwnRule) {
        self.own.push(rule);
    }

    pub fn add_send_rule(&mut self, rule: MessageRule) {
        self.send.push(rule);
    }

    pub fn add_receive_rule(&mut self, rule: MessageRule) {
        self.receive.push(rule);
    }

    /// Forbid everybody from owning `name`.
    pub fn deny_own(&mut self, name: &str) {
        self.add_own_rule(OwnRule {
            uid: None,
            name: name.to_string(),
            prefix: false,
            allow: false,
        });
    }

    /// The subset of rules that applies to `uid`.
    pub fn instantiate(&self, uid: u32) -> PeerPolicy {
        PeerPolicy {
            own: self.own.iter().filter(|r| applies(r.uid, uid)).cloned().collect(),
            send: self.send.iter().filter(|r| applies(r.uid, uid)).cloned().collect(),
            receive: self
                .receive
                .iter()
                .filter(|r| applies(r.uid, uid))
                .cloned()
                .collect(),
        }
    }
}

/// Policy as seen by one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    own: Vec<OwnRule>,
    send: Vec<MessageRule>,
    receive: Vec<MessageRule>,
}

impl PeerPolicy {
    /// A policy that allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn check_own(&self, name: &str) -> Result<(), PeerError> {
        match self.own.iter().rev().find(|r| r.matches(name)) {
            Some(rule) if !rule.allow => Err(PeerError::NameRefused),
            _ => Ok(()),
        }
    }

    /// May this peer send `metadata` to a receiver owning `receiver_names`?
    pub fn check_send(&self, receiver_names: &[String], metadata: &MessageMetadata) -> Result<(), PeerError> {
        match self.send.iter().rev().find(|r| r.matches(receiver_names, metadata)) {
            Some(rule) if !rule.allow => Err(PeerError::SendDenied),
            _ => Ok(()),
        }
    }

    /// May this peer receive `metadata` from a sender owning `sender_names`?
    pub fn check_receive(&self, sender_names: &[String], metadata: &MessageMetadata) -> Result<(), PeerError> {
        match self.receive.iter().rev().find(|r| r.matches(sender_names, metadata)) {
            Some(rule) if !rule.allow => Err(PeerError::ReceiveDenied),
            _ => Ok(()),
        }
    }
}
