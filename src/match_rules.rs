//! D-Bus match rule parsing and matching.
//!
//! Match rules are comma-separated `key='value'` pairs. Parsing is strict:
//! unknown or repeated keys, bad message types and malformed quoting are
//! rejected. Installed rules live in a bus-wide [`MatchStore`] arena and are
//! referenced by [`MatchId`] from two sides: the [`MatchOwner`] of the peer
//! that installed them, and the [`MatchRegistry`] they are indexed under
//! (keyed by the sender they select on).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::protocol::{
    is_valid_bus_name, is_valid_object_path, unique_name_to_id, MessageType, PeerId, DBUS_NAME,
};
use crate::wire::{Arg, MAX_ARGS};

/// A parsed D-Bus match rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// Message type filter.
    pub msg_type: Option<MessageType>,
    /// Sender filter (unique name, well-known name, or the driver).
    pub sender: Option<String>,
    /// Interface filter.
    pub interface: Option<String>,
    /// Member (method/signal name) filter.
    pub member: Option<String>,
    /// Object path filter.
    pub path: Option<String>,
    /// Object path namespace filter (matches path and all children).
    pub path_namespace: Option<String>,
    /// Destination filter.
    pub destination: Option<String>,
    /// Argument filters (arg0, arg1, etc.).
    pub args: BTreeMap<u8, String>,
    /// Argument path filters (arg0path, arg1path, etc.).
    pub arg_paths: BTreeMap<u8, String>,
    /// Matches if arg0 is a bus name in this namespace.
    pub arg0namespace: Option<String>,
    /// Request to see messages not addressed to the owner.
    pub eavesdrop: bool,
}

/// Errors that can occur when parsing match rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRuleError {
    /// Invalid match rule format.
    InvalidFormat(String),
    /// Invalid argument index.
    InvalidArgIndex(String),
    /// Key not part of the match rule grammar.
    UnknownKey(String),
    /// Key given more than once.
    DuplicateKey(String),
    /// Value not acceptable for its key.
    InvalidValue(String),
}

impl fmt::Display for MatchRuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRuleError::InvalidFormat(msg) => write!(f, "Invalid match rule format: {}", msg),
            MatchRuleError::InvalidArgIndex(key) => write!(f, "Invalid argument index: {}", key),
            MatchRuleError::UnknownKey(key) => write!(f, "Unknown match rule key: {}", key),
            MatchRuleError::DuplicateKey(key) => write!(f, "Duplicate match rule key: {}", key),
            MatchRuleError::InvalidValue(key) => write!(f, "Invalid value for key: {}", key),
        }
    }
}

impl std::error::Error for MatchRuleError {}

/// Split a rule string into raw `(key, value)` pairs, unquoting values.
fn tokenize(rule: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let mut pairs = Vec::new();
    let mut chars = rule.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => {
                    return Err(MatchRuleError::InvalidFormat(format!(
                        "Missing '=' after: {}",
                        key
                    )))
                }
            }
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(MatchRuleError::InvalidFormat("Empty key".to_string()));
        }

        let mut value = String::new();
        let mut quoted = false;
        loop {
            match chars.next() {
                None if quoted => {
                    return Err(MatchRuleError::InvalidFormat("Unclosed quote".to_string()))
                }
                None => break,
                Some('\'') => quoted = !quoted,
                Some(',') if !quoted => break,
                Some('\\') if !quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                Some(c) => value.push(c),
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

fn parse_arg_index(key: &str, digits: &str) -> Result<u8, MatchRuleError> {
    if digits.is_empty()
        || digits.len() > 2
        || (digits.len() > 1 && digits.starts_with('0'))
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(MatchRuleError::InvalidArgIndex(key.to_string()));
    }
    let index: usize = digits
        .parse()
        .map_err(|_| MatchRuleError::InvalidArgIndex(key.to_string()))?;
    if index >= MAX_ARGS {
        return Err(MatchRuleError::InvalidArgIndex(key.to_string()));
    }
    Ok(index as u8)
}

impl MatchRule {
    /// Parse a match rule string.
    ///
    /// Example: "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'"
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut result = MatchRule::default();
        let mut seen = BTreeSet::new();

        for (key, value) in tokenize(rule)? {
            if !seen.insert(key.clone()) {
                return Err(MatchRuleError::DuplicateKey(key));
            }
            let invalid = || MatchRuleError::InvalidValue(key.clone());

            match key.as_str() {
                "type" => {
                    result.msg_type = Some(MessageType::from_match_str(&value).ok_or_else(invalid)?)
                }
                "sender" => {
                    if !is_valid_bus_name(&value) {
                        return Err(invalid());
                    }
                    result.sender = Some(value);
                }
                "interface" => result.interface = Some(value),
                "member" => result.member = Some(value),
                "path" => {
                    if !is_valid_object_path(&value) {
                        return Err(invalid());
                    }
                    result.path = Some(value);
                }
                "path_namespace" => {
                    if !is_valid_object_path(&value) {
                        return Err(invalid());
                    }
                    result.path_namespace = Some(value);
                }
                "destination" => {
                    if !is_valid_bus_name(&value) {
                        return Err(invalid());
                    }
                    result.destination = Some(value);
                }
                "eavesdrop" => {
                    result.eavesdrop = match value.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(invalid()),
                    }
                }
                "arg0namespace" => result.arg0namespace = Some(value),
                k if k.starts_with("arg") && k.ends_with("path") && k.len() > 7 => {
                    let index = parse_arg_index(k, &k[3..k.len() - 4])?;
                    result.arg_paths.insert(index, value);
                }
                k if k.starts_with("arg") => {
                    let index = parse_arg_index(k, &k[3..])?;
                    result.args.insert(index, value);
                }
                _ => return Err(MatchRuleError::UnknownKey(key.clone())),
            }
        }

        if result.path.is_some() && result.path_namespace.is_some() {
            return Err(MatchRuleError::InvalidFormat(
                "path and path_namespace are exclusive".to_string(),
            ));
        }
        if result.arg0namespace.is_some()
            && (result.args.contains_key(&0) || result.arg_paths.contains_key(&0))
        {
            return Err(MatchRuleError::InvalidFormat(
                "arg0namespace conflicts with another arg0 filter".to_string(),
            ));
        }

        Ok(result)
    }

    /// Check a message, described by `filter`, against this rule.
    pub fn matches(&self, filter: &MatchFilter<'_>) -> bool {
        if let Some(msg_type) = self.msg_type {
            if msg_type as u8 != filter.msg_type {
                return false;
            }
        }

        if let Some(ref sender) = self.sender {
            let matched = if sender == DBUS_NAME {
                filter.sender.is_none()
            } else if let Some(id) = unique_name_to_id(sender) {
                filter.sender == Some(id)
            } else {
                filter.sender_names.iter().any(|n| n == sender)
            };
            if !matched {
                return false;
            }
        }

        if let Some(ref destination) = self.destination {
            let by_id = unique_name_to_id(destination)
                .is_some_and(|id| filter.destination == Some(id));
            if !by_id && filter.destination_name != Some(destination.as_str()) {
                return false;
            }
        }

        if !field_matches(&self.interface, filter.interface)
            || !field_matches(&self.member, filter.member)
            || !field_matches(&self.path, filter.path)
        {
            return false;
        }

        if let Some(ref namespace) = self.path_namespace {
            let Some(path) = filter.path else {
                return false;
            };
            let inside = namespace == "/"
                || path == namespace
                || path
                    .strip_prefix(namespace.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if !inside {
                return false;
            }
        }

        for (index, expected) in &self.args {
            match filter.args.get(*index as usize) {
                Some(Some(Arg::Str(actual))) if actual == expected => {}
                _ => return false,
            }
        }

        for (index, path_filter) in &self.arg_paths {
            match filter.args.get(*index as usize) {
                Some(Some(arg)) if matches_path_filter(arg.as_str(), path_filter) => {}
                _ => return false,
            }
        }

        if let Some(ref namespace) = self.arg0namespace {
            match filter.args.first() {
                Some(Some(Arg::Str(arg0)))
                    if arg0 == namespace
                        || arg0
                            .strip_prefix(namespace.as_str())
                            .is_some_and(|rest| rest.starts_with('.')) => {}
                _ => return false,
            }
        }

        true
    }
}

fn field_matches(rule: &Option<String>, actual: Option<&str>) -> bool {
    match rule {
        None => true,
        Some(expected) => actual == Some(expected.as_str()),
    }
}

/// Render the rule in canonical form; two rules are the same rule exactly
/// when their canonical forms are equal.
impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn quote(value: &str) -> String {
            format!("'{}'", value.replace('\'', "'\\''"))
        }

        let mut parts = Vec::new();
        if let Some(msg_type) = self.msg_type {
            parts.push(format!("type={}", quote(msg_type.as_str())));
        }
        let keyed = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
            ("arg0namespace", &self.arg0namespace),
        ];
        for (key, value) in keyed {
            if let Some(value) = value {
                parts.push(format!("{}={}", key, quote(value)));
            }
        }
        for (index, value) in &self.args {
            parts.push(format!("arg{}={}", index, quote(value)));
        }
        for (index, value) in &self.arg_paths {
            parts.push(format!("arg{}path={}", index, quote(value)));
        }
        if self.eavesdrop {
            parts.push("eavesdrop='true'".to_string());
        }
        write!(f, "{}", parts.join(","))
    }
}

/// Check if an argument value matches a path filter according to D-Bus argNpath rules.
///
/// There is a match when both are equal, or when either one ends with '/'
/// and is a prefix of the other.
///
/// Examples with arg0path='/aa/bb/':
/// - '/' matches (arg ends with '/' and is prefix of filter)
/// - '/aa/bb/cc' matches (filter ends with '/' and is prefix of arg)
/// - '/aa/b' does not match
fn matches_path_filter(arg_value: &str, filter: &str) -> bool {
    if arg_value == filter {
        return true;
    }

    if filter.ends_with('/') && arg_value.starts_with(filter) {
        return true;
    }

    arg_value.ends_with('/') && filter.starts_with(arg_value)
}

/// The message properties match rules are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct MatchFilter<'a> {
    pub msg_type: u8,
    /// Sending peer; `None` when the driver is the sender.
    pub sender: Option<PeerId>,
    /// Well-known names the sender is primary owner of.
    pub sender_names: &'a [String],
    /// Peer the message is addressed to, if unicast.
    pub destination: Option<PeerId>,
    /// Destination field as written by the sender.
    pub destination_name: Option<&'a str>,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub args: &'a [Option<Arg>],
}

/// Stable identifier of an installed rule.
pub type MatchId = u64;

/// Which registry an installed rule is indexed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchIndex {
    /// No sender given.
    Wildcard,
    /// Sender is the driver.
    Driver,
    /// Sender is a connected peer's unique name.
    Peer(PeerId),
    /// Sender is a well-known name.
    Name(String),
    /// Installed by a monitor; sees all traffic.
    Monitor,
    /// Sender is a unique name that is not connected; never matches.
    Detached,
}

/// One installed rule and its bookkeeping.
#[derive(Debug, Clone)]
pub struct MatchEntry {
    pub owner: PeerId,
    pub rule: MatchRule,
    pub index: MatchIndex,
    /// Eavesdropping is honored for this entry.
    pub eavesdrop: bool,
    n_refs: usize,
}

impl MatchEntry {
    pub fn n_refs(&self) -> usize {
        self.n_refs
    }
}

/// Bus-wide arena of installed rules.
#[derive(Debug, Default)]
pub struct MatchStore {
    entries: HashMap<MatchId, MatchEntry>,
    next_id: MatchId,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: PeerId, rule: MatchRule, index: MatchIndex, eavesdrop: bool) -> MatchId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            MatchEntry {
                owner,
                rule,
                index,
                eavesdrop,
                n_refs: 1,
            },
        );
        id
    }

    pub fn get(&self, id: MatchId) -> Option<&MatchEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: MatchId) -> Option<&mut MatchEntry> {
        self.entries.get_mut(&id)
    }

    /// Add one reference to an existing rule.
    pub fn acquire(&mut self, id: MatchId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.n_refs += 1;
        }
    }

    /// Drop one reference. Returns the entry once the last one is gone.
    pub fn release(&mut self, id: MatchId) -> Option<MatchEntry> {
        let entry = self.entries.get_mut(&id)?;
        entry.n_refs -= 1;
        if entry.n_refs == 0 {
            self.entries.remove(&id)
        } else {
            None
        }
    }

    /// Remove a rule regardless of its reference count.
    pub fn remove(&mut self, id: MatchId) -> Option<MatchEntry> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A set of rules indexed under one sender key.
#[derive(Debug, Default, Clone)]
pub struct MatchRegistry {
    ids: BTreeSet<MatchId>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, id: MatchId) {
        self.ids.insert(id);
    }

    pub fn unlink(&mut self, id: MatchId) -> bool {
        self.ids.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchId> + '_ {
        self.ids.iter().copied()
    }

    /// Take every id out of the registry.
    pub fn drain(&mut self) -> Vec<MatchId> {
        std::mem::take(&mut self.ids).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// The rules one peer has installed, by canonical rule string.
#[derive(Debug, Default)]
pub struct MatchOwner {
    rules: BTreeMap<String, MatchId>,
}

impl MatchOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, rule: &MatchRule) -> Option<MatchId> {
        self.rules.get(&rule.to_string()).copied()
    }

    pub fn insert(&mut self, rule: &MatchRule, id: MatchId) {
        self.rules.insert(rule.to_string(), id);
    }

    pub fn remove(&mut self, rule: &MatchRule) -> Option<MatchId> {
        self.rules.remove(&rule.to_string())
    }

    /// Take every rule id, leaving the owner empty.
    pub fn drain(&mut self) -> Vec<MatchId> {
        std::mem::take(&mut self.rules).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal<'a>(interface: &'a str, member: &'a str, path: &'a str) -> MatchFilter<'a> {
        MatchFilter {
            msg_type: MessageType::Signal as u8,
            sender: Some(1),
            interface: Some(interface),
            member: Some(member),
            path: Some(path),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_simple_rule() {
        let rule = MatchRule::parse("type='signal',interface='org.example.Foo'").unwrap();
        assert_eq!(rule.msg_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("org.example.Foo"));
        assert!(rule.member.is_none());
    }

    #[test]
    fn test_parse_empty_rule() {
        let rule = MatchRule::parse("").unwrap();
        assert_eq!(rule, MatchRule::default());
        assert_eq!(rule.to_string(), "");
    }

    #[test]
    fn test_parse_quoting() {
        let rule = MatchRule::parse("arg0='a,b',arg1=don\\'t,arg2='x'\\''y'").unwrap();
        assert_eq!(rule.args.get(&0).map(String::as_str), Some("a,b"));
        assert_eq!(rule.args.get(&1).map(String::as_str), Some("don't"));
        assert_eq!(rule.args.get(&2).map(String::as_str), Some("x'y"));
    }

    #[test]
    fn test_parse_arg_keys() {
        let rule = MatchRule::parse("arg3path='/a/',arg0namespace='org.example'").unwrap();
        assert_eq!(rule.arg_paths.get(&3).map(String::as_str), Some("/a/"));
        assert_eq!(rule.arg0namespace.as_deref(), Some("org.example"));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        for rule in [
            "type='bogus'",
            "frobnicate='x'",
            "member='a',member='b'",
            "arg64='x'",
            "argx='x'",
            "arg01path=''",
            "path='/a',path_namespace='/b'",
            "eavesdrop='yes'",
            "interface='unterminated",
            "sender='not a name'",
            "path='relative'",
            "=oops",
            "type",
        ] {
            assert!(MatchRule::parse(rule).is_err(), "{} should be rejected", rule);
        }
    }

    #[test]
    fn test_canonical_form_ignores_order_and_spacing() {
        let a = MatchRule::parse("member='M', type='signal'").unwrap();
        let b = MatchRule::parse("type=signal,member=M").unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(MatchRule::parse(&a.to_string()).unwrap(), a);
    }

    #[test]
    fn test_canonical_form_roundtrips_quotes() {
        let rule = MatchRule::parse("arg0='it'\\''s'").unwrap();
        assert_eq!(MatchRule::parse(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn test_match_basic_fields() {
        let rule = MatchRule::parse("type='signal',interface='org.example.Foo',member='Bar'").unwrap();
        assert!(rule.matches(&signal("org.example.Foo", "Bar", "/")));
        assert!(!rule.matches(&signal("org.example.Foo", "Baz", "/")));
        assert!(!rule.matches(&signal("org.example.Other", "Bar", "/")));

        let mut call = signal("org.example.Foo", "Bar", "/");
        call.msg_type = MessageType::MethodCall as u8;
        assert!(!rule.matches(&call));
    }

    #[test]
    fn test_match_sender_forms() {
        let names = vec!["org.example.Service".to_string()];
        let mut filter = signal("i.f", "M", "/");
        filter.sender_names = &names;

        assert!(MatchRule::parse("sender=':1.1'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("sender=':1.2'").unwrap().matches(&filter));
        assert!(MatchRule::parse("sender='org.example.Service'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("sender='org.freedesktop.DBus'").unwrap().matches(&filter));

        filter.sender = None;
        assert!(MatchRule::parse("sender='org.freedesktop.DBus'").unwrap().matches(&filter));
    }

    #[test]
    fn test_match_destination() {
        let mut filter = signal("i.f", "M", "/");
        filter.destination = Some(7);
        filter.destination_name = Some("org.example.Target");
        assert!(MatchRule::parse("destination=':1.7'").unwrap().matches(&filter));
        assert!(MatchRule::parse("destination='org.example.Target'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("destination=':1.8'").unwrap().matches(&filter));
    }

    #[test]
    fn test_match_path_namespace() {
        let rule = MatchRule::parse("path_namespace='/org/example'").unwrap();
        assert!(rule.matches(&signal("i.f", "M", "/org/example")));
        assert!(rule.matches(&signal("i.f", "M", "/org/example/child")));
        assert!(!rule.matches(&signal("i.f", "M", "/org/examples")));
        assert!(!rule.matches(&signal("i.f", "M", "/org")));

        let root = MatchRule::parse("path_namespace='/'").unwrap();
        assert!(root.matches(&signal("i.f", "M", "/anything")));
    }

    #[test]
    fn test_match_args() {
        let args = vec![
            Some(Arg::Str("org.example.Name".into())),
            None,
            Some(Arg::Path("/aa/bb/cc".into())),
        ];
        let mut filter = signal("i.f", "M", "/");
        filter.args = &args;

        assert!(MatchRule::parse("arg0='org.example.Name'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg0='other'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg1=''").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg2='/aa/bb/cc'").unwrap().matches(&filter));
        assert!(MatchRule::parse("arg2path='/aa/bb/'").unwrap().matches(&filter));
        assert!(MatchRule::parse("arg2path='/aa/bb/cc'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg2path='/aa/b'").unwrap().matches(&filter));
        assert!(MatchRule::parse("arg0namespace='org.example'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg0namespace='org.ex'").unwrap().matches(&filter));
        assert!(!MatchRule::parse("arg5='x'").unwrap().matches(&filter));
    }

    #[test]
    fn test_path_filter_semantics() {
        assert!(matches_path_filter("/aa/bb/", "/aa/bb/"));
        assert!(matches_path_filter("/", "/aa/bb/"));
        assert!(matches_path_filter("/aa/", "/aa/bb/"));
        assert!(matches_path_filter("/aa/bb/cc/", "/aa/bb/"));
        assert!(matches_path_filter("/aa/bb/cc", "/aa/bb/"));
        assert!(!matches_path_filter("/aa/b", "/aa/bb/"));
        assert!(!matches_path_filter("/aa", "/aa/bb/"));
    }

    #[test]
    fn test_store_reference_counting() {
        let mut store = MatchStore::new();
        let rule = MatchRule::parse("type='signal'").unwrap();
        let id = store.insert(1, rule.clone(), MatchIndex::Wildcard, false);
        store.acquire(id);
        assert_eq!(store.get(id).unwrap().n_refs(), 2);

        assert!(store.release(id).is_none());
        let entry = store.release(id).unwrap();
        assert_eq!(entry.rule, rule);
        assert!(store.is_empty());
    }

    #[test]
    fn test_owner_finds_equivalent_rules() {
        let mut owner = MatchOwner::new();
        let a = MatchRule::parse("member='M',type='signal'").unwrap();
        let b = MatchRule::parse("type='signal', member='M'").unwrap();
        owner.insert(&a, 4);
        assert_eq!(owner.find(&b), Some(4));
        assert_eq!(owner.remove(&b), Some(4));
        assert!(owner.is_empty());
    }
}
