//! The bus driver, `org.freedesktop.DBus`.
//!
//! Every message a peer sends enters here. The driver parses it, stitches
//! the sender's unique name in, and then either answers it itself (when
//! addressed to the bus) or routes it through the [`Bus`]. It also emits
//! the ownership signals that name changes and disconnects produce.

use std::cell::Cell;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use zbus::zvariant::serialized::Data;
use zbus::zvariant::Type;

use crate::bus::{Bus, Origin};
use crate::error::{DispatchError, PeerError};
use crate::message::{Message, MessageBuilder, MessageMetadata};
use crate::name_registry::NameChange;
use crate::peer::Peer;
use crate::protocol::{
    error_names, flags, is_valid_bus_name, release_name_reply, request_name_reply,
    unique_name_from_id, MessageType, PeerId, DBUS_INTERFACE, DBUS_INTERFACE_MONITORING,
    DBUS_INTERFACE_PEER, DBUS_NAME, DBUS_PATH,
};
use crate::wire;

/// Why a driver method failed.
#[derive(Debug)]
enum MethodError {
    /// Answer the caller with this error.
    Reply { name: &'static str, text: String },
    /// Disconnect the caller.
    Violation(&'static str),
}

impl MethodError {
    fn new(name: &'static str, text: impl Into<String>) -> Self {
        MethodError::Reply {
            name,
            text: text.into(),
        }
    }

    fn invalid_args(text: impl Into<String>) -> Self {
        Self::new(error_names::INVALID_ARGS, text)
    }
}

impl From<PeerError> for MethodError {
    fn from(e: PeerError) -> Self {
        Self::new(e.dbus_error_name(), e.to_string())
    }
}

impl From<crate::error::Error> for MethodError {
    fn from(e: crate::error::Error) -> Self {
        Self::new(error_names::FAILED, e.to_string())
    }
}

type MethodResult = std::result::Result<(), MethodError>;

fn expects_reply(metadata: &MessageMetadata) -> bool {
    metadata.header.msg_type == MessageType::MethodCall as u8
        && metadata.header.flags & flags::NO_REPLY_EXPECTED == 0
}

fn is_hello(metadata: &MessageMetadata) -> bool {
    let fields = &metadata.fields;
    metadata.header.message_type() == Some(MessageType::MethodCall)
        && fields.destination.as_deref() == Some(DBUS_NAME)
        && fields.member.as_deref() == Some("Hello")
        && matches!(fields.interface.as_deref(), None | Some(DBUS_INTERFACE))
}

fn check_signature(call: &Message, expected: &str) -> MethodResult {
    let actual = call.metadata().fields.signature.as_deref().unwrap_or("");
    if actual != expected {
        return Err(MethodError::invalid_args(format!(
            "Invalid arguments: expected signature '{}', got '{}'",
            expected, actual
        )));
    }
    Ok(())
}

/// Decode the body of a driver call.
fn args<T>(call: &Message, signature: &str) -> std::result::Result<T, MethodError>
where
    T: DeserializeOwned + Type,
{
    check_signature(call, signature)?;
    let data = Data::new(call.body(), wire::context(call.is_big_endian(), 0));
    data.deserialize::<T>()
        .map(|(value, _)| value)
        .map_err(|e| MethodError::invalid_args(format!("Invalid arguments: {}", e)))
}

fn check_name(name: &str) -> MethodResult {
    if !is_valid_bus_name(name) {
        return Err(MethodError::invalid_args(format!("Invalid bus name '{}'", name)));
    }
    Ok(())
}

fn lookup_peer<'b>(bus: &'b Bus, name: &str) -> std::result::Result<&'b Peer, MethodError> {
    bus.resolve(name)
        .and_then(|id| bus.peers().find(id))
        .ok_or_else(|| {
            MethodError::new(
                error_names::NAME_HAS_NO_OWNER,
                format!("Could not get owner of name '{}': no such name", name),
            )
        })
}

/// The `org.freedesktop.DBus` driver.
#[derive(Debug)]
pub struct Driver {
    /// Serial of the next message the driver sends.
    serial: Cell<u32>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        Self { serial: Cell::new(1) }
    }

    /// Hand out a serial, wrapping past `u32::MAX` to 1.
    fn next_serial(&self) -> u32 {
        let serial = self.serial.get();
        self.serial.set(serial.checked_add(1).unwrap_or(1));
        serial
    }

    /// Handle one message from `sender_id`.
    ///
    /// An `Err` means the peer broke the protocol and must be disconnected.
    pub fn dispatch(&self, bus: &mut Bus, sender_id: PeerId, mut message: Message) -> Result<(), DispatchError> {
        let peer = bus
            .peers()
            .find(sender_id)
            .ok_or(DispatchError::UnknownPeer(sender_id))?;
        if peer.is_monitor() {
            return Err(DispatchError::ProtocolViolation("monitors may not send messages"));
        }
        let registered = peer.is_registered();

        message.parse_metadata()?;
        if !registered && !is_hello(message.metadata()) {
            return Err(DispatchError::ProtocolViolation("first message must be Hello"));
        }
        message.stitch_sender(sender_id);

        let message = Arc::new(message);
        let metadata = message.metadata();
        trace!(sender = sender_id, msg_type = metadata.header.msg_type,
               serial = metadata.header.serial, destination = ?metadata.fields.destination,
               member = ?metadata.fields.member, "Dispatching message");

        match metadata.fields.destination.as_deref() {
            Some(DBUS_NAME) => {
                bus.eavesdrop(Origin::Peer(sender_id), None, &message);
                self.dispatch_driver(bus, sender_id, &message)
            }
            Some(destination) => {
                self.dispatch_unicast(bus, sender_id, destination, &message);
                Ok(())
            }
            None if metadata.header.message_type() == Some(MessageType::Signal) => {
                bus.broadcast(Origin::Peer(sender_id), &message);
                Ok(())
            }
            None => {
                bus.eavesdrop(Origin::Peer(sender_id), None, &message);
                debug!(sender = sender_id, "Dropped message without destination");
                Ok(())
            }
        }
    }

    fn dispatch_unicast(&self, bus: &mut Bus, sender_id: PeerId, destination: &str, message: &Arc<Message>) {
        let metadata = message.metadata();
        match metadata.header.message_type() {
            Some(MessageType::MethodReturn) | Some(MessageType::Error) => {
                let reply_serial = metadata.fields.reply_serial.unwrap_or_default();
                if let Err(e) = bus.queue_reply(sender_id, destination, reply_serial, message) {
                    debug!(sender = sender_id, destination = %destination,
                           reply_serial = reply_serial, error = %e, "Dropped reply");
                }
            }
            _ => {
                let Some(receiver_id) = bus.resolve(destination) else {
                    let (name, text) = if destination.starts_with(':') {
                        (
                            error_names::NAME_HAS_NO_OWNER,
                            format!("Could not find peer '{}'", destination),
                        )
                    } else {
                        (
                            error_names::SERVICE_UNKNOWN,
                            format!("The name '{}' is not owned", destination),
                        )
                    };
                    debug!(sender = sender_id, destination = %destination, "Unknown destination");
                    self.send_error(bus, sender_id, metadata, name, &text);
                    return;
                };
                if let Err(e) = bus.queue_call(sender_id, receiver_id, message) {
                    debug!(sender = sender_id, receiver = receiver_id, error = %e, "Call not delivered");
                    self.send_error(bus, sender_id, metadata, e.dbus_error_name(), &e.to_string());
                }
            }
        }
    }

    fn dispatch_driver(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> Result<(), DispatchError> {
        let metadata = call.metadata();
        if metadata.header.message_type() != Some(MessageType::MethodCall) {
            trace!(sender = sender_id, "Ignoring non-call message to the driver");
            return Ok(());
        }
        let member = metadata.fields.member.as_deref().unwrap_or_default();
        let interface = metadata.fields.interface.as_deref();

        let result = match interface {
            None | Some(DBUS_INTERFACE) => match member {
                "Hello" => self.handle_hello(bus, sender_id, call),
                "RequestName" => self.handle_request_name(bus, sender_id, call),
                "ReleaseName" => self.handle_release_name(bus, sender_id, call),
                "AddMatch" => self.handle_add_match(bus, sender_id, call),
                "RemoveMatch" => self.handle_remove_match(bus, sender_id, call),
                "GetNameOwner" => self.handle_get_name_owner(bus, sender_id, call),
                "NameHasOwner" => self.handle_name_has_owner(bus, sender_id, call),
                "ListNames" => self.handle_list_names(bus, sender_id, call),
                "ListQueuedOwners" => self.handle_list_queued_owners(bus, sender_id, call),
                "GetId" => self.handle_get_id(bus, sender_id, call),
                "GetConnectionUnixUser" => self.handle_get_connection_unix_user(bus, sender_id, call),
                "GetConnectionUnixProcessID" => {
                    self.handle_get_connection_unix_process_id(bus, sender_id, call)
                }
                _ => Err(MethodError::new(
                    error_names::UNKNOWN_METHOD,
                    format!("Unknown method '{}'", member),
                )),
            },
            Some(DBUS_INTERFACE_MONITORING) => match member {
                "BecomeMonitor" => self.handle_become_monitor(bus, sender_id, call),
                _ => Err(MethodError::new(
                    error_names::UNKNOWN_METHOD,
                    format!("Unknown method '{}'", member),
                )),
            },
            Some(DBUS_INTERFACE_PEER) => match member {
                "Ping" => check_signature(call, "").and_then(|()| self.reply_empty(bus, sender_id, call)),
                _ => Err(MethodError::new(
                    error_names::UNKNOWN_METHOD,
                    format!("Unknown method '{}'", member),
                )),
            },
            Some(other) => Err(MethodError::new(
                error_names::UNKNOWN_INTERFACE,
                format!("Unknown interface '{}'", other),
            )),
        };

        match result {
            Ok(()) => Ok(()),
            Err(MethodError::Violation(reason)) => Err(DispatchError::ProtocolViolation(reason)),
            Err(MethodError::Reply { name, text }) => {
                debug!(sender = sender_id, member = %member, error = %name, "Driver call failed");
                self.send_error(bus, sender_id, metadata, name, &text);
                Ok(())
            }
        }
    }

    // --- methods ---

    fn handle_hello(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        check_signature(call, "")?;
        if !bus.register(sender_id) {
            return Err(MethodError::Violation("Hello called twice"));
        }
        let unique_name = unique_name_from_id(sender_id);
        info!(peer_id = sender_id, unique_name = %unique_name, "Peer registered");

        self.reply(bus, sender_id, call, "s", &unique_name)?;
        self.name_owner_changed(bus, &unique_name, "", &unique_name);
        self.unicast_signal(bus, sender_id, "NameAcquired", &unique_name);
        Ok(())
    }

    fn handle_request_name(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let (name, name_flags): (String, u32) = args(call, "su")?;
        check_name(&name)?;

        let code = match bus.request_name(sender_id, &name, name_flags) {
            Ok(change) => {
                self.notify_name_change(bus, &change);
                request_name_reply::PRIMARY_OWNER
            }
            Err(PeerError::NameAlreadyOwner) => request_name_reply::ALREADY_OWNER,
            Err(PeerError::NameInQueue) => request_name_reply::IN_QUEUE,
            Err(PeerError::NameExists) => request_name_reply::EXISTS,
            Err(e) => return Err(e.into()),
        };
        debug!(peer_id = sender_id, name = %name, flags = name_flags, reply = code, "RequestName");
        self.reply(bus, sender_id, call, "u", &code)
    }

    fn handle_release_name(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;

        let code = match bus.release_name(sender_id, &name) {
            Ok(change) => {
                if let Some(change) = change {
                    self.notify_name_change(bus, &change);
                }
                release_name_reply::RELEASED
            }
            Err(PeerError::NameNotFound) => release_name_reply::NON_EXISTENT,
            Err(PeerError::NameNotOwner) => release_name_reply::NOT_OWNER,
            Err(e) => return Err(e.into()),
        };
        debug!(peer_id = sender_id, name = %name, reply = code, "ReleaseName");
        self.reply(bus, sender_id, call, "u", &code)
    }

    fn handle_add_match(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let rule: String = args(call, "s")?;
        bus.add_match(sender_id, &rule, false)?;
        self.reply_empty(bus, sender_id, call)
    }

    fn handle_remove_match(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let rule: String = args(call, "s")?;
        bus.remove_match(sender_id, &rule)?;
        self.reply_empty(bus, sender_id, call)
    }

    fn handle_get_name_owner(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;
        let owner = if name == DBUS_NAME {
            DBUS_NAME.to_string()
        } else {
            lookup_peer(bus, &name)?.unique_name()
        };
        self.reply(bus, sender_id, call, "s", &owner)
    }

    fn handle_name_has_owner(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;
        let has_owner = name == DBUS_NAME || bus.resolve(&name).is_some();
        self.reply(bus, sender_id, call, "b", &has_owner)
    }

    fn handle_list_names(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        check_signature(call, "")?;
        let mut names = vec![DBUS_NAME.to_string()];
        names.extend(bus.names().names().map(String::from));
        names.extend(
            bus.peers()
                .iter()
                .filter(|p| p.is_registered())
                .map(Peer::unique_name),
        );
        self.reply(bus, sender_id, call, "as", &names)
    }

    fn handle_list_queued_owners(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;
        let owners = if name == DBUS_NAME {
            vec![DBUS_NAME.to_string()]
        } else if name.starts_with(':') {
            vec![lookup_peer(bus, &name)?.unique_name()]
        } else {
            bus.names()
                .list_queued_owners(&name)
                .into_iter()
                .map(unique_name_from_id)
                .collect()
        };
        if owners.is_empty() {
            return Err(MethodError::new(
                error_names::NAME_HAS_NO_OWNER,
                format!("Could not get owners of name '{}': no such name", name),
            ));
        }
        self.reply(bus, sender_id, call, "as", &owners)
    }

    fn handle_get_id(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        check_signature(call, "")?;
        let id = hex::encode(bus.guid());
        self.reply(bus, sender_id, call, "s", &id)
    }

    fn handle_get_connection_unix_user(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;
        let uid = if name == DBUS_NAME {
            bus.uid()
        } else {
            lookup_peer(bus, &name)?.uid
        };
        self.reply(bus, sender_id, call, "u", &uid)
    }

    fn handle_get_connection_unix_process_id(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let name: String = args(call, "s")?;
        check_name(&name)?;
        let pid = if name == DBUS_NAME {
            Some(std::process::id())
        } else {
            lookup_peer(bus, &name)?.pid
        };
        let pid = pid.ok_or_else(|| {
            MethodError::new(
                error_names::UNIX_PROCESS_ID_UNKNOWN,
                format!("Could not determine PID for '{}'", name),
            )
        })?;
        self.reply(bus, sender_id, call, "u", &pid)
    }

    fn handle_become_monitor(&self, bus: &mut Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        let (rules, monitor_flags): (Vec<String>, u32) = args(call, "asu")?;
        if monitor_flags != 0 {
            return Err(MethodError::invalid_args("BecomeMonitor flags must be 0"));
        }
        let privileged = bus
            .peers()
            .find(sender_id)
            .is_some_and(|p| p.is_privileged(bus.uid()));
        if !privileged {
            return Err(MethodError::new(
                error_names::ACCESS_DENIED,
                "Only root or the bus owner may become a monitor",
            ));
        }

        let changes = bus.become_monitor(sender_id, &rules)?;
        self.reply_empty(bus, sender_id, call)?;
        for change in &changes {
            self.notify_name_change(bus, change);
        }
        let unique_name = unique_name_from_id(sender_id);
        self.name_owner_changed(bus, &unique_name, &unique_name, "");
        Ok(())
    }

    // --- teardown ---

    /// Disconnect `peer_id` and tell everybody affected.
    pub fn hangup(&self, bus: &mut Bus, peer_id: PeerId) {
        let Some(teardown) = bus.disconnect(peer_id) else {
            return;
        };

        for change in &teardown.name_changes {
            self.notify_name_change(bus, change);
        }
        for slot in &teardown.orphaned_calls {
            let builder = MessageBuilder::error(slot.serial, error_names::NO_REPLY)
                .destination(&unique_name_from_id(slot.caller))
                .body("s", &"Remote peer disconnected");
            if let Some(message) = self.finish(builder) {
                if let Err(e) = bus.send_from_driver(slot.caller, &message) {
                    debug!(receiver = slot.caller, error = %e, "Dropped NoReply error");
                }
            }
        }
        if teardown.was_registered && !teardown.was_monitor {
            self.name_owner_changed(bus, &teardown.unique_name, &teardown.unique_name, "");
        }
    }

    // --- outgoing ---

    /// Stamp, build and parse a driver message.
    fn finish(&self, builder: crate::error::Result<MessageBuilder>) -> Option<Arc<Message>> {
        let built = builder.and_then(|b| {
            let mut message = b.sender(DBUS_NAME).serial(self.next_serial()).build()?;
            message.parse_metadata()?;
            Ok(message)
        });
        match built {
            Ok(message) => Some(Arc::new(message)),
            Err(e) => {
                warn!(error = %e, "Failed to build driver message");
                None
            }
        }
    }

    fn send(&self, bus: &Bus, receiver_id: PeerId, builder: crate::error::Result<MessageBuilder>) {
        let Some(message) = self.finish(builder) else {
            return;
        };
        if let Err(e) = bus.send_from_driver(receiver_id, &message) {
            debug!(receiver = receiver_id, error = %e, "Dropped driver message");
        }
    }

    fn reply<B>(&self, bus: &Bus, sender_id: PeerId, call: &Message, signature: &str, body: &B) -> MethodResult
    where
        B: Serialize + Type,
    {
        if !expects_reply(call.metadata()) {
            return Ok(());
        }
        let builder = MessageBuilder::method_return(call.metadata().header.serial)
            .destination(&unique_name_from_id(sender_id))
            .body(signature, body)?;
        self.send(bus, sender_id, Ok(builder));
        Ok(())
    }

    fn reply_empty(&self, bus: &Bus, sender_id: PeerId, call: &Message) -> MethodResult {
        if !expects_reply(call.metadata()) {
            return Ok(());
        }
        let builder = MessageBuilder::method_return(call.metadata().header.serial)
            .destination(&unique_name_from_id(sender_id));
        self.send(bus, sender_id, Ok(builder));
        Ok(())
    }

    fn send_error(&self, bus: &Bus, receiver_id: PeerId, call: &MessageMetadata, name: &str, text: &str) {
        if !expects_reply(call) {
            return;
        }
        let builder = MessageBuilder::error(call.header.serial, name)
            .destination(&unique_name_from_id(receiver_id))
            .body("s", &text);
        self.send(bus, receiver_id, builder);
    }

    fn unicast_signal(&self, bus: &Bus, receiver_id: PeerId, member: &str, name: &str) {
        let builder = MessageBuilder::signal(DBUS_PATH, DBUS_INTERFACE, member)
            .destination(&unique_name_from_id(receiver_id))
            .body("s", &name);
        self.send(bus, receiver_id, builder);
    }

    fn name_owner_changed(&self, bus: &Bus, name: &str, old_owner: &str, new_owner: &str) {
        let builder = MessageBuilder::signal(DBUS_PATH, DBUS_INTERFACE, "NameOwnerChanged")
            .body("sss", &(name, old_owner, new_owner));
        if let Some(message) = self.finish(builder) {
            bus.broadcast(Origin::Driver, &message);
        }
    }

    /// Emit `NameOwnerChanged`, then `NameLost` and `NameAcquired`.
    fn notify_name_change(&self, bus: &Bus, change: &NameChange) {
        let old_owner = change.old_owner.map(unique_name_from_id).unwrap_or_default();
        let new_owner = change.new_owner.map(unique_name_from_id).unwrap_or_default();
        self.name_owner_changed(bus, &change.name, &old_owner, &new_owner);

        if let Some(old_id) = change.old_owner.filter(|id| bus.peers().contains(*id)) {
            self.unicast_signal(bus, old_id, "NameLost", &change.name);
        }
        if let Some(new_id) = change.new_owner {
            self.unicast_signal(bus, new_id, "NameAcquired", &change.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::peer::{Connection, PeerCredentials};
    use tokio::sync::mpsc;

    fn decode<T: DeserializeOwned + Type>(message: &Message) -> T {
        Data::new(message.body(), wire::context(message.is_big_endian(), 0))
            .deserialize::<T>()
            .unwrap()
            .0
    }

    fn call(member: &str, serial: u32) -> MessageBuilder {
        MessageBuilder::method_call(DBUS_PATH, member)
            .interface(DBUS_INTERFACE)
            .destination(DBUS_NAME)
            .serial(serial)
    }

    fn setup() -> (Bus, Driver, PeerId, mpsc::Receiver<Arc<Message>>) {
        let mut bus = Bus::new(BusConfig {
            guid: [7; 16],
            uid: 0,
            ..Default::default()
        });
        let (conn, rx) = Connection::channel(32);
        let id = bus.connect(
            PeerCredentials {
                uid: 1000,
                pid: Some(4242),
                seclabel: None,
            },
            conn,
        );
        (bus, Driver::new(), id, rx)
    }

    #[test]
    fn test_hello() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();

        let reply = rx.try_recv().unwrap();
        let metadata = reply.metadata();
        assert_eq!(metadata.header.message_type(), Some(MessageType::MethodReturn));
        assert_eq!(metadata.fields.reply_serial, Some(1));
        assert_eq!(metadata.fields.sender.as_deref(), Some(DBUS_NAME));
        assert_eq!(decode::<String>(&reply), ":1.1");

        let acquired = rx.try_recv().unwrap();
        assert_eq!(acquired.metadata().fields.member.as_deref(), Some("NameAcquired"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_driver_serials_increase() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();

        let reply = rx.try_recv().unwrap();
        let acquired = rx.try_recv().unwrap();
        // NameOwnerChanged is stamped between the two
        assert_eq!(reply.metadata().header.serial, 1);
        assert_eq!(acquired.metadata().header.serial, 3);
    }

    #[test]
    fn test_driver_serial_skips_zero() {
        let driver = Driver {
            serial: Cell::new(u32::MAX),
        };
        assert_eq!(driver.next_serial(), u32::MAX);
        assert_eq!(driver.next_serial(), 1);
        assert_eq!(driver.next_serial(), 2);
    }

    #[test]
    fn test_message_before_hello() {
        let (mut bus, driver, id, _rx) = setup();
        let err = driver
            .dispatch(&mut bus, id, call("ListNames", 1).build().unwrap())
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProtocolViolation(_)));
    }

    #[test]
    fn test_second_hello() {
        let (mut bus, driver, id, _rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        let err = driver
            .dispatch(&mut bus, id, call("Hello", 2).build().unwrap())
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProtocolViolation(_)));
    }

    #[test]
    fn test_request_name_reply_codes() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        while rx.try_recv().is_ok() {}

        let request = call("RequestName", 2)
            .body("su", &("org.example.Name", 0u32))
            .unwrap();
        driver.dispatch(&mut bus, id, request.clone().build().unwrap()).unwrap();
        let acquired = rx.try_recv().unwrap();
        assert_eq!(acquired.metadata().fields.member.as_deref(), Some("NameAcquired"));
        let reply = rx.try_recv().unwrap();
        assert_eq!(decode::<u32>(&reply), request_name_reply::PRIMARY_OWNER);

        driver.dispatch(&mut bus, id, request.serial(3).build().unwrap()).unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(decode::<u32>(&reply), request_name_reply::ALREADY_OWNER);
    }

    #[test]
    fn test_invalid_bus_name_argument() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        while rx.try_recv().is_ok() {}

        let request = call("GetNameOwner", 2).body("s", &"not a name").unwrap();
        driver.dispatch(&mut bus, id, request.build().unwrap()).unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(
            reply.metadata().fields.error_name.as_deref(),
            Some(error_names::INVALID_ARGS)
        );
    }

    #[test]
    fn test_unknown_method() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        while rx.try_recv().is_ok() {}

        driver.dispatch(&mut bus, id, call("Frobnicate", 2).build().unwrap()).unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(
            reply.metadata().fields.error_name.as_deref(),
            Some(error_names::UNKNOWN_METHOD)
        );
    }

    #[test]
    fn test_no_reply_expected() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        while rx.try_recv().is_ok() {}

        let message = call("GetId", 2).flags(flags::NO_REPLY_EXPECTED).build().unwrap();
        driver.dispatch(&mut bus, id, message).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_become_monitor_requires_privilege() {
        let (mut bus, driver, id, mut rx) = setup();
        driver.dispatch(&mut bus, id, call("Hello", 1).build().unwrap()).unwrap();
        while rx.try_recv().is_ok() {}

        let request = MessageBuilder::method_call(DBUS_PATH, "BecomeMonitor")
            .interface(DBUS_INTERFACE_MONITORING)
            .destination(DBUS_NAME)
            .serial(2)
            .body("asu", &(Vec::<String>::new(), 0u32))
            .unwrap();
        driver.dispatch(&mut bus, id, request.build().unwrap()).unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(
            reply.metadata().fields.error_name.as_deref(),
            Some(error_names::ACCESS_DENIED)
        );
        assert!(!bus.peers().find(id).unwrap().is_monitor());
    }
}
