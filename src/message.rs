//! D-Bus messages as the broker sees them.
//!
//! A [`Message`] owns one contiguous buffer holding the fixed header, the
//! header fields and the body. The logical wire stream is exposed as four
//! segments: the (possibly cut) header, the header remainder after a cut,
//! the stitched-in sender field, and the body. Stitching a new sender never
//! moves or copies the original bytes; it only re-slices them.
//!
//! A freshly constructed message is exclusively owned and may be parsed and
//! stitched. Once it is wrapped in an `Arc` for fan-out it is read-only.

use std::io::IoSlice;
use std::os::fd::OwnedFd;

use serde::Serialize;
use zbus::names::{BusName, ErrorName, InterfaceName, MemberName};
use zbus::zvariant::serialized::Data;
use zbus::zvariant::{ObjectPath, Signature, Type, Value};

use crate::error::{MessageError, Result};
use crate::protocol::{
    self, field, unique_name_from_id, MessageType, PeerId, ENDIAN_BIG, ENDIAN_LITTLE,
    HEADER_SIZE, LOCAL_INTERFACE, LOCAL_PATH, MESSAGE_SIZE_MAX, PROTOCOL_VERSION,
};
use crate::wire::{self, align8, Arg};

/// The fixed header and the field array, as one D-Bus structure:
/// `(order, type, flags, version, body length, serial, a(yv))`.
pub type RawHeader<'a> = (u8, u8, u8, u8, u32, u32, Vec<(u8, Value<'a>)>);

/// Offset of a sender field's string bytes from the start of the field:
/// tag, variant signature "s", then the 4-byte length.
const SENDER_STRING_OFFSET: usize = 1 + 3 + 4;

/// The 16-byte fixed header as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader(pub [u8; HEADER_SIZE]);

impl MessageHeader {
    fn big_endian(&self) -> std::result::Result<bool, MessageError> {
        match self.0[0] {
            ENDIAN_LITTLE => Ok(false),
            ENDIAN_BIG => Ok(true),
            _ => Err(MessageError::CorruptHeader),
        }
    }

    fn u32_at(&self, offset: usize, big_endian: bool) -> u32 {
        let raw = [
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
        ];
        if big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }

    /// Decode the declared lengths: `(n_header, n_body, n_data)`.
    ///
    /// `n_header` excludes the padding before the body; `n_data` is the full
    /// message size including it.
    pub fn lengths(&self) -> std::result::Result<(u64, u64, u64), MessageError> {
        let big_endian = self.big_endian()?;
        let n_header = HEADER_SIZE as u64 + u64::from(self.u32_at(12, big_endian));
        let n_body = u64::from(self.u32_at(4, big_endian));
        let n_data = ((n_header + 7) & !7) + n_body;
        Ok((n_header, n_body, n_data))
    }
}

/// Decoded fixed-header values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    pub msg_type: u8,
    pub flags: u8,
    pub version: u8,
    pub serial: u32,
}

impl HeaderInfo {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }
}

/// Decoded header fields. `available` holds one bit per field present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFields {
    pub available: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: u32,
}

/// Everything routing needs to know about a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub header: HeaderInfo,
    pub fields: MessageFields,
    /// Leading string-like body arguments, for match rules.
    pub args: Vec<Option<Arg>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    start: usize,
    len: usize,
}

/// A D-Bus message buffer with its parsed metadata.
pub struct Message {
    big_endian: bool,
    data: Vec<u8>,
    stitch: Vec<u8>,
    n_header: usize,
    n_body: usize,
    n_data: usize,
    head: Segment,
    rest: Segment,
    body: Segment,
    fds: Vec<OwnedFd>,
    sender: Option<usize>,
    parsed: bool,
    sender_id: Option<PeerId>,
    metadata: MessageMetadata,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("big_endian", &self.big_endian)
            .field("n_header", &self.n_header)
            .field("n_body", &self.n_body)
            .field("n_fds", &self.fds.len())
            .field("parsed", &self.parsed)
            .field("sender_id", &self.sender_id)
            .finish()
    }
}

impl Message {
    fn with_layout(data: Vec<u8>, big_endian: bool, n_header: usize, n_body: usize) -> Self {
        let header_len = align8(n_header);
        Self {
            big_endian,
            data,
            stitch: Vec::new(),
            n_header,
            n_body,
            n_data: header_len + n_body,
            head: Segment {
                start: 0,
                len: header_len,
            },
            rest: Segment::default(),
            body: Segment {
                start: header_len,
                len: n_body,
            },
            fds: Vec::new(),
            sender: None,
            parsed: false,
            sender_id: None,
            metadata: MessageMetadata::default(),
        }
    }

    /// Create an incoming message from its fixed header.
    ///
    /// The buffer is sized from the declared lengths and the header copied
    /// in; the transport then fills [`Message::tail_mut`]. Nothing is
    /// allocated if the header is corrupt or too large.
    pub fn new_incoming(header: MessageHeader) -> std::result::Result<Self, MessageError> {
        let big_endian = header.big_endian()?;
        let (n_header, n_body, n_data) = header.lengths()?;
        if n_data > MESSAGE_SIZE_MAX {
            return Err(MessageError::TooLarge);
        }

        let mut data = vec![0u8; n_data as usize];
        data[..HEADER_SIZE].copy_from_slice(&header.0);

        Ok(Self::with_layout(
            data,
            big_endian,
            n_header as usize,
            n_body as usize,
        ))
    }

    /// Take ownership of a complete message buffer built by the broker.
    ///
    /// The body length in the header is recomputed from the buffer length.
    pub fn new_outgoing(mut data: Vec<u8>) -> std::result::Result<Self, MessageError> {
        if data.len() < HEADER_SIZE {
            return Err(MessageError::CorruptHeader);
        }
        let mut fixed = [0u8; HEADER_SIZE];
        fixed.copy_from_slice(&data[..HEADER_SIZE]);
        let header = MessageHeader(fixed);
        let big_endian = header.big_endian()?;
        let (n_header, _, _) = header.lengths()?;
        let n_header = n_header as usize;

        if align8(n_header) > data.len() {
            return Err(MessageError::CorruptHeader);
        }
        if data.len() as u64 > MESSAGE_SIZE_MAX {
            return Err(MessageError::TooLarge);
        }

        let n_body = data.len() - align8(n_header);
        let encoded = if big_endian {
            (n_body as u32).to_be_bytes()
        } else {
            (n_body as u32).to_le_bytes()
        };
        data[4..8].copy_from_slice(&encoded);

        Ok(Self::with_layout(data, big_endian, n_header, n_body))
    }

    /// Bytes following the fixed header, for the transport to fill.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        &mut self.data[HEADER_SIZE..]
    }

    /// Hand over descriptors received alongside the message bytes.
    pub fn attach_fds(&mut self, fds: Vec<OwnedFd>) {
        self.fds = fds;
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// Header length without the padding before the body.
    pub fn header_len(&self) -> usize {
        self.n_header
    }

    /// Total length of the logical wire stream.
    pub fn len(&self) -> usize {
        self.n_data
    }

    pub fn is_empty(&self) -> bool {
        self.n_data == 0
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.body.start..self.body.start + self.body.len]
    }

    /// Peer identity stitched in as sender, if any.
    pub fn sender_id(&self) -> Option<PeerId> {
        self.sender_id
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Decode and validate the header. Idempotent once it has succeeded.
    pub fn parse_metadata(&mut self) -> std::result::Result<&MessageMetadata, MessageError> {
        if self.parsed {
            return Ok(&self.metadata);
        }

        let (metadata, sender) = self.decode_header()?;
        self.fds.truncate(metadata.fields.unix_fds as usize);
        self.metadata = metadata;
        self.sender = sender;
        self.parsed = true;
        Ok(&self.metadata)
    }

    fn decode_header(&self) -> std::result::Result<(MessageMetadata, Option<usize>), MessageError> {
        let padding = &self.data[self.n_header..align8(self.n_header)];
        if padding.iter().any(|b| *b != 0) {
            return Err(MessageError::InvalidHeader);
        }

        let data = Data::new(&self.data[..self.n_header], wire::context(self.big_endian, 0));
        let (raw, used): (RawHeader<'_>, usize) =
            data.deserialize().map_err(|_| MessageError::InvalidHeader)?;
        if used != self.n_header {
            return Err(MessageError::InvalidHeader);
        }
        let (_, msg_type, flags, version, _, serial, raw_fields) = raw;

        let mut meta = MessageMetadata {
            header: HeaderInfo {
                msg_type,
                flags,
                version,
                serial,
            },
            ..Default::default()
        };
        if msg_type == MessageType::INVALID || version != PROTOCOL_VERSION || serial == 0 {
            return Err(MessageError::InvalidHeader);
        }

        let mut sender = None;
        let mut offset = HEADER_SIZE;
        let fields = &mut meta.fields;
        for entry in &raw_fields {
            let start = align8(offset);
            let size = zbus::zvariant::serialized_size(wire::context(self.big_endian, start), entry)
                .map_err(|_| MessageError::InvalidHeader)?;
            offset = start + *size;

            let (tag, value) = entry;
            let tag = *tag;
            if tag >= field::N {
                continue;
            }
            if tag == field::INVALID || fields.available & field::bit(tag) != 0 {
                return Err(MessageError::InvalidHeader);
            }
            fields.available |= field::bit(tag);

            match (tag, value) {
                (field::PATH, Value::ObjectPath(path)) => {
                    if path.as_str() == LOCAL_PATH {
                        return Err(MessageError::InvalidHeader);
                    }
                    fields.path = Some(path.as_str().to_owned());
                }
                (field::INTERFACE, Value::Str(interface)) => {
                    if interface.as_str() == LOCAL_INTERFACE {
                        return Err(MessageError::InvalidHeader);
                    }
                    fields.interface = Some(interface.as_str().to_owned());
                }
                (field::MEMBER, Value::Str(member)) => {
                    fields.member = Some(member.as_str().to_owned());
                }
                (field::ERROR_NAME, Value::Str(name)) => {
                    fields.error_name = Some(name.as_str().to_owned());
                }
                (field::REPLY_SERIAL, Value::U32(reply_serial)) => {
                    if *reply_serial == 0 {
                        return Err(MessageError::InvalidHeader);
                    }
                    fields.reply_serial = Some(*reply_serial);
                }
                (field::DESTINATION, Value::Str(destination)) => {
                    fields.destination = Some(destination.as_str().to_owned());
                }
                (field::SENDER, Value::Str(name)) => {
                    fields.sender = Some(name.as_str().to_owned());
                    sender = Some(start + SENDER_STRING_OFFSET);
                }
                (field::SIGNATURE, Value::Signature(signature)) => {
                    fields.signature = Some(signature.as_str().to_owned());
                }
                (field::UNIX_FDS, Value::U32(n_fds)) => {
                    if *n_fds as usize > self.fds.len() {
                        return Err(MessageError::InvalidHeader);
                    }
                    fields.unix_fds = *n_fds;
                }
                _ => return Err(MessageError::InvalidHeader),
            }
        }
        if offset != self.n_header {
            return Err(MessageError::InvalidHeader);
        }

        let mandatory = match meta.header.message_type() {
            Some(MessageType::MethodCall) => field::bit(field::PATH) | field::bit(field::MEMBER),
            Some(MessageType::MethodReturn) => field::bit(field::REPLY_SERIAL),
            Some(MessageType::Error) => {
                field::bit(field::ERROR_NAME) | field::bit(field::REPLY_SERIAL)
            }
            Some(MessageType::Signal) => {
                field::bit(field::PATH) | field::bit(field::INTERFACE) | field::bit(field::MEMBER)
            }
            None => 0,
        };
        if meta.fields.available & mandatory != mandatory {
            return Err(MessageError::InvalidHeader);
        }

        if let Some(signature) = meta.fields.signature.as_deref() {
            meta.args = wire::string_args(self.body(), signature, self.big_endian, wire::MAX_ARGS);
        }

        Ok((meta, sender))
    }

    /// Replace the sender field with the unique name of `sender_id`.
    ///
    /// Any existing sender field is cut out of the header segment and the
    /// new field appended after the remaining fields. May be called once,
    /// and only on a parsed message.
    pub fn stitch_sender(&mut self, sender_id: PeerId) {
        assert!(self.parsed, "stitching an unparsed message");
        assert!(
            self.rest.len == 0 && self.stitch.is_empty(),
            "sender already stitched"
        );

        let sender = unique_name_from_id(sender_id);
        let n_sender = sender.len();
        let n_field = 1 + 3 + 4 + n_sender + 1;
        let mut stitch = Vec::with_capacity(align8(n_field));

        if let Some(offset) = self.sender {
            let old_len = self.metadata.fields.sender.as_ref().map_or(0, String::len);
            let field_start = offset - (1 + 3 + 4);
            let field_end = field_start + align8(1 + 3 + 4 + old_len + 1);
            let header_end = self.head.start + self.head.len;
            assert!(field_end <= header_end);

            self.rest = Segment {
                start: field_end,
                len: header_end - field_end,
            };
            self.head.len = field_start - self.head.start;
        }

        stitch.push(field::SENDER);
        stitch.extend_from_slice(&[1, b's', 0]);
        let encoded = if self.big_endian {
            (n_sender as u32).to_be_bytes()
        } else {
            (n_sender as u32).to_le_bytes()
        };
        stitch.extend_from_slice(&encoded);
        stitch.extend_from_slice(sender.as_bytes());
        stitch.push(0);
        stitch.resize(align8(n_field), 0);
        self.stitch = stitch;

        self.n_header = self.head.len + self.rest.len + n_field;
        self.n_data = align8(self.n_header) + self.n_body;

        let n_fields = (self.n_header - HEADER_SIZE) as u32;
        let encoded = if self.big_endian {
            n_fields.to_be_bytes()
        } else {
            n_fields.to_le_bytes()
        };
        self.data[12..16].copy_from_slice(&encoded);

        self.sender = None;
        self.sender_id = Some(sender_id);
        self.metadata.fields.sender = Some(sender);
        self.metadata.fields.available |= field::bit(field::SENDER);
    }

    /// The logical wire stream, in order.
    pub fn segments(&self) -> [&[u8]; 4] {
        [
            &self.data[self.head.start..self.head.start + self.head.len],
            &self.data[self.rest.start..self.rest.start + self.rest.len],
            &self.stitch,
            self.body(),
        ]
    }

    /// The wire stream from byte `offset` on, as `IoSlice`s for vectored
    /// writes. Empty segments are skipped.
    pub fn io_slices(&self, mut offset: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(4);
        for segment in self.segments() {
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            slices.push(IoSlice::new(&segment[offset..]));
            offset = 0;
        }
        slices
    }

    /// Reconstruct the logical wire stream as one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.n_data);
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        out
    }
}

/// Builder for messages the broker originates (driver replies and signals).
///
/// Output is in host byte order unless overridden; the body is encoded with
/// zvariant against an explicitly given signature.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    msg_type: MessageType,
    flags: u8,
    serial: u32,
    big_endian: bool,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: String,
    body: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: 0,
            serial: 1,
            big_endian: protocol::ENDIAN_NATIVE == ENDIAN_BIG,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    pub fn method_call(path: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::MethodCall);
        builder.path = Some(path.to_owned());
        builder.member = Some(member.to_owned());
        builder
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::Signal);
        builder.path = Some(path.to_owned());
        builder.interface = Some(interface.to_owned());
        builder.member = Some(member.to_owned());
        builder
    }

    pub fn method_return(reply_serial: u32) -> Self {
        let mut builder = Self::new(MessageType::MethodReturn);
        builder.reply_serial = Some(reply_serial);
        builder
    }

    pub fn error(reply_serial: u32, error_name: &str) -> Self {
        let mut builder = Self::new(MessageType::Error);
        builder.reply_serial = Some(reply_serial);
        builder.error_name = Some(error_name.to_owned());
        builder
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_owned());
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Encode `body` as the message arguments described by `signature`.
    pub fn body<B>(mut self, signature: &str, body: &B) -> Result<Self>
    where
        B: Serialize + Type,
    {
        let encoded = zbus::zvariant::to_bytes(wire::context(self.big_endian, 0), body)?;
        self.body = encoded.bytes().to_vec();
        self.signature = signature.to_owned();
        Ok(self)
    }

    /// Marshal the header and hand the buffer to [`Message::new_outgoing`].
    ///
    /// Names and paths are checked against the D-Bus naming rules.
    pub fn build(self) -> Result<Message> {
        let mut fields: Vec<(u8, Value<'_>)> = Vec::new();
        if let Some(path) = self.path.as_deref() {
            fields.push((field::PATH, ObjectPath::try_from(path)?.into()));
        }
        if let Some(interface) = self.interface.as_deref() {
            InterfaceName::try_from(interface)?;
            fields.push((field::INTERFACE, interface.into()));
        }
        if let Some(member) = self.member.as_deref() {
            MemberName::try_from(member)?;
            fields.push((field::MEMBER, member.into()));
        }
        if let Some(error_name) = self.error_name.as_deref() {
            ErrorName::try_from(error_name)?;
            fields.push((field::ERROR_NAME, error_name.into()));
        }
        if let Some(destination) = self.destination.as_deref() {
            BusName::try_from(destination)?;
            fields.push((field::DESTINATION, destination.into()));
        }
        if let Some(sender) = self.sender.as_deref() {
            BusName::try_from(sender)?;
            fields.push((field::SENDER, sender.into()));
        }
        if let Some(reply_serial) = self.reply_serial {
            fields.push((field::REPLY_SERIAL, reply_serial.into()));
        }
        if !self.signature.is_empty() {
            fields.push((field::SIGNATURE, Signature::try_from(self.signature.as_str())?.into()));
        }

        let header: RawHeader<'_> = (
            if self.big_endian { ENDIAN_BIG } else { ENDIAN_LITTLE },
            self.msg_type as u8,
            self.flags,
            PROTOCOL_VERSION,
            self.body.len() as u32,
            self.serial,
            fields,
        );
        let encoded = zbus::zvariant::to_bytes(wire::context(self.big_endian, 0), &header)?;

        let mut data = encoded.bytes().to_vec();
        data.resize(align8(data.len()), 0);
        data.extend_from_slice(&self.body);

        Ok(Message::new_outgoing(data)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn incoming(bytes: &[u8]) -> Message {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let mut msg = Message::new_incoming(MessageHeader(header)).unwrap();
        msg.tail_mut().copy_from_slice(&bytes[HEADER_SIZE..]);
        msg
    }

    fn header_with(endian: u8, n_body: u32, n_fields: u32) -> MessageHeader {
        let mut h = [0u8; HEADER_SIZE];
        h[0] = endian;
        h[1] = 1;
        h[3] = 1;
        h[4..8].copy_from_slice(&n_body.to_le_bytes());
        h[8..12].copy_from_slice(&1u32.to_le_bytes());
        h[12..16].copy_from_slice(&n_fields.to_le_bytes());
        MessageHeader(h)
    }

    #[test]
    fn test_corrupt_endian_marker() {
        let err = Message::new_incoming(header_with(b'x', 0, 0)).unwrap_err();
        assert_eq!(err, MessageError::CorruptHeader);
    }

    #[test]
    fn test_too_large() {
        let err = Message::new_incoming(header_with(b'l', u32::MAX, 16)).unwrap_err();
        assert_eq!(err, MessageError::TooLarge);

        let limit = MESSAGE_SIZE_MAX as u32;
        let err = Message::new_incoming(header_with(b'l', limit - 8, 1)).unwrap_err();
        assert_eq!(err, MessageError::TooLarge);
    }

    #[test]
    fn test_outgoing_fixes_body_length() {
        let mut bytes = MessageBuilder::method_call("/", "Ping").build().unwrap().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes[4..8].copy_from_slice(&[0xff; 4]);

        let msg = Message::new_outgoing(bytes).unwrap();
        assert_eq!(msg.body(), &[1, 2, 3]);
        let out = msg.to_vec();
        let n_body = if msg.is_big_endian() {
            u32::from_be_bytes([out[4], out[5], out[6], out[7]])
        } else {
            u32::from_le_bytes([out[4], out[5], out[6], out[7]])
        };
        assert_eq!(n_body, 3);
    }

    #[test]
    fn test_parse_builder_output() {
        let bytes = MessageBuilder::signal("/org/example", "org.example.Iface", "Changed")
            .serial(9)
            .body("su", &("hello", 7u32))
            .unwrap()
            .build()
            .unwrap()
            .to_vec();

        let mut msg = incoming(&bytes);
        let meta = msg.parse_metadata().unwrap();
        assert_eq!(meta.header.message_type(), Some(MessageType::Signal));
        assert_eq!(meta.header.serial, 9);
        assert_eq!(meta.fields.path.as_deref(), Some("/org/example"));
        assert_eq!(meta.fields.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(meta.fields.member.as_deref(), Some("Changed"));
        assert_eq!(meta.fields.signature.as_deref(), Some("su"));
        assert_eq!(meta.args, vec![Some(Arg::Str("hello".into())), None]);
        assert!(msg.is_parsed());
    }

    #[test]
    fn test_missing_member_rejected() {
        let mut builder = MessageBuilder::method_call("/", "Ping");
        builder.member = None;
        let mut msg = incoming(&builder.build().unwrap().to_vec());
        assert_eq!(msg.parse_metadata().unwrap_err(), MessageError::InvalidHeader);
    }

    #[test]
    fn test_local_path_rejected() {
        let bytes = MessageBuilder::method_call(LOCAL_PATH, "Ping")
            .build()
            .unwrap()
            .to_vec();
        let mut msg = incoming(&bytes);
        assert_eq!(msg.parse_metadata().unwrap_err(), MessageError::InvalidHeader);
    }

    #[test]
    fn test_zero_serial_rejected() {
        let bytes = MessageBuilder::method_call("/", "Ping")
            .serial(0)
            .build()
            .unwrap()
            .to_vec();
        let mut msg = incoming(&bytes);
        assert_eq!(msg.parse_metadata().unwrap_err(), MessageError::InvalidHeader);
    }

    #[test]
    fn test_stitch_without_sender() {
        let mut msg = MessageBuilder::method_call("/", "Ping").build().unwrap();
        msg.parse_metadata().unwrap();
        let before = msg.header_len();

        msg.stitch_sender(5);
        // ":1.5" -> 1 + 3 + 4 + 4 + 1 = 13 bytes, appended after aligned fields
        assert_eq!(msg.header_len(), align8(before) + 13);
        assert_eq!(msg.sender_id(), Some(5));

        let mut reparsed = incoming(&msg.to_vec());
        let meta = reparsed.parse_metadata().unwrap();
        assert_eq!(meta.fields.sender.as_deref(), Some(":1.5"));
        assert_eq!(meta.fields.member.as_deref(), Some("Ping"));
    }

    #[test]
    fn test_stitch_replaces_sender() {
        for big_endian in [false, true] {
            let msg = MessageBuilder::method_call("/a", "Call")
                .big_endian(big_endian)
                .sender(":1.99999")
                .destination("org.example.Service")
                .body("s", &"payload")
                .unwrap()
                .build()
                .unwrap();
            let mut msg = incoming(&msg.to_vec());
            msg.parse_metadata().unwrap();
            msg.stitch_sender(3);

            let bytes = msg.to_vec();
            assert_eq!(bytes.len(), msg.len());
            let mut reparsed = incoming(&bytes);
            let meta = reparsed.parse_metadata().unwrap().clone();
            assert_eq!(meta.fields.sender.as_deref(), Some(":1.3"));
            assert_eq!(
                meta.fields.destination.as_deref(),
                Some("org.example.Service")
            );
            assert_eq!(meta.args, vec![Some(Arg::Str("payload".into()))]);
            assert!(!bytes.windows(8).any(|w| w == b":1.99999"));
        }
    }

    #[test]
    #[should_panic(expected = "sender already stitched")]
    fn test_stitch_twice_panics() {
        let mut msg = MessageBuilder::method_call("/", "Ping").build().unwrap();
        msg.parse_metadata().unwrap();
        msg.stitch_sender(1);
        msg.stitch_sender(2);
    }

    #[test]
    #[should_panic(expected = "unparsed")]
    fn test_stitch_unparsed_panics() {
        let mut msg = MessageBuilder::method_call("/", "Ping").build().unwrap();
        msg.stitch_sender(1);
    }

    #[test]
    fn test_io_slices_skip_empty_segments() {
        let mut msg = MessageBuilder::method_call("/", "Ping").build().unwrap();
        assert_eq!(msg.io_slices(0).len(), 1);
        msg.parse_metadata().unwrap();
        msg.stitch_sender(1);
        assert_eq!(msg.io_slices(0).len(), 2);
    }

    #[test]
    fn test_io_slices_from_offset() {
        let mut msg = MessageBuilder::method_call("/", "Ping")
            .body("s", &"payload")
            .unwrap()
            .build()
            .unwrap();
        msg.parse_metadata().unwrap();
        msg.stitch_sender(1);
        let full = msg.to_vec();

        for offset in [0, 1, msg.header_len(), full.len() - 1, full.len()] {
            let joined: Vec<u8> = msg
                .io_slices(offset)
                .iter()
                .flat_map(|slice| slice.iter().copied())
                .collect();
            assert_eq!(joined, full[offset..]);
        }
        assert!(msg.io_slices(full.len()).is_empty());
    }

    /// A little-endian method call whose field array is exactly `fields`.
    fn with_fields(fields: Vec<(u8, Value<'_>)>) -> Message {
        let header: RawHeader<'_> = (
            ENDIAN_LITTLE,
            MessageType::MethodCall as u8,
            0,
            PROTOCOL_VERSION,
            0,
            1,
            fields,
        );
        let mut bytes = zbus::zvariant::to_bytes(wire::context(false, 0), &header)
            .unwrap()
            .bytes()
            .to_vec();
        bytes.resize(align8(bytes.len()), 0);
        incoming(&bytes)
    }

    fn ping_fields() -> Vec<(u8, Value<'static>)> {
        vec![
            (field::PATH, ObjectPath::try_from("/").unwrap().into()),
            (field::MEMBER, "Ping".into()),
        ]
    }

    fn dev_null_fds(n: usize) -> Vec<OwnedFd> {
        (0..n)
            .map(|_| OwnedFd::from(std::fs::File::open("/dev/null").unwrap()))
            .collect()
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut fields = ping_fields();
        fields.push((field::MEMBER, "Pong".into()));
        let mut msg = with_fields(fields);
        assert_eq!(msg.parse_metadata().unwrap_err(), MessageError::InvalidHeader);
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut properties: HashMap<&str, Value<'_>> = HashMap::new();
        properties.insert("Volume", Value::from(42u32));

        let mut fields = ping_fields();
        fields.insert(0, (200, Value::from(properties)));
        fields.push((field::N, Value::from(7u32)));
        fields.push((field::INTERFACE, "org.example.Iface".into()));

        let mut msg = with_fields(fields);
        let meta = msg.parse_metadata().unwrap();
        assert_eq!(meta.fields.member.as_deref(), Some("Ping"));
        assert_eq!(meta.fields.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(meta.fields.available & !(field::bit(field::N) - 1), 0);
    }

    #[test]
    fn test_unix_fds_beyond_attached_rejected() {
        let mut fields = ping_fields();
        fields.push((field::UNIX_FDS, Value::from(2u32)));
        let mut msg = with_fields(fields);
        msg.attach_fds(dev_null_fds(1));
        assert_eq!(msg.parse_metadata().unwrap_err(), MessageError::InvalidHeader);
    }

    #[test]
    fn test_unix_fds_truncates_attached() {
        for (declared, attached) in [(2u32, 2usize), (2, 3), (0, 1)] {
            let mut fields = ping_fields();
            fields.push((field::UNIX_FDS, Value::from(declared)));
            let mut msg = with_fields(fields);
            msg.attach_fds(dev_null_fds(attached));

            assert_eq!(msg.parse_metadata().unwrap().fields.unix_fds, declared);
            assert_eq!(msg.fds().len(), declared as usize);
        }
    }
}
