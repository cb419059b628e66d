//! Error types for kapsule-dbus-broker.

use thiserror::Error;

use crate::protocol::error_names;

/// Result type alias for kapsule-dbus-broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the broker.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Body encoding or decoding error from zvariant.
    #[error("D-Bus codec error: {0}")]
    Codec(#[from] zbus::zvariant::Error),

    /// A bus, interface, member or error name broke the naming rules.
    #[error("Invalid D-Bus name: {0}")]
    Name(#[from] zbus::names::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Wire-format error.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Routing or ownership error.
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Peer traffic that forces a disconnect.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The broker was shut down.
    #[error("Broker shut down")]
    Shutdown,
}

/// Authentication-related errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Expected the null byte at the start of authentication.
    #[error("Expected null byte at start of authentication")]
    ExpectedNullByte,

    /// A handshake line could not be understood in the current state.
    #[error("Unexpected handshake line: {0}")]
    UnexpectedLine(String),

    /// Handshake line exceeded the permitted length.
    #[error("Handshake line too long")]
    LineTooLong,

    /// The peer went away before completing the handshake.
    #[error("Connection closed during authentication")]
    Eof,

    /// The peer rejected every mechanism we offered.
    #[error("Authentication rejected: {0}")]
    Rejected(String),
}

/// Wire-format errors raised while constructing or parsing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The byte-order marker is neither 'l' nor 'B'.
    #[error("corrupt message header")]
    CorruptHeader,

    /// The declared size exceeds the permitted maximum.
    #[error("message too large")]
    TooLarge,

    /// Structural or semantic violation in the header.
    #[error("invalid message header")]
    InvalidHeader,
}

/// Routing, ownership, match and reply errors.
///
/// Every variant corresponds to exactly one D-Bus level outcome; see
/// [`PeerError::dbus_error_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerError {
    /// A resource limit of the sending or receiving user was hit.
    #[error("quota exceeded")]
    Quota,
    /// The receiving connection is gone or not accepting messages.
    #[error("connection refused")]
    ConnectionRefused,
    /// The sender's policy does not allow this message.
    #[error("send denied")]
    SendDenied,
    /// The receiver's policy does not allow this message.
    #[error("receive denied")]
    ReceiveDenied,
    /// The name is reserved for the bus itself.
    #[error("name reserved")]
    NameReserved,
    /// Unique names cannot be requested or released.
    #[error("unique names cannot be owned")]
    NameUnique,
    /// Policy refused ownership of the name.
    #[error("name ownership refused")]
    NameRefused,
    /// The caller already is the primary owner.
    #[error("already owner")]
    NameAlreadyOwner,
    /// The caller was placed in the name's queue.
    #[error("in queue")]
    NameInQueue,
    /// The name has an owner and the caller did not want to queue.
    #[error("name exists")]
    NameExists,
    /// Nobody holds a claim on the name.
    #[error("name not found")]
    NameNotFound,
    /// The caller holds no claim on the name.
    #[error("not owner")]
    NameNotOwner,
    /// The match rule could not be parsed.
    #[error("invalid match rule")]
    MatchInvalid,
    /// No identical match rule is installed.
    #[error("match rule not found")]
    MatchNotFound,
    /// A reply with this serial is already expected.
    #[error("expected reply exists")]
    ExpectedReplyExists,
    /// No reply with this serial is expected.
    #[error("unexpected reply")]
    UnexpectedReply,
}

impl PeerError {
    /// The D-Bus error name a driver reply should carry for this error.
    pub fn dbus_error_name(self) -> &'static str {
        match self {
            PeerError::Quota => error_names::LIMITS_EXCEEDED,
            PeerError::ConnectionRefused => error_names::NO_REPLY,
            PeerError::SendDenied | PeerError::ReceiveDenied | PeerError::NameRefused => {
                error_names::ACCESS_DENIED
            }
            PeerError::NameReserved | PeerError::NameUnique => error_names::INVALID_ARGS,
            PeerError::NameAlreadyOwner
            | PeerError::NameInQueue
            | PeerError::NameExists
            | PeerError::NameNotFound
            | PeerError::NameNotOwner => error_names::FAILED,
            PeerError::MatchInvalid => error_names::MATCH_RULE_INVALID,
            PeerError::MatchNotFound => error_names::MATCH_RULE_NOT_FOUND,
            PeerError::ExpectedReplyExists | PeerError::UnexpectedReply => {
                error_names::ACCESS_DENIED
            }
        }
    }
}

/// Reasons the driver asks the transport to drop a peer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message failed wire validation.
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),

    /// The peer broke the bus protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The peer is not known to the registry.
    #[error("unknown peer: {0}")]
    UnknownPeer(u64),
}
