//! D-Bus wire constants and name helpers.

use zbus::names::{BusName, WellKnownName};
use zbus::zvariant::ObjectPath;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 16;

/// Largest message (aligned header plus body) the broker accepts.
pub const MESSAGE_SIZE_MAX: u64 = 128 * 1024 * 1024;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Byte-order marker for little-endian messages.
pub const ENDIAN_LITTLE: u8 = b'l';
/// Byte-order marker for big-endian messages.
pub const ENDIAN_BIG: u8 = b'B';

/// Byte-order marker matching the host.
pub const ENDIAN_NATIVE: u8 = if cfg!(target_endian = "big") {
    ENDIAN_BIG
} else {
    ENDIAN_LITTLE
};

/// Bus name, object path and interface of the driver.
pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const DBUS_INTERFACE_MONITORING: &str = "org.freedesktop.DBus.Monitoring";
pub const DBUS_INTERFACE_PEER: &str = "org.freedesktop.DBus.Peer";

/// Reserved local path; messages must never carry it.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
/// Reserved local interface; messages must never carry it.
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    /// Reserved "invalid" type code.
    pub const INVALID: u8 = 0;

    /// Map a raw type byte to a known type.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }

    /// Name used by match rules (`type='...'`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }

    /// Parse a match-rule type name.
    pub fn from_match_str(s: &str) -> Option<Self> {
        match s {
            "method_call" => Some(Self::MethodCall),
            "method_return" => Some(Self::MethodReturn),
            "error" => Some(Self::Error),
            "signal" => Some(Self::Signal),
            _ => None,
        }
    }
}

/// Header flags.
pub mod flags {
    pub const NO_REPLY_EXPECTED: u8 = 0x1;
    pub const NO_AUTO_START: u8 = 0x2;
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;
}

/// Header field tags.
pub mod field {
    pub const INVALID: u8 = 0;
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;

    /// Number of known tags; anything at or above is skipped.
    pub const N: u8 = 10;

    /// Presence bit of a tag in a field mask.
    pub const fn bit(tag: u8) -> u32 {
        1u32 << tag
    }
}

const _: () = assert!((field::N as u32) <= u32::BITS);

/// Request name flags (D-Bus protocol).
pub mod request_name_flags {
    /// Allow replacement of this owner by another connection.
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    /// Attempt to replace the existing owner if possible.
    pub const REPLACE_EXISTING: u32 = 0x2;
    /// Don't queue if the name is already owned - return immediately.
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Request name reply codes (D-Bus protocol).
pub mod request_name_reply {
    pub const PRIMARY_OWNER: u32 = 1;
    pub const IN_QUEUE: u32 = 2;
    pub const EXISTS: u32 = 3;
    pub const ALREADY_OWNER: u32 = 4;
}

/// Release name reply codes (D-Bus protocol).
pub mod release_name_reply {
    pub const RELEASED: u32 = 1;
    pub const NON_EXISTENT: u32 = 2;
    pub const NOT_OWNER: u32 = 3;
}

/// Common D-Bus error names.
pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const UNIX_PROCESS_ID_UNKNOWN: &str = "org.freedesktop.DBus.Error.UnixProcessIdUnknown";
}

/// Identifier of a connected peer.
pub type PeerId = u64;

/// Render a peer id as its unique bus name (":1.<id>").
pub fn unique_name_from_id(id: PeerId) -> String {
    format!(":1.{}", id)
}

/// Parse a unique bus name back to a peer id.
///
/// Only names this broker hands out are accepted; leading zeros are not.
pub fn unique_name_to_id(name: &str) -> Option<PeerId> {
    let digits = name.strip_prefix(":1.")?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Check a well-known bus name against the D-Bus naming rules.
pub fn is_valid_well_known_name(name: &str) -> bool {
    WellKnownName::try_from(name).is_ok()
}

/// Check any bus name (unique or well-known).
pub fn is_valid_bus_name(name: &str) -> bool {
    BusName::try_from(name).is_ok()
}

/// Check object path syntax.
pub fn is_valid_object_path(path: &str) -> bool {
    ObjectPath::try_from(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_roundtrip() {
        assert_eq!(unique_name_from_id(42), ":1.42");
        assert_eq!(unique_name_to_id(":1.42"), Some(42));
        assert_eq!(unique_name_to_id(":1.0"), Some(0));
    }

    #[test]
    fn test_unique_name_rejects_foreign_forms() {
        assert_eq!(unique_name_to_id(":1.042"), None);
        assert_eq!(unique_name_to_id(":2.4"), None);
        assert_eq!(unique_name_to_id(":1."), None);
        assert_eq!(unique_name_to_id(":1.4a"), None);
        assert_eq!(unique_name_to_id("org.example"), None);
    }

    #[test]
    fn test_valid_well_known_name() {
        for name in [
            "com.example.foo",
            "org.freedesktop.DBus",
            "org._7_zip.Archiver",
            "com.example.test-name",
            "_com.example.test",
        ] {
            assert!(is_valid_well_known_name(name), "{} should be valid", name);
        }

        for name in ["org", ".com.example", "com..example", "", ":1.42", "org.7zip"] {
            assert!(!is_valid_well_known_name(name), "{} should be invalid", name);
        }
    }

    #[test]
    fn test_valid_bus_name() {
        assert!(is_valid_bus_name(":1.42"));
        assert!(is_valid_bus_name("org.example.Service"));
        assert!(!is_valid_bus_name(":"));
        assert!(!is_valid_bus_name(":1..2"));
    }

    #[test]
    fn test_object_path_validation() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/freedesktop/DBus"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("/org/"));
        assert!(!is_valid_object_path("org/example"));
        assert!(!is_valid_object_path("/org//example"));
        assert!(!is_valid_object_path("/org/ex-ample"));
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::MethodCall));
        assert_eq!(MessageType::from_u8(4), Some(MessageType::Signal));
        assert_eq!(MessageType::from_u8(MessageType::INVALID), None);
        assert_eq!(MessageType::from_u8(9), None);
        assert_eq!(
            MessageType::from_match_str("method_return"),
            Some(MessageType::MethodReturn)
        );
    }
}
