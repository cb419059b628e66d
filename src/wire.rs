//! Layout helpers and body argument extraction.
//!
//! Marshalling itself is zvariant's job; this module only holds the bits the
//! broker needs on top of it.

use tracing::trace;
use zbus::zvariant::serialized::{Context, Data};
use zbus::zvariant::{Endian, Structure, Value};

/// Maximum number of body arguments a match rule can refer to.
pub const MAX_ARGS: usize = 64;

/// Round `n` up to a multiple of 8.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

pub fn endian(big_endian: bool) -> Endian {
    if big_endian {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// D-Bus encoding context for a buffer starting at `position`.
pub fn context(big_endian: bool, position: usize) -> Context {
    Context::new_dbus(endian(big_endian), position)
}

/// A string-like body argument, as seen by match rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// A STRING argument.
    Str(String),
    /// An OBJECT_PATH argument.
    Path(String),
}

impl Arg {
    pub fn as_str(&self) -> &str {
        match self {
            Arg::Str(s) | Arg::Path(s) => s,
        }
    }
}

/// Extract up to `max` leading body arguments.
///
/// The body is decoded as one structure of the message signature. Positions
/// holding non-string types are `None`; a body that does not decode yields
/// no arguments at all.
pub fn string_args(body: &[u8], signature: &str, big_endian: bool, max: usize) -> Vec<Option<Arg>> {
    if !signature.bytes().any(|b| b == b's' || b == b'o') {
        return Vec::new();
    }

    let wrapped = format!("({})", signature);
    let data = Data::new(body, context(big_endian, 0));
    let decoded: zbus::zvariant::Result<(Structure<'_>, usize)> =
        data.deserialize_for_dynamic_signature(wrapped.as_str());
    let structure = match decoded {
        Ok((structure, _)) => structure,
        Err(e) => {
            trace!(signature = signature, error = %e, "Body does not decode, no match arguments");
            return Vec::new();
        }
    };

    structure
        .fields()
        .iter()
        .take(max.min(MAX_ARGS))
        .map(|value| match value {
            Value::Str(s) => Some(Arg::Str(s.as_str().to_owned())),
            Value::ObjectPath(path) => Some(Arg::Path(path.as_str().to_owned())),
            _ => None,
        })
        .collect()
}
