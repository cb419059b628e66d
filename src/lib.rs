//! kapsule-dbus-broker - routing core of a D-Bus message bus.
//!
//! Peers connect over a Unix socket, authenticate, and exchange messages
//! through the [`Bus`]: unicast calls with reply tracking, broadcast signals
//! filtered by match rules, well-known name ownership with queueing, and the
//! `org.freedesktop.DBus` driver interface served by the [`Driver`].

pub mod auth;
pub mod bus;
pub mod driver;
pub mod error;
pub mod match_rules;
pub mod message;
pub mod name_registry;
pub mod peer;
pub mod policy;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod user;
pub mod wire;

pub use bus::{Bus, BusConfig};
pub use driver::Driver;
pub use error::{Error, Result};
pub use server::Broker;
