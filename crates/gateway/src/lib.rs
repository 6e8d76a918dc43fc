//! Gateway core: WebSocket termination bridged to the message bus.
//!
//! Lifecycle of a connection:
//! 1. HTTP upgrade on `/` with a bearer token in the subprotocol header
//! 2. Token validation, identity extraction
//! 3. Registration in the connection registry, `onConnect` on the bus
//! 4. One reader task per connection turning frames into bus envelopes
//! 5. Removal + `onClose` when the reader exits; admin commands and the
//!    admission sweeper close connections out-of-band
//!
//! The bus side (transport, process wrapper, token issuance) lives in the
//! sibling crates and is reached through their narrow interfaces.

pub mod commands;
pub mod connection;
pub mod registry;
pub mod server;

pub use {
    connection::{Connection, ConnectionError, ConnectionInfo},
    registry::{Registry, RegistryError, RegistryStats},
    server::GatewayServer,
};
