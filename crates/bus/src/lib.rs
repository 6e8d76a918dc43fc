//! Client interface to the internal message bus.
//!
//! The gateway core only needs two operations: publish a message on a named
//! channel and subscribe to a channel's message stream. [`TcpBus`] is the
//! production implementation (JSON lines over TCP to the bus fabric);
//! [`MemoryBus`] is a loopback implementation for tests and standalone runs.

pub mod memory;
pub mod tcp;

use {async_trait::async_trait, tokio::sync::mpsc};

use wsbridge_protocol::BusMessage;

pub use {memory::MemoryBus, tcp::TcpBus};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("bus connection closed")]
    Closed,
    #[error("bus frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// ── Bus interface ────────────────────────────────────────────────────────────

/// Handle to the message bus.
///
/// Publish failures after startup are the caller's problem to log and drop;
/// the bus gives at-most-once delivery on the outbound path.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a message on `channel`.
    async fn publish(&self, channel: &str, message: BusMessage) -> Result<(), BusError>;

    /// Subscribe to `channel`. Messages arrive on the returned receiver until
    /// the bus connection drops.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError>;
}
