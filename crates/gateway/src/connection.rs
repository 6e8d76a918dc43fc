//! A single upgraded WebSocket connection.
//!
//! The connection object is shared between the registry, the per-connection
//! reader, and bus-command dispatch. The socket's write half is owned by one
//! writer task fed through an unbounded channel, which serializes all writes
//! (data frames and the close frame) without an explicit socket mutex.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{SinkExt, stream::SplitSink},
    parking_lot::{Mutex, RwLock},
    tokio::sync::mpsc,
    tracing::debug,
};

use wsbridge_protocol::{ConnectionId, DeviceId, UserId};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is closed")]
    ClosedConnection,
    #[error("connection is already logged in")]
    AlreadyLoggedIn,
}

// ── Outbound frames ──────────────────────────────────────────────────────────

/// Frames queued for the writer task. `Close` is terminal: the writer sends
/// the close frame and drops the socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

// ── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Identity {
    user_id: UserId,
    device_id: DeviceId,
    logged_in: bool,
}

/// Stable snapshot of a connection's identity.
///
/// `id` is [`ConnectionId::TOMBSTONE`] once the connection has been removed
/// from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
}

pub struct Connection {
    id: ConnectionId,
    identity: RwLock<Identity>,
    outbound: mpsc::UnboundedSender<Outbound>,
    started_at: Instant,
    last_ping: Mutex<Instant>,
    closed: AtomicBool,
    removed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity: RwLock::new(Identity::default()),
            outbound,
            started_at: now,
            last_ping: Mutex::new(now),
            closed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_started_at(
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
        started_at: Instant,
    ) -> Self {
        Self {
            started_at,
            last_ping: Mutex::new(started_at),
            ..Self::new(id, outbound)
        }
    }

    /// The id assigned at upgrade time. Registry bookkeeping only; everyone
    /// else should read [`Connection::info`], which respects the tombstone.
    pub(crate) fn raw_id(&self) -> ConnectionId {
        self.id
    }

    /// Bind an identity to the connection, exactly once. Repeating the same
    /// identity is a no-op; a different one is rejected.
    pub fn login(&self, user_id: UserId, device_id: DeviceId) -> Result<(), ConnectionError> {
        let mut identity = self.identity.write();
        if identity.logged_in {
            if identity.user_id == user_id && identity.device_id == device_id {
                return Ok(());
            }
            return Err(ConnectionError::AlreadyLoggedIn);
        }
        *identity = Identity {
            user_id,
            device_id,
            logged_in: true,
        };
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.identity.read().logged_in
    }

    pub fn user_id(&self) -> UserId {
        self.identity.read().user_id.clone()
    }

    pub(crate) fn matches_user(&self, user_id: &UserId) -> bool {
        self.identity.read().user_id == *user_id
    }

    pub(crate) fn matches_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        let identity = self.identity.read();
        identity.user_id == *user_id && identity.device_id == *device_id
    }

    pub fn info(&self) -> ConnectionInfo {
        let identity = self.identity.read();
        ConnectionInfo {
            id: if self.removed.load(Ordering::Acquire) {
                ConnectionId::TOMBSTONE
            } else {
                self.id
            },
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.clone(),
        }
    }

    /// Queue a text frame. Atomic with respect to other writes on this
    /// connection; fails once the connection is closed.
    pub fn send_text(&self, body: Vec<u8>) -> Result<(), ConnectionError> {
        self.send(Outbound::Text(body))
    }

    /// Queue a binary frame. Same contract as [`Connection::send_text`].
    pub fn send_binary(&self, body: Vec<u8>) -> Result<(), ConnectionError> {
        self.send(Outbound::Binary(body))
    }

    fn send(&self, frame: Outbound) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::ClosedConnection);
        }
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::ClosedConnection)
    }

    /// Close the socket with a status code and reason. Idempotent: only the
    /// first caller queues the close frame.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record read activity. Strictly non-decreasing.
    pub fn touch_last_ping(&self) {
        let mut last_ping = self.last_ping.lock();
        let now = Instant::now();
        if now > *last_ping {
            *last_ping = now;
        }
    }

    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock()
    }

    /// Registry-only: marks the connection as removed, turning its visible id
    /// into the tombstone.
    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let identity = self.identity.read();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &identity.user_id)
            .field("device_id", &identity.device_id)
            .field("logged_in", &identity.logged_in)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// ── Writer task ──────────────────────────────────────────────────────────────

/// Forward queued frames to the socket. Sole owner of the write half; exits
/// on the first close frame, write error, or once every sender is dropped.
/// Dropping the sink performs the underlying socket close.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        let result = match frame {
            Outbound::Text(body) => {
                let text = String::from_utf8_lossy(&body).into_owned();
                sink.send(Message::Text(text.into())).await
            },
            Outbound::Binary(body) => sink.send(Message::Binary(body.into())).await,
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        };
        if let Err(e) = result {
            debug!(error = %e, "socket write failed");
            break;
        }
    }
}
