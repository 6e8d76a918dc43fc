//! In-memory index of live connections.
//!
//! The registry is the sole authoritative index. User and device queries are
//! linear scans — connection counts per process are O(10⁴) and secondary
//! indices are not worth their bookkeeping. Mutation takes the exclusive
//! lock; queries take the shared lock.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use wsbridge_protocol::{ConnectionId, DeviceId, UserId};

use crate::connection::Connection;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyPresent(ConnectionId),
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered connections with no user identity.
    pub not_logged: usize,
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    not_logged: usize,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Ids are process-monotonic, so a duplicate is a
    /// programmer error surfaced as [`RegistryError::AlreadyPresent`].
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let id = connection.raw_id();
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&id) {
            return Err(RegistryError::AlreadyPresent(id));
        }
        if connection.user_id().is_unknown() {
            inner.not_logged += 1;
        }
        inner.by_id.insert(id, connection);
        Ok(())
    }

    /// Remove a connection and mark it tombstoned. No-op for connections
    /// that are absent or already tombstoned. Returns whether an entry was
    /// actually removed.
    pub fn remove(&self, connection: &Connection) -> bool {
        if connection.is_removed() {
            return false;
        }
        let mut inner = self.inner.write();
        let Some(stored) = inner.by_id.remove(&connection.raw_id()) else {
            return false;
        };
        if stored.user_id().is_unknown() {
            inner.not_logged -= 1;
        }
        stored.mark_removed();
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Snapshot of every connection logged in as `user_id`.
    pub fn user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|c| c.matches_user(user_id))
            .cloned()
            .collect()
    }

    /// Snapshot of every connection logged in as `(user_id, device_id)`.
    pub fn device_connections(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|c| c.matches_device(user_id, device_id))
            .cloned()
            .collect()
    }

    /// Remove every connection matching `predicate`, then run `after_remove`
    /// on the removed set **while still holding the exclusive lock**.
    ///
    /// `after_remove` must not call back into the registry — doing so
    /// deadlocks. Closing the removed connections is safe: they are already
    /// out of the map and `Connection::close` only queues a frame.
    pub fn remove_if(
        &self,
        predicate: impl Fn(&Connection) -> bool,
        after_remove: impl FnOnce(&[Arc<Connection>]),
    ) {
        let mut inner = self.inner.write();
        let matching: Vec<ConnectionId> = inner
            .by_id
            .iter()
            .filter(|(_, connection)| predicate(connection))
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::with_capacity(matching.len());
        for id in matching {
            if let Some(connection) = inner.by_id.remove(&id) {
                if connection.user_id().is_unknown() {
                    inner.not_logged -= 1;
                }
                connection.mark_removed();
                removed.push(connection);
            }
        }
        after_remove(&removed);
    }

    pub fn remove_user_connections(
        &self,
        user_id: &UserId,
        after_remove: impl FnOnce(&[Arc<Connection>]),
    ) {
        self.remove_if(|c| c.matches_user(user_id), after_remove);
    }

    pub fn remove_device_connections(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        after_remove: impl FnOnce(&[Arc<Connection>]),
    ) {
        self.remove_if(|c| c.matches_device(user_id, device_id), after_remove);
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            not_logged: self.inner.read().not_logged,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}
