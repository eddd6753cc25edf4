//! Registry of live push connections, keyed by user ID.
//!
//! A [`ConnectionHandle`] is the registry's view of one WebSocket: a
//! bounded outbound queue drained by that connection's writer task, and a
//! cancellation token that stops both of its pumps. The registry never
//! touches the socket itself, so no I/O ever happens under its lock.
//!
//! # One connection per user
//!
//! A user holds at most one registered connection. [`insert`] replaces an
//! existing entry and closes the superseded handle while still holding the
//! lock, so there is no moment where two connections for the same user are
//! both registered or where the old one is silently leaked.
//!
//! Evictions are identity-aware: [`remove_connection`] only removes an
//! entry that still refers to the given connection, so the pumps of a
//! superseded connection cannot evict its replacement.
//!
//! [`insert`]: ConnectionRegistry::insert
//! [`remove_connection`]: ConnectionRegistry::remove_connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection.
pub type ConnectionId = u64;

/// Why a message could not be queued for a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is full; the client is not keeping up.
    #[error("outbound queue full")]
    Full,

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
}

/// Handle to one live push connection.
///
/// Clones refer to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: i64,
    outbound: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle for `user_id` along with the receiving end of its
    /// outbound queue, which the connection's writer task drains.
    pub fn channel(user_id: i64, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            outbound,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Token cancelled when the connection is closed.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues `message` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] if the queue is at capacity and
    /// [`SendError::Closed`] if the connection is closed.
    pub fn try_send(&self, message: Arc<str>) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// Concurrent map from user ID to that user's live connection.
///
/// Cloning is cheap and clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<i64, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handle` for its user.
    ///
    /// A connection already registered for that user is closed and
    /// returned.
    pub fn insert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id;
        let connection_id = handle.id;

        let replaced = {
            let mut connections = self.lock();
            let replaced = connections.insert(user_id, handle);
            if let Some(ref old) = replaced {
                old.close();
            }
            replaced
        };

        match replaced {
            Some(ref old) => debug!(
                user_id,
                connection_id,
                replaced_connection_id = old.id,
                "Connection replaced"
            ),
            None => debug!(user_id, connection_id, "Connection registered"),
        }
        replaced
    }

    /// Removes whatever connection is registered for `user_id`.
    ///
    /// The removed handle is returned as is; closing it is up to the caller.
    pub fn remove(&self, user_id: i64) -> Option<ConnectionHandle> {
        let removed = self.lock().remove(&user_id);
        if removed.is_some() {
            trace!(user_id, "Connection removed");
        }
        removed
    }

    /// Removes the entry for `user_id` only if it is still `connection_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_connection(&self, user_id: i64, connection_id: ConnectionId) -> bool {
        let mut connections = self.lock();
        match connections.get(&user_id) {
            Some(current) if current.id == connection_id => {
                connections.remove(&user_id);
                trace!(user_id, connection_id, "Connection removed");
                true
            }
            _ => false,
        }
    }

    /// Removes `handle` if it is still registered and closes it.
    ///
    /// Safe to call from every path that detects a failure; only the first
    /// call has any effect on the registry.
    pub fn evict(&self, handle: &ConnectionHandle) -> bool {
        handle.close();
        self.remove_connection(handle.user_id, handle.id)
    }

    /// Returns the connection registered for `user_id`.
    pub fn lookup(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.lock().get(&user_id).cloned()
    }

    /// Returns a copy of every registered connection.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
