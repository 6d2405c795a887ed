//! Registry of live chat connections.
//!
//! Every connection owns a bounded mpsc channel drained by its `WebSocket`
//! write loop. Fan-out goes through the [`ConnectionRegistry`] with
//! non-blocking `try_send`, so one slow peer never stalls a broadcast.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frame queued for delivery to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    /// Keepalive ping with an opaque payload.
    Ping(Vec<u8>),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Sending half of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
}

impl ConnectionHandle {
    /// Enqueues `msg` without waiting.
    ///
    /// Returns `false` if the channel is full or the connection is gone.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Whether the write loop still holds the receiving end.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of all open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its handle and the receiver its
    /// write loop must drain.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle { id, tx });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Queues `msg` for every open connection, skipping full or closed ones.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast(&self, msg: &OutboundMessage) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_connected())
            .filter(|entry| entry.value().try_send(msg.clone()))
            .count()
    }

    /// Removes and returns every connection.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
