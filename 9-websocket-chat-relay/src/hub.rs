//! Connection registry and fan-out, independent of any socket type.
//!
//! The [`crate::server`] module feeds frames in and drains each
//! connection's [`Outbound`] queue into its WebSocket. Tests drive a `Hub`
//! directly through the same calls.

use std::{
    collections::HashMap,
    fmt::Display,
    net::SocketAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    message::{SystemNotice, normalize_payload},
};

pub type ConnectionId = u64;

/// Frames the hub asks the transport to write to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Handed to the transport for each accepted connection.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Flips to `true` when the hub terminates the connection. The sender is
    /// dropped once the connection leaves the set.
    pub terminated: watch::Receiver<bool>,
}

struct ConnectionRecord {
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<Outbound>,
    terminate: watch::Sender<bool>,
    alive: bool,
}

impl ConnectionRecord {
    /// Queues a close frame and tells the transport to stop, even if the
    /// queue is stuck behind a peer that stopped reading.
    fn terminate(&self) {
        let _ = self.sender.send(Outbound::Close);
        self.terminate.send_replace(true);
    }
}

pub struct Hub {
    config: HubConfig,
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a freshly opened connection and greets it if the welcome policy says so.
    pub fn accept(&self, peer: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::unbounded_channel();
        let (terminate, terminated) = watch::channel(false);

        let welcome = &self.config.welcome;
        if welcome.enabled {
            match SystemNotice::new(welcome.message.clone()).to_json() {
                // The receiver is still in our hands, so this cannot fail.
                Ok(text) => {
                    let _ = sender.send(Outbound::Text(text));
                }
                Err(error) => warn!(id, %error, "failed to encode welcome notice"),
            }
        }

        let mut connections = self.connections();
        connections.insert(
            id,
            ConnectionRecord {
                peer,
                sender,
                terminate,
                alive: true,
            },
        );
        info!(id, %peer, connections = connections.len(), "connection opened");

        Registration {
            id,
            outbound,
            terminated,
        }
    }

    /// Relays a text payload from `from` to every open connection, sender included.
    ///
    /// Returns the number of connections the payload was queued for.
    pub fn on_message(&self, from: ConnectionId, payload: &str) -> usize {
        debug!(from, payload, "message received");
        self.mark_alive(from);
        self.broadcast(normalize_payload(payload))
    }

    /// Queues `payload` for every open connection and prunes the ones that are gone.
    pub fn broadcast(&self, payload: String) -> usize {
        let mut connections = self.connections();
        // Unbounded sends never block, so fan-out happens under the lock and
        // every connection observes broadcasts in the same order.
        connections.retain(|id, record| {
            if record.sender.send(Outbound::Text(payload.clone())).is_ok() {
                true
            } else {
                debug!(id = *id, peer = %record.peer, "skipping closed connection");
                false
            }
        });
        connections.len()
    }

    /// Drops a connection after the peer closed it. Returns whether it was registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections();
        match connections.remove(&id) {
            Some(record) => {
                info!(id, peer = %record.peer, connections = connections.len(), "connection closed");
                true
            }
            None => false,
        }
    }

    /// Drops a connection whose transport failed. Other connections are unaffected.
    pub fn on_error(&self, id: ConnectionId, error: &dyn Display) -> bool {
        warn!(id, %error, "connection failed");
        self.remove(id)
    }

    /// Records that a connection answered since the last sweep.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(record) = self.connections().get_mut(&id) {
            record.alive = true;
        }
    }

    /// One liveness tick: terminates connections that stayed silent since the
    /// previous tick and pings the rest. Returns the evicted ids.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();
        let mut connections = self.connections();

        connections.retain(|id, record| {
            if !record.alive {
                warn!(id = *id, peer = %record.peer, "no answer to ping; terminating connection");
                record.terminate();
                evicted.push(*id);
                return false;
            }

            record.alive = false;
            if record.sender.send(Outbound::Ping).is_err() {
                evicted.push(*id);
                return false;
            }
            true
        });

        evicted
    }

    /// Closes every connection and empties the set.
    pub fn shutdown(&self) {
        let mut connections = self.connections();
        info!(connections = connections.len(), "hub shutting down");
        for record in connections.values() {
            record.terminate();
        }
        connections.clear();
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
