use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use evcast_core::{ConnectionId, Event, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Serialized frame shared by every recipient of one broadcast.
pub type Outbound = Arc<String>;

/// Create the bounded outbound queue for one connection.
pub fn outbound_channel(capacity: usize) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
    mpsc::channel(capacity)
}

/// Why a frame could not be queued for a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client send queue full")]
    Full,
    #[error("client connection closed")]
    Closed,
    #[error("client not registered")]
    UnknownClient,
}

/// A registered observer. The registry holds the only sender of its
/// outbound queue, so dropping the client closes the queue and lets the
/// connection's writer drain and exit.
pub struct Client {
    tx: mpsc::Sender<Outbound>,
    last_seen: Mutex<Instant>,
}

impl Client {
    fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn send(&self, frame: Outbound) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the client as heard from just now.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client last sent anything.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Result of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Registry of all connected observers.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Client>,
    evictions: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Re-registering an id replaces the previous entry.
    pub fn register(&self, id: ConnectionId, tx: mpsc::Sender<Outbound>) {
        let _ = self.clients.insert(id.clone(), Client::new(tx));
        info!(conn_id = %id, clients = self.count(), "client registered");
    }

    /// Remove a client. Returns `false` if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.clients.remove(id).is_some();
        if removed {
            info!(conn_id = %id, clients = self.count(), "client unregistered");
        }
        removed
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Number of registered clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Clients removed because a send failed or they went silent.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Record inbound activity for heartbeat liveness.
    pub fn record_activity(&self, id: &ConnectionId) {
        if let Some(client) = self.clients.get(id) {
            client.touch();
        }
    }

    /// Queue a frame for one client. A full or closed queue evicts the client.
    pub fn send_to(&self, id: &ConnectionId, frame: Outbound) -> Result<(), SendError> {
        let result = match self.clients.get(id) {
            Some(client) => client.send(frame),
            None => return Err(SendError::UnknownClient),
        };
        // The map guard is released above; evicting while holding it would deadlock.
        if let Err(e) = result {
            self.evict(id, e);
        }
        result
    }

    /// Serialize `message` and queue it for one client.
    pub fn send_message(&self, id: &ConnectionId, message: &ServerMessage) -> Result<(), SendError> {
        match encode(message) {
            Some(frame) => self.send_to(id, frame),
            None => Ok(()),
        }
    }

    /// Send the full collection to one client (initial sync).
    pub fn send_snapshot(&self, id: &ConnectionId, events: Vec<Event>) -> Result<(), SendError> {
        self.send_message(id, &ServerMessage::update(events))
    }

    /// Send the full collection to every registered client.
    pub fn broadcast_snapshot(&self, events: Vec<Event>) -> BroadcastReport {
        self.broadcast(&ServerMessage::update(events))
    }

    /// Serialize once and queue for every client. Each delivery is
    /// independent: a failing client is evicted and the rest still receive.
    pub fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let Some(frame) = encode(message) else {
            return BroadcastReport::default();
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.clients.iter() {
            match entry.value().send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((entry.key().clone(), e)),
            }
        }

        let evicted = failed
            .into_iter()
            .map(|(id, e)| {
                self.evict(&id, e);
                id
            })
            .collect::<Vec<_>>();

        debug!(recipients = delivered, evicted = evicted.len(), "broadcast");
        BroadcastReport { delivered, evicted }
    }

    /// Evict clients idle for at least `timeout`.
    pub fn cleanup_dead_clients(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| entry.value().idle_for() >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.clients.remove(&id).is_some() {
                let _ = self.evictions.fetch_add(1, Ordering::Relaxed);
                removed += 1;
                info!(conn_id = %id, "cleaned up dead client");
            }
        }
        removed
    }

    fn evict(&self, id: &ConnectionId, reason: SendError) {
        if self.clients.remove(id).is_some() {
            let _ = self.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = %id, error = %reason, "evicting client after failed send");
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Outbound> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize server message");
            None
        }
    }
}

/// Start a background task that periodically evicts silent clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients(timeout);
            if removed > 0 {
                info!(removed, "dead client cleanup");
            }
        }
    })
}
