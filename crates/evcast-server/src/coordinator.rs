//! The single path through which every state change flows.
//!
//! A [`BroadcastCoordinator`] applies one command at a time: mutate the
//! store, then fan the committed snapshot out to every client. Running it as
//! one task fed by an mpsc inbox serializes mutations and keeps broadcasts in
//! commit order. Connects go through the same inbox, so a fresh client's
//! initial snapshot can never arrive after a newer broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use evcast_core::{Action, ActionError, ConnectionId};
use evcast_store::EventStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientRegistry, Outbound};

/// Work accepted by the coordinator task.
#[derive(Debug)]
pub enum Command {
    Connect {
        conn_id: ConnectionId,
        tx: mpsc::Sender<Outbound>,
    },
    Action {
        conn_id: ConnectionId,
        action: Action,
    },
    /// A message that failed to decode; reply to its sender only.
    Reject {
        conn_id: ConnectionId,
        error: ActionError,
    },
    Disconnect {
        conn_id: ConnectionId,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("coordinator is no longer running")]
pub struct CoordinatorClosed;

/// Counters reported by `/health`.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    commits: AtomicU64,
    rejections: AtomicU64,
    broadcasts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub commits: u64,
    pub rejections: u64,
    pub broadcasts: u64,
}

impl CoordinatorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

pub struct BroadcastCoordinator {
    store: Arc<EventStore>,
    registry: Arc<ClientRegistry>,
    stats: Arc<CoordinatorStats>,
}

impl BroadcastCoordinator {
    /// Coordinator over `store`, broadcasting to `registry`.
    pub fn new(store: Arc<EventStore>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            store,
            registry,
            stats: Arc::new(CoordinatorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CoordinatorStats> {
        Arc::clone(&self.stats)
    }

    /// Register the client, then send it the current collection.
    pub fn on_connect(&self, conn_id: ConnectionId, tx: mpsc::Sender<Outbound>) {
        self.registry.register(conn_id.clone(), tx);
        if let Err(e) = self.registry.send_snapshot(&conn_id, self.store.read_all()) {
            warn!(conn_id = %conn_id, error = %e, "initial snapshot not delivered");
        }
    }

    /// Drop the client. Shared state is untouched, so nothing is broadcast.
    pub fn on_disconnect(&self, conn_id: &ConnectionId) {
        let _ = self.registry.unregister(conn_id);
    }

    /// Apply one action. On success every client gets the new snapshot; on
    /// failure only the originator hears about it and nothing is broadcast.
    pub fn on_action(&self, conn_id: &ConnectionId, action: Action) -> Result<(), ActionError> {
        let kind = action.kind();
        match self.apply(action) {
            Ok(()) => {
                let _ = self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.broadcast();
                Ok(())
            }
            Err(error) => {
                warn!(conn_id = %conn_id, action = kind.as_str(), error = %error, "action rejected");
                self.reject(conn_id, &error);
                Err(error)
            }
        }
    }

    /// Reply to the originator of a bad message.
    pub fn reject(&self, conn_id: &ConnectionId, error: &ActionError) {
        let _ = self.stats.rejections.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.registry.send_message(conn_id, &error.to_message()) {
            debug!(conn_id = %conn_id, error = %e, "error reply not delivered");
        }
    }

    /// Dispatch one inbox command.
    pub fn handle(&self, command: Command) {
        match command {
            Command::Connect { conn_id, tx } => self.on_connect(conn_id, tx),
            Command::Action { conn_id, action } => {
                let _ = self.on_action(&conn_id, action);
            }
            Command::Reject { conn_id, error } => {
                debug!(conn_id = %conn_id, error = %error, "rejecting undecodable message");
                self.reject(&conn_id, &error);
            }
            Command::Disconnect { conn_id } => self.on_disconnect(&conn_id),
        }
    }

    fn apply(&self, action: Action) -> Result<(), ActionError> {
        match action {
            Action::AddEvent(fields) => {
                let event = self.store.append(fields)?;
                debug!(event_id = %event.id, "add committed");
            }
            Action::UpdateEvent(event) => {
                let event = self.store.replace(event)?;
                debug!(event_id = %event.id, "update committed");
            }
            Action::DeleteEvent(id) => {
                // Deleting an absent id still broadcasts.
                let removed = self.store.delete(&id)?;
                debug!(event_id = %id, removed, "delete committed");
            }
        }
        Ok(())
    }

    fn broadcast(&self) {
        let _ = self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        let report = self.registry.broadcast_snapshot(self.store.read_all());
        if !report.evicted.is_empty() {
            info!(evicted = report.evicted.len(), "clients evicted during broadcast");
        }
    }

    /// Start the coordinator task.
    ///
    /// Each command runs on the blocking pool, since a commit ends in a
    /// synchronous storage write. The task awaits it before taking the next
    /// one, so commands still apply one at a time and in order.
    ///
    /// On cancellation the inbox is closed and whatever is already queued is
    /// still applied before the task ends.
    pub fn spawn(
        self,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity);
        let this = Arc::new(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(command) => Self::run(&this, command).await,
                        None => break,
                    },
                    () = shutdown.cancelled() => {
                        rx.close();
                        while let Some(command) = rx.recv().await {
                            Self::run(&this, command).await;
                        }
                        break;
                    }
                }
            }
            info!("coordinator stopped");
        });
        (CoordinatorHandle { tx }, task)
    }

    async fn run(this: &Arc<Self>, command: Command) {
        let this = Arc::clone(this);
        if let Err(e) = tokio::task::spawn_blocking(move || this.handle(command)).await {
            error!(error = %e, "coordinator command panicked");
        }
    }
}

/// Cheap, cloneable sender side of the coordinator inbox.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Queue a command, waiting for room in the inbox.
    pub async fn send(&self, command: Command) -> Result<(), CoordinatorClosed> {
        self.tx.send(command).await.map_err(|_| CoordinatorClosed)
    }

    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<(), CoordinatorClosed> {
        self.send(Command::Connect { conn_id, tx }).await
    }

    pub async fn submit(&self, conn_id: ConnectionId, action: Action) -> Result<(), CoordinatorClosed> {
        self.send(Command::Action { conn_id, action }).await
    }

    pub async fn reject(&self, conn_id: ConnectionId, error: ActionError) -> Result<(), CoordinatorClosed> {
        self.send(Command::Reject { conn_id, error }).await
    }

    pub async fn disconnect(&self, conn_id: ConnectionId) -> Result<(), CoordinatorClosed> {
        self.send(Command::Disconnect { conn_id }).await
    }

}
