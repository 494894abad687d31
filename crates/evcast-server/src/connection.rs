//! Per-socket lifecycle: register through the coordinator, pump frames in
//! both directions, and deregister exactly once when either side ends.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use evcast_core::{Action, ActionError, ConnectionId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{outbound_channel, ClientRegistry, Outbound};
use crate::coordinator::{Command, CoordinatorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// `Connecting -> Closing` covers a coordinator that is already gone.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

/// Tracks one connection's state and refuses illegal moves.
#[derive(Debug)]
pub struct Lifecycle {
    conn_id: ConnectionId,
    state: ConnectionState,
}

impl Lifecycle {
    /// Start in `Connecting`.
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "illegal connection transition");
            return false;
        }
        trace!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "connection transition");
        self.state = next;
        true
    }
}

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    TransportError,
    /// The registry dropped the client, closing its outbound queue.
    Evicted,
    SendTimeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
            Self::Evicted => "evicted",
            Self::SendTimeout => "send_timeout",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Everything a socket task needs, cloned per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ClientRegistry>,
    pub coordinator: CoordinatorHandle,
    pub max_send_queue: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Drive one upgraded WebSocket until it closes.
pub async fn handle_socket(socket: WebSocket, ctx: ConnectionContext) {
    let (sink, stream) = socket.split();
    let _ = run_connection(sink, stream, ctx).await;
}

/// Register through the coordinator, pump frames both ways, and deregister
/// once either side ends. Returns why the connection closed.
pub async fn run_connection<Si, St, E>(sink: Si, stream: St, ctx: ConnectionContext) -> CloseReason
where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    let conn_id = ConnectionId::new();
    let mut lifecycle = Lifecycle::new(conn_id.clone());

    let (tx, rx) = outbound_channel(ctx.max_send_queue);
    if ctx.coordinator.connect(conn_id.clone(), tx).await.is_err() {
        warn!(conn_id = %conn_id, "coordinator unavailable, refusing connection");
        let _ = lifecycle.advance(ConnectionState::Closing);
        let _ = lifecycle.advance(ConnectionState::Closed);
        return CloseReason::Shutdown;
    }
    let _ = lifecycle.advance(ConnectionState::Open);
    info!(conn_id = %conn_id, "client connected");

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        ctx.heartbeat_interval,
        ctx.send_timeout,
        ctx.shutdown.clone(),
    ));

    let mut writer_done = false;
    let reason = tokio::select! {
        res = &mut writer => {
            writer_done = true;
            res.unwrap_or(CloseReason::TransportError)
        }
        reason = read_loop(stream, &conn_id, &ctx.registry, &ctx.coordinator) => reason,
    };
    let _ = lifecycle.advance(ConnectionState::Closing);

    if ctx.coordinator.disconnect(conn_id.clone()).await.is_err() {
        let _ = ctx.registry.unregister(&conn_id);
    }

    // Deregistration drops the queue sender, so the writer drains and exits.
    if !writer_done && timeout(ctx.send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    let _ = lifecycle.advance(ConnectionState::Closed);
    info!(conn_id = %conn_id, reason = %reason, "client disconnected");
    reason
}

async fn read_loop<St, E>(
    mut stream: St,
    conn_id: &ConnectionId,
    registry: &ClientRegistry,
    coordinator: &CoordinatorHandle,
) -> CloseReason
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read failed");
                return CloseReason::TransportError;
            }
        };
        registry.record_activity(conn_id);

        let command = match message {
            WsMessage::Text(text) => match Action::decode(text.as_str()) {
                Ok(action) => Command::Action {
                    conn_id: conn_id.clone(),
                    action,
                },
                Err(error) => Command::Reject {
                    conn_id: conn_id.clone(),
                    error,
                },
            },
            WsMessage::Binary(_) => Command::Reject {
                conn_id: conn_id.clone(),
                error: ActionError::Decode("binary frames are not supported".into()),
            },
            WsMessage::Close(_) => return CloseReason::PeerClosed,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        if coordinator.send(command).await.is_err() {
            return CloseReason::Shutdown;
        }
    }
    CloseReason::PeerClosed
}

async fn write_loop<Si>(
    mut sink: Si,
    mut rx: mpsc::Receiver<Outbound>,
    heartbeat: Duration,
    send_timeout: Duration,
    shutdown: CancellationToken,
) -> CloseReason
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: fmt::Display,
{
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        let message = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => WsMessage::Text(frame.as_str().into()),
                None => {
                    let _ = timeout(send_timeout, sink.send(WsMessage::Close(None))).await;
                    return CloseReason::Evicted;
                }
            },
            _ = ping.tick() => WsMessage::Ping(vec![].into()),
            () = shutdown.cancelled() => {
                let _ = timeout(send_timeout, sink.send(WsMessage::Close(None))).await;
                return CloseReason::Shutdown;
            }
        };

        match timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "websocket write failed");
                return CloseReason::TransportError;
            }
            Err(_) => {
                warn!(timeout_ms = send_timeout.as_millis() as u64, "websocket write timed out");
                return CloseReason::SendTimeout;
            }
        }
    }
}
