use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use evcast_store::EventStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;
use crate::connection::{handle_socket, ConnectionContext};
use crate::coordinator::{BroadcastCoordinator, CoordinatorStats};
use crate::health::{health_check, HealthResponse};
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub registry: Arc<ClientRegistry>,
    pub stats: Arc<CoordinatorStats>,
    pub connection: ConnectionContext,
    pub max_message_size: usize,
    pub started_at: DateTime<Utc>,
    pub start_instant: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Plain HTTP file server for the browser client.
pub fn build_static_router(dir: &std::path::Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(TraceLayer::new_for_http())
}

/// Start the coordinator, the listeners and the cleanup task.
pub async fn start(config: ServerConfig, store: Arc<EventStore>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let registry = Arc::new(ClientRegistry::new());

    let coordinator = BroadcastCoordinator::new(Arc::clone(&store), Arc::clone(&registry));
    let stats = coordinator.stats();
    let (coordinator, coordinator_task) = coordinator.spawn(config.command_queue, shutdown.token());

    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        config.cleanup_interval(),
        config.client_timeout(),
    );

    let state = AppState {
        store,
        registry: Arc::clone(&registry),
        stats,
        connection: ConnectionContext {
            registry: Arc::clone(&registry),
            coordinator,
            max_send_queue: config.max_send_queue,
            send_timeout: config.send_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            shutdown: shutdown.token(),
        },
        max_message_size: config.max_message_size,
        started_at: Utc::now(),
        start_instant: Instant::now(),
    };

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "websocket server listening");

    let mut tasks = vec![serve(listener, build_router(state), &shutdown), coordinator_task];

    let static_addr = match &config.static_dir {
        Some(dir) => {
            let listener = TcpListener::bind(config.static_addr()).await?;
            let static_addr = listener.local_addr()?;
            info!(addr = %static_addr, dir = %dir.display(), "static file server listening");
            tasks.push(serve(listener, build_static_router(dir), &shutdown));
            Some(static_addr)
        }
        None => None,
    };

    Ok(ServerHandle {
        addr,
        static_addr,
        registry,
        shutdown,
        tasks,
        cleanup,
    })
}

fn serve(listener: TcpListener, router: Router, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
    let token = shutdown.token();
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub static_addr: Option<SocketAddr>,
    registry: Arc<ClientRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.registry.count()
    }

    /// Close every connection, drain the coordinator, and stop listening.
    pub async fn shutdown(self, timeout: Duration) {
        self.cleanup.abort();
        let aborted = self.shutdown.graceful_shutdown(self.tasks, Some(timeout)).await;
        info!(aborted, "server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.connection;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(
        state.started_at,
        state.start_instant,
        state.registry.count(),
        state.store.len(),
        state.stats.snapshot(),
        state.registry.evictions(),
    ))
}
