//! WebSocket server for evcast.
//!
//! Clients connect to `/ws`, receive the full event collection, and then get
//! a fresh snapshot after every committed change. All mutations go through a
//! single [`coordinator::BroadcastCoordinator`] task.

pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod health;
pub mod server;
pub mod shutdown;

pub use client::{ClientRegistry, SendError};
pub use config::{load_settings, ServerConfig, SettingsError};
pub use coordinator::{BroadcastCoordinator, CoordinatorHandle, CoordinatorStats};
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
