//! # evcast
//!
//! Calendar event broadcast server: loads settings, opens the event store,
//! and serves WebSocket clients until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use evcast_server::ServerConfig;
use evcast_store::{EventStore, JsonFileStorage};
use evcast_telemetry::{init_telemetry, parse_level, parse_module_levels, TelemetryConfig};

/// Real-time calendar event broadcast server.
#[derive(Parser, Debug)]
#[command(name = "evcast", about = "Real-time calendar event broadcast server")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// WebSocket port (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path of the JSON event file.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Serve this directory over plain HTTP.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Port for the static file listener.
    #[arg(long)]
    static_port: Option<u16>,

    /// Default log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Per-module levels, e.g. `evcast_store=debug,tower_http=warn`.
    #[arg(long)]
    module_levels: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(storage) = &self.storage {
            config.storage_path = storage.clone();
        }
        if let Some(dir) = &self.static_dir {
            config.static_dir = Some(dir.clone());
        }
        if let Some(port) = self.static_port {
            config.static_port = port;
        }
    }

    /// File and env settings with flags on top, validated once at the end.
    fn settings(&self) -> Result<ServerConfig> {
        let mut config = evcast_server::load_settings(self.config.as_deref())
            .context("failed to load settings")?;
        self.apply(&mut config);
        config.validate().context("invalid settings")?;
        Ok(config)
    }

    fn telemetry(&self) -> Result<TelemetryConfig> {
        let log_level = parse_level(&self.log_level)
            .with_context(|| format!("invalid log level: {}", self.log_level))?;
        Ok(TelemetryConfig {
            log_level,
            module_levels: self
                .module_levels
                .as_deref()
                .map(parse_module_levels)
                .unwrap_or_default(),
            json: self.log_json,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(&cli.telemetry()?);
    if let Some(guard) = &telemetry {
        tracing::debug!(filter = guard.filter(), "telemetry initialized");
    }

    let config = cli.settings()?;

    let storage = Arc::new(JsonFileStorage::new(&config.storage_path));
    let store = EventStore::open(storage)
        .with_context(|| format!("failed to open event store at {}", config.storage_path.display()))?
        .with_persist_retries(config.persist_retries);

    let handle = evcast_server::start(config.clone(), Arc::new(store))
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %handle.addr, "evcast ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown(config.send_timeout() + Duration::from_secs(5)).await;
    Ok(())
}
