//! Server configuration and settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a settings file is given, deep-merge its values over the defaults
//! 3. Apply `EVCAST_*` environment variable overrides
//!
//! Command-line flags are applied by the binary on top of the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Configuration for the evcast server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// WebSocket port (`0` for auto-assign).
    pub port: u16,
    /// Path of the JSON file holding the event collection.
    pub storage_path: PathBuf,
    /// Outbound queue bound per client.
    pub max_send_queue: usize,
    /// Upper bound for a single socket write, in milliseconds.
    pub send_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Ping cadence in seconds.
    pub heartbeat_interval_secs: u64,
    /// A client silent for this long is evicted.
    pub client_timeout_secs: u64,
    /// Dead-client sweep cadence in seconds.
    pub cleanup_interval_secs: u64,
    /// Extra storage write attempts before a mutation fails.
    pub persist_retries: u32,
    /// Coordinator inbox bound.
    pub command_queue: usize,
    /// Directory to serve over plain HTTP, if any.
    pub static_dir: Option<PathBuf>,
    /// Port for the static file listener.
    pub static_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8001,
            storage_path: PathBuf::from("events.json"),
            max_send_queue: 256,
            send_timeout_ms: 5_000,
            max_message_size: 1024 * 1024,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            persist_retries: 2,
            command_queue: 1024,
            static_dir: None,
            static_port: 8000,
        }
    }
}

impl ServerConfig {
    /// `host:port` for the WebSocket listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:static_port` for the static file listener.
    pub fn static_addr(&self) -> String {
        format!("{}:{}", self.host, self.static_port)
    }

    /// Longest a single socket write may take.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Time between server pings.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a client counts as dead.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// Time between dead-client sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("host must not be empty".into()));
        }
        if self.storage_path.as_os_str().is_empty() {
            return Err(SettingsError::InvalidValue("storage_path must not be empty".into()));
        }
        for (name, value) in [
            ("max_send_queue", self.max_send_queue as u64),
            ("send_timeout_ms", self.send_timeout_ms),
            ("max_message_size", self.max_message_size as u64),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("client_timeout_secs", self.client_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("command_queue", self.command_queue as u64),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
            }
        }
        if self.client_timeout_secs < self.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "client_timeout_secs must be at least heartbeat_interval_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from an optional file, then apply env var overrides.
///
/// A missing file is an error when a path was given explicitly. The result
/// is not validated here, since command-line flags may still override it;
/// call [`ServerConfig::validate`] once every layer is applied.
pub fn load_settings(path: Option<&Path>) -> Result<ServerConfig, SettingsError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `EVCAST_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("EVCAST_HOST") {
        config.host = v;
    }
    if let Some(v) = read("EVCAST_PORT") {
        match parse_u64_range(&v, 0, u64::from(u16::MAX)) {
            Some(port) => config.port = port as u16,
            None => warn!(key = "EVCAST_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("EVCAST_STORAGE") {
        config.storage_path = PathBuf::from(v);
    }
    if let Some(v) = read("EVCAST_SEND_TIMEOUT_MS") {
        match parse_u64_range(&v, 1, 600_000) {
            Some(ms) => config.send_timeout_ms = ms,
            None => warn!(key = "EVCAST_SEND_TIMEOUT_MS", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("EVCAST_STATIC_DIR") {
        config.static_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = read("EVCAST_STATIC_PORT") {
        match parse_u64_range(&v, 0, u64::from(u16::MAX)) {
            Some(port) => config.static_port = port as u16,
            None => warn!(key = "EVCAST_STATIC_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
