use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "evcast_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive built from the configured levels, e.g.
    /// `info,evcast_store=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Returned by [`init_telemetry`]; records what was installed.
pub struct TelemetryGuard {
    filter: String,
}

impl TelemetryGuard {
    /// The effective filter directive.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Initialize the tracing subscriber. Call once at startup.
///
/// Returns `None` if a global subscriber was already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Option<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    let filter = env_filter.to_string();

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .ok()?;

    Some(TelemetryGuard { filter })
}

/// Parse a level name (`trace`, `debug`, `info`, `warn`, `error`).
pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

/// Parse `module=level` pairs separated by commas.
pub fn parse_module_levels(s: &str) -> Vec<(String, Level)> {
    s.split(',')
        .filter_map(|pair| {
            let (module, level) = pair.split_once('=')?;
            let module = module.trim();
            if module.is_empty() {
                return None;
            }
            Some((module.to_string(), parse_level(level)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_info() {
        assert_eq!(TelemetryConfig::default().filter_directive(), "info");
    }

    #[test]
    fn directive_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("evcast_store".into(), Level::DEBUG),
                ("evcast_server".into(), Level::TRACE),
            ],
            json: false,
        };
        assert_eq!(
            config.filter_directive(),
            "warn,evcast_store=debug,evcast_server=trace"
        );
    }

    #[test]
    fn parse_levels() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn parse_module_level_pairs() {
        let parsed = parse_module_levels("evcast_store=debug, tower_http=warn,bogus,=info,x=nope");
        assert_eq!(
            parsed,
            vec![
                ("evcast_store".to_string(), Level::DEBUG),
                ("tower_http".to_string(), Level::WARN),
            ]
        );
    }

    #[test]
    fn second_init_is_rejected() {
        let config = TelemetryConfig::default();
        let _first = init_telemetry(&config);
        assert!(init_telemetry(&config).is_none());
    }
}
