//! Tracing setup for the parley binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for log output.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: Level::INFO, json: false }
    }
}

/// Install the global subscriber. Call once at startup; later calls are
/// no-ops so tests can initialize freely.
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    if config.json {
        let fmt = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true);
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
    } else {
        let fmt = tracing_subscriber::fmt::layer().with_target(true);
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
    }
}
