//! Telemetry for the supervisor: tracing initialization and an in-process
//! metrics recorder. Call [`init_telemetry`] once at startup.

mod metrics;

pub use metrics::{HistogramSummary, MetricsRecorder, MetricsSnapshot};

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: Level::INFO, json: false }
    }
}

/// Initialize the tracing subscriber. Safe to call once per process;
/// subsequent calls are ignored (relevant for tests sharing a binary).
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_level.to_string().to_lowercase())
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("telemetry already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = TelemetryConfig::default();
        init_telemetry(&config);
        init_telemetry(&config);
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(TelemetryConfig::default().log_level, Level::INFO);
    }
}
