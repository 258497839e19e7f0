//! Tracing subscriber initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a JSON or
//! human-readable `fmt` layer. Correlation fields reach log lines through the
//! spans entered by [`ExecutionContext::span`](crate::ExecutionContext::span).

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ConfigError;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives (e.g., "keel_retry=debug,info")
    pub filter: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string()),
            format: match std::env::var("KEEL_LOG_FORMAT").as_deref() {
                Ok("pretty") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Only the first call in a process installs anything; later calls return
/// `Ok(())` without touching the existing subscriber.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    INSTALLED
        .get_or_try_init(|| {
            let registry = tracing_subscriber::registry().with(build_filter(&config.filter)?);
            let installed = match config.format {
                LogFormat::Json => registry
                    .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
                    .try_init(),
                LogFormat::Pretty => registry
                    .with(tracing_subscriber::fmt::layer().with_thread_names(true))
                    .try_init(),
            };
            installed.map_err(|e| ConfigError::InvalidValue {
                field: "telemetry",
                reason: format!("failed to init subscriber: {}", e),
            })?;

            tracing::info!(filter = %config.filter, format = ?config.format, "Telemetry initialized");
            Ok(())
        })
        .map(|_| ())
}

fn build_filter(directives: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(directives).map_err(|e| ConfigError::InvalidValue {
        field: "telemetry.filter",
        reason: e.to_string(),
    })
}
