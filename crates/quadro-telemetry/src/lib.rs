//! # Quadro Telemetry
//!
//! Logging and metrics for the message-bus bridge.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with env filter, pretty or JSON output
//! - **Metrics**: Prometheus counters, gauges and histograms for calls,
//!   signals and subscriptions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quadro_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env()).expect("telemetry");
//! // bus traffic is now logged and counted
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QUADRO_SERVICE_NAME` | `quadro` | Service name in log lines |
//! | `QUADRO_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `QUADRO_JSON_LOGS` | `false` | JSON formatted logs |
//! | `QUADRO_CONSOLE_OUTPUT` | `true` | Write logs to the console |
//! | `QUADRO_METRICS` | `true` | Register bridge metrics |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, LoggingHandle};
pub use metrics::{
    encode_metrics, register_metrics, CallTimer, MetricsHandle, ACTIVE_MATCHES, BUS_CALLS,
    BUS_CALL_DURATION, DAEMON_REQUEST_FAILURES, MESSAGES_DROPPED, NOTIFICATIONS_DELIVERED,
    SIGNALS_RECEIVED,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logger: {0}")]
    LoggerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and, when enabled, metrics registration.
///
/// Returns a guard that should be held for the lifetime of the process.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = if config.metrics_enabled {
        Some(register_metrics()?)
    } else {
        None
    };

    let logging = init_logging(&config)?;

    Ok(TelemetryGuard {
        _logging: logging,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingHandle,
    _metrics: Option<MetricsHandle>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
