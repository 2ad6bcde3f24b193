//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to log lines
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full `EnvFilter` directive
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Whether to register the bridge metrics
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "quadro".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUADRO_SERVICE_NAME`: Service name (default: quadro)
    /// - `QUADRO_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `QUADRO_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `QUADRO_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `QUADRO_METRICS`: Register bridge metrics (default: true)
    pub fn from_env() -> Self {
        Self {
            service_name: env::var("QUADRO_SERVICE_NAME").unwrap_or_else(|_| "quadro".to_string()),

            log_level: env::var("QUADRO_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("QUADRO_CONSOLE_OUTPUT")
                .map(|v| parse_flag(&v, true))
                .unwrap_or(true),

            json_logs: env::var("QUADRO_JSON_LOGS")
                .map(|v| parse_flag(&v, false))
                .unwrap_or(false),

            metrics_enabled: env::var("QUADRO_METRICS")
                .map(|v| parse_flag(&v, true))
                .unwrap_or(true),
        }
    }

    /// Quiet configuration for tests: warnings only, no metrics registration.
    pub fn for_testing() -> Self {
        Self {
            log_level: "warn".to_string(),
            metrics_enabled: false,
            ..Self::default()
        }
    }
}

fn parse_flag(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
