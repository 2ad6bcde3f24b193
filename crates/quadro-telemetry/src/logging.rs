//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! pretty console layer (development) or a JSON layer (kiosk deployments
//! shipping logs off-device). Every bridge log line carries a `bus` field so
//! host and session traffic can be told apart.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Handle proving the global subscriber was installed by this crate.
#[derive(Debug)]
pub struct LoggingHandle {
    json: bool,
}

impl LoggingHandle {
    /// Whether JSON formatting was selected.
    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Install the global tracing subscriber.
///
/// Fails (instead of panicking) when a global subscriber already exists.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingHandle, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    let json_layer = (config.console_output && config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let pretty_layer = (config.console_output && !config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::LoggerInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Logging initialized"
    );

    Ok(LoggingHandle {
        json: config.json_logs,
    })
}

/// Log a connection-level event tagged with the bus it happened on.
#[macro_export]
macro_rules! log_bus_event {
    ($level:ident, $bus:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            bus = %$bus,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an endpoint-related event with the four addressing fields.
#[macro_export]
macro_rules! log_endpoint_event {
    ($level:ident, $bus:expr, $endpoint:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            bus = %$bus,
            service = $endpoint.service(),
            path = $endpoint.path(),
            interface = $endpoint.interface(),
            member = $endpoint.member(),
            $($($field)*,)?
            $msg
        )
    };
}
