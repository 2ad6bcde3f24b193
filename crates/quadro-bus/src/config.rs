//! Bridge configuration.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QUADRO_CALL_TIMEOUT_MS` | `25000` | Timeout of calls made without an explicit one |
//! | `QUADRO_SUBSCRIBE_TIMEOUT_MS` | `5000` | Timeout of `AddMatch`/`RemoveMatch` requests |
//! | `QUADRO_NOTIFY_CAPACITY` | `1024` | Notifications the all-observers tap buffers before a receiver skips |

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default reply timeout of the bus protocol.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Default timeout for match-rule requests to the daemon.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default notification buffer per receiver.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Invalid bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{var} is not a valid number: {value}")]
    NotANumber { var: &'static str, value: String },
}

/// Timeouts and buffer sizes of one bus handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Used by [`BusBridge::call`](crate::BusBridge::call).
    pub call_timeout: Duration,

    /// Bound on each `AddMatch`/`RemoveMatch` round trip.
    pub subscribe_timeout: Duration,

    /// Capacity of the all-observers notification tap. Per-observer
    /// receivers are unbounded.
    pub notification_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            notification_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Read overrides from the environment; unset variables keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            call_timeout: env_millis("QUADRO_CALL_TIMEOUT_MS")?.unwrap_or(defaults.call_timeout),
            subscribe_timeout: env_millis("QUADRO_SUBSCRIBE_TIMEOUT_MS")?
                .unwrap_or(defaults.subscribe_timeout),
            notification_capacity: env_number("QUADRO_NOTIFY_CAPACITY")?
                .map_or(defaults.notification_capacity, |n| n as usize),
        };
        config.validate()?;
        Ok(config)
    }

    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            call_timeout: Duration::from_millis(500),
            subscribe_timeout: Duration::from_millis(500),
            notification_capacity: 64,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "call_timeout",
            });
        }
        if self.subscribe_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "subscribe_timeout",
            });
        }
        // broadcast channels panic on zero capacity
        if self.notification_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "notification_capacity",
            });
        }
        Ok(())
    }

    /// Builder-style method to set the default call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builder-style method to set the subscribe timeout
    #[must_use]
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Builder-style method to set the notification capacity
    #[must_use]
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }
}

fn env_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::NotANumber { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_number(var)?.map(Duration::from_millis))
}
