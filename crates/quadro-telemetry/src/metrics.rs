//! Prometheus metrics for the message-bus bridge.
//!
//! All metrics follow the naming convention: `quadro_bus_<metric>_<unit>`
//! and carry a `bus` label (`system` or `session`).

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Registry holding the bridge metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// Remote calls by outcome (ok, timeout, remote_error, malformed, connection_invalid)
    pub static ref BUS_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("quadro_bus_calls_total", "Remote method calls by outcome"),
        &["bus", "outcome"]
    ).expect("metric creation failed");

    /// Round-trip duration of calls that reached the bus
    pub static ref BUS_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "quadro_bus_call_duration_seconds",
            "Time from sending a method call to its reply, error or timeout"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets")),
        &["bus"]
    ).expect("metric creation failed");

    /// Broadcast signals received from the bus
    pub static ref SIGNALS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("quadro_bus_signals_received_total", "Broadcast signals received"),
        &["bus"]
    ).expect("metric creation failed");

    /// Notifications handed to local observers
    pub static ref NOTIFICATIONS_DELIVERED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "quadro_bus_notifications_delivered_total",
            "Per-observer notifications delivered"
        ),
        &["bus"]
    ).expect("metric creation failed");

    /// Inbound messages and notifications dropped (malformed, late_reply, unmatched, lagged)
    pub static ref MESSAGES_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("quadro_bus_messages_dropped_total", "Inbound messages dropped"),
        &["bus", "reason"]
    ).expect("metric creation failed");

    /// Bus-level match rules currently registered
    pub static ref ACTIVE_MATCHES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("quadro_bus_active_matches", "Match rules registered with the bus daemon"),
        &["bus"]
    ).expect("metric creation failed");

    /// Daemon requests that failed or went unanswered (add, remove, owner_watch, owner_lookup)
    pub static ref DAEMON_REQUEST_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "quadro_bus_daemon_request_failures_total",
            "Match-rule and name-owner requests refused or left unanswered by the bus daemon"
        ),
        &["bus", "op"]
    ).expect("metric creation failed");
}

/// Handle returned once the metrics are registered.
#[derive(Debug)]
pub struct MetricsHandle {
    registered: usize,
}

impl MetricsHandle {
    /// Number of collectors registered.
    pub fn registered(&self) -> usize {
        self.registered
    }
}

/// Register all bridge metrics with [`REGISTRY`].
///
/// Metrics are updated whether or not they are registered; registration only
/// makes them visible to [`encode_metrics`].
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BUS_CALLS.clone()),
        Box::new(BUS_CALL_DURATION.clone()),
        Box::new(SIGNALS_RECEIVED.clone()),
        Box::new(NOTIFICATIONS_DELIVERED.clone()),
        Box::new(MESSAGES_DROPPED.clone()),
        Box::new(ACTIVE_MATCHES.clone()),
        Box::new(DAEMON_REQUEST_FAILURES.clone()),
    ];
    let registered = metrics.len();

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle { registered })
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard observing a call's duration on drop.
pub struct CallTimer {
    bus: &'static str,
    start: std::time::Instant,
}

impl CallTimer {
    /// Start timing a call on the given bus.
    pub fn start(bus: &'static str) -> Self {
        Self {
            bus,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        BUS_CALL_DURATION
            .with_label_values(&[self.bus])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
