//! Prometheus metrics for the connection hub.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "studio_hub";

lazy_static! {
    /// Total WebSocket connections accepted since startup
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    /// Total WebSocket connections closed since startup
    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connection lifetime distribution
    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]
    ).unwrap();

    /// Currently registered connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of currently registered connections"
    ).unwrap();

    /// Unique users with at least one live connection
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of unique connected users"
    ).unwrap();

    /// Channels with at least one subscriber
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Number of channels with at least one subscriber"
    ).unwrap();

    /// Envelopes delivered to connection transports
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total envelopes successfully handed to connection transports"
    ).unwrap();

    /// Per-target delivery failures
    pub static ref MESSAGES_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Total envelope delivery failures"
    ).unwrap();

    /// Connections evicted by the heartbeat sweep
    pub static ref HEARTBEAT_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeat_evictions_total", METRIC_PREFIX),
        "Total connections closed for missing their liveness window"
    ).unwrap();

    /// Inbound frames dropped for malformed or unknown envelopes
    pub static ref PROTOCOL_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_protocol_errors_total", METRIC_PREFIX),
        "Total inbound frames dropped as protocol errors"
    ).unwrap();
}

/// Encode all registered metrics in Prometheus text format
pub fn encode() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
