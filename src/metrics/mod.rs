//! Prometheus metrics for the chat service.
//!
//! - Connection metrics (active connections, online users, live rooms)
//! - Message metrics (persisted, broadcast, per-connection deliveries)
//! - Persistence metrics (latency, failures, retries)
//! - Ephemeral signal metrics (typing, read receipts, unread pushes)

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, DeliveryMetrics, DiscoveryMetrics, PersistenceMetrics,
    SignalMetrics, WsMessageMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "meetup_chat";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Authenticated WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Number of authenticated WebSocket connections"
    ).unwrap();

    /// Users with at least one live connection
    pub static ref USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_users_online", METRIC_PREFIX),
        "Number of users with at least one live connection"
    ).unwrap();

    /// Rooms with at least one joined connection
    pub static ref ROOMS_LIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_live", METRIC_PREFIX),
        "Number of rooms with at least one joined connection"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket sessions opened"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket sessions closed"
    ).unwrap();

    /// Session duration in seconds
    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket session duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    /// Client frames received by event name
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Client events received",
        &["event"]
    ).unwrap();

    pub static ref AUTH_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_auth_failures_total", METRIC_PREFIX),
        "Failed handshakes",
        &["reason"]
    ).unwrap();

    pub static ref STALE_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_stale_connections_closed_total", METRIC_PREFIX),
        "Connections closed for inactivity"
    ).unwrap();

    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    pub static ref MESSAGES_PERSISTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_persisted_total", METRIC_PREFIX),
        "Total chat messages persisted"
    ).unwrap();

    pub static ref MESSAGES_BROADCAST_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_broadcast_total", METRIC_PREFIX),
        "Total chat messages fanned out to live connections"
    ).unwrap();

    /// Frames accepted by a connection's outbound buffer
    pub static ref DELIVERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Frames queued to connections"
    ).unwrap();

    pub static ref DELIVERY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_delivery_failures_total", METRIC_PREFIX),
        "Frames that could not be queued to a connection"
    ).unwrap();

    pub static ref SLOW_CONSUMER_CLOSES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_slow_consumer_closes_total", METRIC_PREFIX),
        "Connections force-closed because their outbound buffer was full"
    ).unwrap();

    // ============================================================================
    // Persistence Metrics
    // ============================================================================

    pub static ref PERSISTENCE_LATENCY: Histogram = register_histogram!(
        format!("{}_persistence_latency_seconds", METRIC_PREFIX),
        "Message write latency in seconds, retries included",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0]
    ).unwrap();

    pub static ref PERSISTENCE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_persistence_failures_total", METRIC_PREFIX),
        "Messages rejected because they could not be stored"
    ).unwrap();

    pub static ref PERSISTENCE_RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_persistence_retries_total", METRIC_PREFIX),
        "Message writes retried after a failed first attempt"
    ).unwrap();

    /// Database circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref DB_CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_db_circuit_breaker_state", METRIC_PREFIX),
        "Database circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();

    // ============================================================================
    // Ephemeral Signal Metrics
    // ============================================================================

    /// Typing state changes by kind (start, stop, expired)
    pub static ref TYPING_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_typing_transitions_total", METRIC_PREFIX),
        "Typing indicator state changes",
        &["transition"]
    ).unwrap();

    pub static ref READ_RECEIPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_read_receipts_total", METRIC_PREFIX),
        "Read pointer advances"
    ).unwrap();

    pub static ref UNREAD_PUSHES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_unread_pushes_total", METRIC_PREFIX),
        "unread-count-updated frames pushed"
    ).unwrap();

    pub static ref PRESENCE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_transitions_total", METRIC_PREFIX),
        "Users going online or offline",
        &["state"]
    ).unwrap();

    // ============================================================================
    // Discovery Metrics
    // ============================================================================

    pub static ref DISCOVERY_PROBES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_discovery_probes_total", METRIC_PREFIX),
        "Endpoint probes by outcome",
        &["outcome"]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTIONS_TOTAL.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("meetup_chat_connections_total"));
    }

    #[test]
    fn test_labelled_metrics() {
        WS_MESSAGES_RECEIVED.with_label_values(&["join_room"]).inc();
        TYPING_TRANSITIONS_TOTAL.with_label_values(&["expired"]).inc();
        PRESENCE_TRANSITIONS_TOTAL.with_label_values(&["online"]).inc();
        // Just verify no panics
    }
}
