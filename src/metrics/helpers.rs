//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::resilience::CircuitState;

use super::{
    AUTH_FAILURES_TOTAL, CONNECTIONS_TOTAL, DB_CIRCUIT_BREAKER_STATE, DELIVERIES_TOTAL,
    DELIVERY_FAILURES_TOTAL, DISCOVERY_PROBES_TOTAL, HEARTBEAT_DURATION_MS,
    MESSAGES_BROADCAST_TOTAL, MESSAGES_PERSISTED_TOTAL, PERSISTENCE_FAILURES_TOTAL,
    PERSISTENCE_LATENCY, PERSISTENCE_RETRIES_TOTAL, PRESENCE_TRANSITIONS_TOTAL,
    READ_RECEIPTS_TOTAL, ROOMS_LIVE, SLOW_CONSUMER_CLOSES_TOTAL, STALE_CONNECTIONS_CLOSED,
    TYPING_TRANSITIONS_TOTAL, UNREAD_PUSHES_TOTAL, USERS_ONLINE, WS_CONNECTIONS_CLOSED,
    WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    pub fn record_closed(duration: Duration) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration.as_secs_f64());
    }

    pub fn record_auth_failure(reason: &str) {
        AUTH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Refresh the live gauges from a registry snapshot
    pub fn set_live(connections: usize, users: usize, rooms: usize) {
        CONNECTIONS_TOTAL.set(connections as i64);
        USERS_ONLINE.set(users as i64);
        ROOMS_LIVE.set(rooms as i64);
    }

    pub fn record_heartbeat(duration_ms: f64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms);
    }

    pub fn record_stale_closed(count: usize) {
        STALE_CONNECTIONS_CLOSED.inc_by(count as u64);
    }
}

pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_delivered() {
        DELIVERIES_TOTAL.inc();
    }

    pub fn record_failed() {
        DELIVERY_FAILURES_TOTAL.inc();
    }

    pub fn record_slow_consumer() {
        SLOW_CONSUMER_CLOSES_TOTAL.inc();
    }

    pub fn record_broadcast() {
        MESSAGES_BROADCAST_TOTAL.inc();
    }
}

pub struct PersistenceMetrics;

impl PersistenceMetrics {
    pub fn record_persisted(latency: Duration) {
        MESSAGES_PERSISTED_TOTAL.inc();
        PERSISTENCE_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_failed(latency: Duration) {
        PERSISTENCE_FAILURES_TOTAL.inc();
        PERSISTENCE_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_retry() {
        PERSISTENCE_RETRIES_TOTAL.inc();
    }

    pub fn set_circuit_state(state: CircuitState) {
        DB_CIRCUIT_BREAKER_STATE.set(state as i64);
    }
}

pub struct SignalMetrics;

impl SignalMetrics {
    pub fn record_typing(transition: &str) {
        TYPING_TRANSITIONS_TOTAL.with_label_values(&[transition]).inc();
    }

    pub fn record_read_receipt() {
        READ_RECEIPTS_TOTAL.inc();
    }

    pub fn record_unread_push() {
        UNREAD_PUSHES_TOTAL.inc();
    }

    pub fn record_presence(online: bool) {
        let state = if online { "online" } else { "offline" };
        PRESENCE_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
    }
}

pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record(event: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[event]).inc();
    }
}

pub struct DiscoveryMetrics;

impl DiscoveryMetrics {
    pub fn record_probe(outcome: &str) {
        DISCOVERY_PROBES_TOTAL.with_label_values(&[outcome]).inc();
    }
}
