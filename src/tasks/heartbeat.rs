use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection_manager::fan_out;
use crate::metrics::{ConnectionMetrics, PersistenceMetrics};
use crate::resilience::CircuitBreaker;
use crate::websocket::{ChatGateway, ServerMessage};

/// Background task for heartbeat and connection cleanup
pub struct HeartbeatTask {
    config: WebSocketConfig,
    gateway: Arc<ChatGateway>,
    db_circuit_breaker: Option<Arc<CircuitBreaker>>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        gateway: Arc<ChatGateway>,
        db_circuit_breaker: Option<Arc<CircuitBreaker>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            gateway,
            db_circuit_breaker,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup tasks
    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval);
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval);
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup_stale_connections(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Queue a heartbeat frame on every connection.
    ///
    /// Delivery never waits on a socket, so one pass covers every connection.
    fn send_heartbeats(&self) {
        let connections = self.gateway.connections().all_connections();
        if connections.is_empty() {
            return;
        }

        let start = Instant::now();
        let result = fan_out(&connections, &ServerMessage::Heartbeat);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        ConnectionMetrics::record_heartbeat(elapsed_ms);
        if let Some(cb) = &self.db_circuit_breaker {
            PersistenceMetrics::set_circuit_state(cb.state());
        }

        tracing::debug!(
            total = connections.len(),
            sent = result.delivered,
            failed = result.failed,
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );
    }

    /// Tear down connections that stayed silent past the timeout
    fn cleanup_stale_connections(&self, timeout_secs: u64) -> usize {
        let stale = self.gateway.connections().find_stale_connections(timeout_secs);
        let mut removed = 0;

        for handle in stale {
            if self.gateway.disconnect(handle.id) {
                removed += 1;
                tracing::debug!(
                    connection_id = %handle.id,
                    user_id = %handle.user_id,
                    "Closed stale connection"
                );
            }
        }

        if removed > 0 {
            ConnectionMetrics::record_stale_closed(removed);
            tracing::info!(
                removed = removed,
                timeout_secs = timeout_secs,
                "Cleaned up stale connections"
            );
        }
        removed
    }
}
