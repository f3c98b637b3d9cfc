//! Graceful shutdown for the chat service.
//!
//! 1. Every connected client is told to reconnect later
//! 2. Background tasks are signalled to stop
//! 3. Sockets are closed once their queued frames have been flushed

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection_manager::fan_out;
use crate::websocket::{ChatGateway, ServerMessage};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time given to socket writers to flush the shutdown notice
    pub flush_delay: Duration,
    /// Time to wait for connections to close
    pub drain_timeout: Duration,
    /// Suggested reconnect delay to send to clients
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

pub struct GracefulShutdown {
    gateway: Arc<ChatGateway>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(gateway: Arc<ChatGateway>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(gateway, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        gateway: Arc<ChatGateway>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            gateway,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.gateway.connections().connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown, notifying clients");
        result.clients_notified = self.notify_clients(reason);

        let _ = self.shutdown_tx.send(());

        if result.clients_notified > 0 {
            tokio::time::sleep(self.config.flush_delay).await;
        }
        result.connections_closed = self.close_connections().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.gateway.connections().all_connections();
        if connections.is_empty() {
            return 0;
        }

        let message = ServerMessage::Shutdown {
            reason: reason.to_string(),
            reconnect_after_seconds: self.config.reconnect_after_seconds,
        };
        let result = fan_out(&connections, &message);

        tracing::info!(
            notified = result.delivered,
            total = connections.len(),
            "Shutdown notifications sent"
        );
        result.delivered
    }

    /// Close every handle. Teardown follows the close; socket tasks flush
    /// what is already queued.
    async fn close_connections(&self) -> usize {
        let connections = self.gateway.connections().all_connections();
        let initial = connections.len();
        if initial == 0 {
            return 0;
        }

        for handle in &connections {
            handle.close();
        }

        let wait = async {
            while self.gateway.connections().connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        if timeout(self.config.drain_timeout, wait).await.is_err() {
            // sockets that never finished get torn down here
            for handle in self.gateway.connections().all_connections() {
                self.gateway.disconnect(handle.id);
            }
            tracing::warn!("Some connections did not close gracefully");
        }

        initial
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub clients_notified: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}
