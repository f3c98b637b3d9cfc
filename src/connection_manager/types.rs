//! Connection handle and related types

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::ChatError;
use crate::metrics::DeliveryMetrics;
use crate::store::UserId;
use crate::websocket::OutboundMessage;

/// Handle for a single authenticated WebSocket connection
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: UserId,
    pub roles: Vec<String>,
    sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds)
    last_activity: AtomicI64,
    closed: AtomicBool,
    close_notify: Notify,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, roles: Vec<String>, sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            roles,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Queue a frame without waiting.
    ///
    /// A full buffer means the client is not draining its socket: the
    /// connection is closed instead of letting it hold up the caller.
    pub fn deliver(&self, message: impl Into<OutboundMessage>) -> Result<(), ChatError> {
        if self.is_closed() {
            DeliveryMetrics::record_failed();
            return Err(ChatError::Delivery(self.id));
        }

        match self.sender.try_send(message.into()) {
            Ok(()) => {
                DeliveryMetrics::record_delivered();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                DeliveryMetrics::record_failed();
                DeliveryMetrics::record_slow_consumer();
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    "Outbound buffer full, closing slow consumer"
                );
                self.close();
                Err(ChatError::Delivery(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                DeliveryMetrics::record_failed();
                self.close();
                Err(ChatError::Delivery(self.id))
            }
        }
    }

    /// Mark the connection closed and wake its session task
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Error returned when connection limits are exceeded
#[derive(Debug, Clone)]
pub enum ConnectionError {
    TotalLimitExceeded { current: usize, max: usize },
    UserLimitExceeded { user_id: String, current: usize, max: usize },
    UnknownConnection(Uuid),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TotalLimitExceeded { current, max } => {
                write!(f, "Total connection limit exceeded ({}/{})", current, max)
            }
            Self::UserLimitExceeded {
                user_id,
                current,
                max,
            } => {
                write!(
                    f,
                    "User {} connection limit exceeded ({}/{})",
                    user_id, current, max
                )
            }
            Self::UnknownConnection(id) => write!(f, "Connection {} is not registered", id),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_user: 10,
        }
    }
}

impl From<&crate::config::WebSocketConfig> for ConnectionLimits {
    fn from(config: &crate::config::WebSocketConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_user: config.max_connections_per_user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::ServerMessage;

    #[tokio::test]
    async fn test_deliver_queues_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new("alice".into(), vec![], tx);

        tokio_test::assert_ok!(handle.deliver(ServerMessage::Pong));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::Raw(ServerMessage::Pong))
        ));
    }

    #[tokio::test]
    async fn test_full_buffer_closes_connection() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("alice".into(), vec![], tx);

        tokio_test::assert_ok!(handle.deliver(ServerMessage::Heartbeat));
        let err = tokio_test::assert_err!(handle.deliver(ServerMessage::Heartbeat));
        assert!(matches!(err, ChatError::Delivery(id) if id == handle.id));
        assert!(handle.is_closed());

        // closed() resolves immediately once closed
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = std::sync::Arc::new(ConnectionHandle::new("alice".into(), vec![], tx));

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::task::yield_now().await;
        handle.close();

        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
