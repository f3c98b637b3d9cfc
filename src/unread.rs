//! Unread totals: authoritative pull from the store, best-effort push.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection_manager::{fan_out, ConnectionManager};
use crate::error::ChatError;
use crate::metrics::SignalMetrics;
use crate::store::{ChatStore, RoomId, RoomUnread};
use crate::websocket::ServerMessage;

/// Body of `GET /chat/unread-count`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub unread_count: u64,
    pub rooms: Vec<RoomUnread>,
}

impl UnreadSummary {
    pub fn from_rooms(rooms: Vec<RoomUnread>) -> Self {
        Self {
            unread_count: rooms.iter().map(|r| r.unread_count).sum(),
            rooms,
        }
    }

    pub fn room(&self, room_id: RoomId) -> u64 {
        self.rooms
            .iter()
            .find(|r| r.room_id == room_id)
            .map(|r| r.unread_count)
            .unwrap_or(0)
    }
}

pub struct UnreadAggregator {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn ChatStore>,
}

impl UnreadAggregator {
    pub fn new(connections: Arc<ConnectionManager>, store: Arc<dyn ChatStore>) -> Self {
        Self { connections, store }
    }

    /// Per-room counts and their sum, straight from the store
    pub async fn summary(&self, user_id: &str) -> Result<UnreadSummary, ChatError> {
        Ok(UnreadSummary::from_rooms(self.store.unread_counts(user_id).await?))
    }

    pub async fn room_unread(&self, user_id: &str, room_id: RoomId) -> Result<u64, ChatError> {
        Ok(self.summary(user_id).await?.room(room_id))
    }

    /// Push fresh totals to every live connection of a user.
    ///
    /// Best effort: a failed recompute is logged, and the client's next REST
    /// pull corrects any drift.
    pub async fn push_to_user(&self, user_id: &str) {
        let targets = self.connections.user_connections(user_id);
        if targets.is_empty() {
            return;
        }

        match self.store.unread_counts(user_id).await {
            Ok(rooms) => {
                SignalMetrics::record_unread_push();
                fan_out(&targets, &ServerMessage::unread(rooms));
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to recompute unread counts");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChatStore, NewMessage, RoomKind};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_total_is_sum_of_rooms() {
        let store = Arc::new(MemoryChatStore::new());
        store.insert_room(1, RoomKind::Meetup, &["alice", "bob"]);
        store.insert_room(2, RoomKind::Direct, &["alice", "bob"]);
        store.insert_message(NewMessage::new(1, "bob", "a")).await.unwrap();
        store.insert_message(NewMessage::new(1, "bob", "b")).await.unwrap();
        store.insert_message(NewMessage::new(2, "bob", "c")).await.unwrap();

        let unread = UnreadAggregator::new(Arc::new(ConnectionManager::new()), store);
        let summary = unread.summary("alice").await.unwrap();
        assert_eq!(summary.unread_count, 3);
        assert_eq!(summary.room(1), 2);
        assert_eq!(summary.room(2), 1);
        assert_eq!(summary.room(99), 0);
    }

    #[tokio::test]
    async fn test_push_reaches_all_devices() {
        let store = Arc::new(MemoryChatStore::new());
        store.insert_room(1, RoomKind::Meetup, &["alice", "bob"]);
        store.insert_message(NewMessage::new(1, "bob", "a")).await.unwrap();

        let connections = Arc::new(ConnectionManager::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        connections.register("alice".into(), vec![], tx1).unwrap();
        connections.register("alice".into(), vec![], tx2).unwrap();

        let unread = UnreadAggregator::new(connections, store);
        unread.push_to_user("alice").await;

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.try_recv().unwrap().into_text().unwrap();
            assert!(frame.contains("unread-count-updated"));
            assert!(frame.contains(r#""unreadCount":1"#));
        }
    }
}
