//! Read receipts: advancing read pointers and telling the room.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection_manager::{fan_out, ConnectionManager};
use crate::error::ChatError;
use crate::metrics::SignalMetrics;
use crate::store::{ChatStore, MessageId, RoomId, UserId};
use crate::unread::UnreadAggregator;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub last_read_message_id: MessageId,
    pub read_at: Option<DateTime<Utc>>,
    /// false when there was nothing new to mark
    pub advanced: bool,
}

pub struct ReadReceiptSynchronizer {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn ChatStore>,
    unread: Arc<UnreadAggregator>,
}

impl ReadReceiptSynchronizer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<dyn ChatStore>,
        unread: Arc<UnreadAggregator>,
    ) -> Self {
        Self {
            connections,
            store,
            unread,
        }
    }

    /// Move the user's pointer to the room's latest message.
    ///
    /// Calling it again with no new messages changes nothing and emits nothing.
    #[tracing::instrument(name = "receipts.mark_read", skip(self))]
    pub async fn mark_read(&self, room_id: RoomId, user_id: &str) -> Result<ReadReceipt, ChatError> {
        if !self.store.is_member(room_id, user_id).await? {
            return Err(ChatError::membership(room_id, user_id));
        }

        let latest = self.store.latest_message_id(room_id).await?.unwrap_or(0);
        let advance = self.store.advance_read_pointer(room_id, user_id, latest).await?;

        let receipt = ReadReceipt {
            room_id,
            user_id: user_id.to_string(),
            last_read_message_id: advance.pointer.last_read_message_id,
            read_at: advance.pointer.read_at,
            advanced: advance.advanced,
        };

        if advance.advanced {
            SignalMetrics::record_read_receipt();
            self.announce(&receipt);
            self.unread.push_to_user(user_id).await;
            tracing::debug!(
                room_id = room_id,
                user_id = %user_id,
                message_id = receipt.last_read_message_id,
                "Read pointer advanced"
            );
        }

        Ok(receipt)
    }

    /// Mark every room the user belongs to as read
    pub async fn mark_all_read(&self, user_id: &str) -> Result<Vec<ReadReceipt>, ChatError> {
        let rooms = self.store.unread_counts(user_id).await?;
        let mut receipts = Vec::new();
        for room in rooms.into_iter().filter(|r| r.unread_count > 0) {
            receipts.push(self.mark_read(room.room_id, user_id).await?);
        }
        Ok(receipts)
    }

    /// Tell the other joined members the messages were seen
    fn announce(&self, receipt: &ReadReceipt) {
        let others: Vec<_> = self
            .connections
            .room_connections(receipt.room_id)
            .into_iter()
            .filter(|h| h.user_id != receipt.user_id)
            .collect();

        fan_out(
            &others,
            &ServerMessage::MessagesRead {
                user_id: receipt.user_id.clone(),
                room_id: receipt.room_id,
                last_read_message_id: receipt.last_read_message_id,
                read_at: receipt.read_at.unwrap_or_else(Utc::now),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChatStore, NewMessage, RoomKind};
    use crate::websocket::OutboundMessage;
    use tokio::sync::mpsc;

    struct Fixture {
        receipts: ReadReceiptSynchronizer,
        unread: Arc<UnreadAggregator>,
        store: Arc<MemoryChatStore>,
        alice_rx: mpsc::Receiver<OutboundMessage>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryChatStore::new());
        store.insert_room(42, RoomKind::Meetup, &["alice", "bob"]);
        store.insert_message(NewMessage::new(42, "alice", "one")).await.unwrap();
        store.insert_message(NewMessage::new(42, "alice", "two")).await.unwrap();

        let connections = Arc::new(ConnectionManager::new());
        let (atx, alice_rx) = mpsc::channel(16);
        let alice = connections.register("alice".into(), vec![], atx).unwrap().handle;
        connections.join_room(alice.id, 42).unwrap();

        let unread = Arc::new(UnreadAggregator::new(connections.clone(), store.clone()));
        let receipts = ReadReceiptSynchronizer::new(connections, store.clone(), unread.clone());
        Fixture {
            receipts,
            unread,
            store,
            alice_rx,
        }
    }

    #[tokio::test]
    async fn test_mark_read_zeroes_room() {
        let mut f = fixture().await;
        assert_eq!(f.unread.room_unread("bob", 42).await.unwrap(), 2);

        let receipt = f.receipts.mark_read(42, "bob").await.unwrap();
        assert!(receipt.advanced);
        assert_eq!(receipt.last_read_message_id, 2);
        assert_eq!(f.unread.room_unread("bob", 42).await.unwrap(), 0);

        let frame = f.alice_rx.try_recv().unwrap().into_text().unwrap();
        assert!(frame.contains("messages_read"));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let mut f = fixture().await;
        f.receipts.mark_read(42, "bob").await.unwrap();
        while f.alice_rx.try_recv().is_ok() {}

        let again = f.receipts.mark_read(42, "bob").await.unwrap();
        assert!(!again.advanced);
        assert_eq!(f.unread.room_unread("bob", 42).await.unwrap(), 0);
        assert!(f.alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_member_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.receipts.mark_read(42, "mallory").await,
            Err(ChatError::Membership { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let f = fixture().await;
        f.store.insert_room(7, RoomKind::Direct, &["alice", "bob"]);
        f.store.insert_message(NewMessage::new(7, "alice", "hey")).await.unwrap();

        let receipts = f.receipts.mark_all_read("bob").await.unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(f.unread.summary("bob").await.unwrap().unread_count, 0);
    }
}
