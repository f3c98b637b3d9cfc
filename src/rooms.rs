//! Room registry: which live connections are currently viewing which room.
//!
//! Membership is always checked against the store before a connection is
//! admitted; the live sets are a cache that empties as connections leave.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::connection_manager::{fan_out, ConnectionHandle, ConnectionManager, LeaveOutcome};
use crate::error::ChatError;
use crate::store::{ChatStore, RoomId};
use crate::websocket::ServerMessage;

pub struct RoomRegistry {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn ChatStore>,
}

impl RoomRegistry {
    pub fn new(connections: Arc<ConnectionManager>, store: Arc<dyn ChatStore>) -> Self {
        Self { connections, store }
    }

    /// Admit a connection to a room's live set.
    ///
    /// Joining twice is harmless; the second join only re-verifies membership.
    #[tracing::instrument(
        name = "rooms.join",
        skip(self, handle),
        fields(connection_id = %handle.id, user_id = %handle.user_id)
    )]
    pub async fn join(&self, handle: &ConnectionHandle, room_id: RoomId) -> Result<bool, ChatError> {
        if !self.store.is_member(room_id, &handle.user_id).await? {
            tracing::warn!(
                connection_id = %handle.id,
                user_id = %handle.user_id,
                room_id = room_id,
                "Join rejected, not a member"
            );
            return Err(ChatError::membership(room_id, &handle.user_id));
        }

        let outcome = self
            .connections
            .join_room(handle.id, room_id)
            .map_err(|e| ChatError::Validation(e.to_string()))?;

        if outcome.newly_joined {
            tracing::debug!(connection_id = %handle.id, room_id = room_id, "Joined room");
        }
        Ok(outcome.newly_joined)
    }

    /// Remove a connection from a room. No-op when it was not joined.
    pub fn leave(&self, handle: &ConnectionHandle, room_id: RoomId) -> LeaveOutcome {
        let outcome = self.connections.leave_room(handle.id, room_id);
        if outcome.user_left_room {
            self.announce_departure(&handle.user_id, room_id);
        }
        if outcome.was_joined {
            tracing::debug!(connection_id = %handle.id, room_id = room_id, "Left room");
        }
        outcome
    }

    /// Live connection ids joined to a room
    pub fn members(&self, room_id: RoomId) -> HashSet<Uuid> {
        self.connections.room_connection_ids(room_id)
    }

    /// Tell the rest of the room that a user is no longer viewing it
    pub fn announce_departure(&self, user_id: &str, room_id: RoomId) {
        let remaining = self.connections.room_connections(room_id);
        fan_out(
            &remaining,
            &ServerMessage::ParticipantLeft {
                user_id: user_id.to_string(),
                room_id,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChatStore, RoomKind};
    use tokio::sync::mpsc;

    fn setup() -> (RoomRegistry, Arc<ConnectionManager>, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        store.insert_room(42, RoomKind::Meetup, &["alice", "bob"]);
        let connections = Arc::new(ConnectionManager::new());
        let registry = RoomRegistry::new(connections.clone(), store.clone());
        (registry, connections, store)
    }

    fn connect(
        connections: &ConnectionManager,
        user: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<crate::websocket::OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let reg = connections.register(user.to_string(), vec![], tx).unwrap();
        (reg.handle, rx)
    }

    #[tokio::test]
    async fn test_non_member_rejected() {
        let (registry, connections, _) = setup();
        let (carol, _rx) = connect(&connections, "carol");

        let err = registry.join(&carol, 42).await.unwrap_err();
        assert!(matches!(err, ChatError::Membership { room_id: 42, .. }));
        assert!(registry.members(42).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_join_single_entry() {
        let (registry, connections, _) = setup();
        let (alice, _rx) = connect(&connections, "alice");

        assert!(registry.join(&alice, 42).await.unwrap());
        assert!(!registry.join(&alice, 42).await.unwrap());
        assert_eq!(registry.members(42).len(), 1);
    }

    #[tokio::test]
    async fn test_join_fails_when_store_down() {
        let (registry, connections, store) = setup();
        let (alice, _rx) = connect(&connections, "alice");
        store.set_available(false);

        assert!(matches!(
            registry.join(&alice, 42).await,
            Err(ChatError::Persistence(_))
        ));
        assert!(registry.members(42).is_empty());
    }

    #[tokio::test]
    async fn test_leave_announces_to_remaining() {
        let (registry, connections, _) = setup();
        let (alice, _arx) = connect(&connections, "alice");
        let (bob, mut brx) = connect(&connections, "bob");
        registry.join(&alice, 42).await.unwrap();
        registry.join(&bob, 42).await.unwrap();

        let outcome = registry.leave(&alice, 42);
        assert!(outcome.user_left_room);

        let frame = brx.try_recv().unwrap().into_text().unwrap();
        assert!(frame.contains("participant_left"));
        assert!(frame.contains("alice"));
    }
}
