//! Persistence collaborator for rooms, memberships, messages and read pointers.
//!
//! Everything durable goes through [`ChatStore`]. The live registries in this
//! crate are caches over it and never the source of truth:
//! - `MemoryChatStore`: in-process store for development and tests
//! - `PostgresChatStore`: sqlx-backed store guarded by a circuit breaker

mod memory;
mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PostgresChatStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type RoomId = i64;
pub type MessageId = i64;
pub type UserId = String;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Meetup,
    Direct,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Meetup => "meetup",
            RoomKind::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "meetup" => Some(RoomKind::Meetup),
            "direct" => Some(RoomKind::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meetup_id: Option<i64>,
    pub member_user_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.member_user_ids.iter().any(|m| m == user_id)
    }
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Idempotency key chosen by the writer; retries reuse it
    #[serde(skip_serializing)]
    #[serde(default)]
    pub client_message_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub client_message_id: Uuid,
}

impl NewMessage {
    pub fn new(room_id: RoomId, sender_id: impl Into<UserId>, body: impl Into<String>) -> Self {
        Self {
            room_id,
            sender_id: sender_id.into(),
            body: body.into(),
            client_message_id: Uuid::new_v4(),
        }
    }
}

/// Per-user per-room read watermark. Never decreases.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPointer {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub last_read_message_id: MessageId,
    pub read_at: Option<DateTime<Utc>>,
}

/// Outcome of a read pointer advance
#[derive(Debug, Clone)]
pub struct ReadAdvance {
    pub pointer: ReadPointer,
    /// false when the requested id was not ahead of the stored pointer
    pub advanced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUnread {
    pub room_id: RoomId,
    pub unread_count: u64,
}

/// Durable store for chat data.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Short name used in logs and `/health`
    fn backend_name(&self) -> &'static str;

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StoreError>;

    async fn room(&self, room_id: RoomId) -> Result<Room, StoreError>;

    /// Rooms the user belongs to, most recently active first
    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>, StoreError>;

    async fn is_member(&self, room_id: RoomId, user_id: &str) -> Result<bool, StoreError>;

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Stores a message. Inserting the same `client_message_id` twice returns the first row.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Messages in ascending id order, optionally only those older than `before`
    async fn messages(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError>;

    /// Moves the pointer to `max(current, message_id)`
    async fn advance_read_pointer(
        &self,
        room_id: RoomId,
        user_id: &str,
        message_id: MessageId,
    ) -> Result<ReadAdvance, StoreError>;

    /// Unread count for every room the user belongs to; own messages are not counted
    async fn unread_counts(&self, user_id: &str) -> Result<Vec<RoomUnread>, StoreError>;

    /// Returns the existing room when the meetup already has one
    async fn create_meetup_room(&self, meetup_id: i64, creator_id: &str) -> Result<Room, StoreError>;

    /// Returns the existing room when the pair already has one
    async fn create_direct_room(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError>;

    async fn add_meetup_member(&self, meetup_id: i64, user_id: &str) -> Result<Room, StoreError>;
}

/// A replayed key must carry the same write it was first used for
pub(crate) fn same_write(existing: Message, message: &NewMessage) -> Result<Message, StoreError> {
    if existing.room_id == message.room_id
        && existing.sender_id == message.sender_id
        && existing.body == message.body
    {
        Ok(existing)
    } else {
        Err(StoreError::Conflict(format!(
            "client message id {} already used for a different message",
            message.client_message_id
        )))
    }
}

/// Canonical key for a direct room between two users
pub(crate) fn direct_key(user_a: &str, user_b: &str) -> String {
    if user_a <= user_b {
        format!("{}:{}", user_a, user_b)
    } else {
        format!("{}:{}", user_b, user_a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_is_order_independent() {
        assert_eq!(direct_key("alice", "bob"), direct_key("bob", "alice"));
    }

    #[test]
    fn test_room_kind_round_trip() {
        assert_eq!(RoomKind::parse(RoomKind::Meetup.as_str()), Some(RoomKind::Meetup));
        assert_eq!(RoomKind::parse("group"), None);
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let message = Message {
            id: 7,
            room_id: 42,
            sender_id: "alice".into(),
            body: "hello".into(),
            created_at: Utc::now(),
            client_message_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["roomId"], 42);
        assert_eq!(json["senderId"], "alice");
        assert!(json.get("clientMessageId").is_none());
    }
}
