//! In-memory chat store.
//!
//! Used when no database is configured and by the test suites. It can be
//! switched offline to exercise the persistence failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    direct_key, same_write, ChatStore, Message, MessageId, NewMessage, ReadAdvance, ReadPointer,
    Room, RoomId, RoomKind, RoomSummary, RoomUnread, StoreError, UserId,
};

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<RoomId, Room>,
    meetup_index: HashMap<i64, RoomId>,
    direct_index: HashMap<String, RoomId>,
    /// room_id -> messages in id order
    messages: HashMap<RoomId, Vec<Message>>,
    /// (room_id, sender_id, client_message_id) -> stored message
    by_client_id: HashMap<(RoomId, UserId, Uuid), Message>,
    /// (room_id, user_id) -> pointer
    pointers: HashMap<(RoomId, UserId), ReadPointer>,
    next_room_id: RoomId,
    next_message_id: MessageId,
}

pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    failing_writes: AtomicU32,
    write_delay_ms: AtomicU32,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_room_id: 1,
                next_message_id: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            write_delay_ms: AtomicU32::new(0),
        }
    }

    /// Simulate the database becoming unreachable (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` message writes fail with `Unavailable`
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every message write, for timeout paths
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Seed a room with a fixed id (tests and fixtures)
    pub fn insert_room(&self, room_id: RoomId, kind: RoomKind, members: &[&str]) -> Room {
        let mut state = self.state.write();
        let room = Room {
            id: room_id,
            kind,
            meetup_id: None,
            member_user_ids: members.iter().map(|m| m.to_string()).collect(),
            created_at: Utc::now(),
        };
        for member in members {
            state.pointers.insert(
                (room_id, member.to_string()),
                empty_pointer(room_id, member),
            );
        }
        state.rooms.insert(room_id, room.clone());
        state.next_room_id = state.next_room_id.max(room_id + 1);
        room
    }

    pub fn message_count(&self, room_id: RoomId) -> usize {
        self.state
            .read()
            .messages
            .get(&room_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn add_member_locked(state: &mut MemoryState, room_id: RoomId, user_id: &str) -> Option<Room> {
        let room = state.rooms.get_mut(&room_id)?;
        if !room.has_member(user_id) {
            room.member_user_ids.push(user_id.to_string());
        }
        let room = room.clone();
        state
            .pointers
            .entry((room_id, user_id.to_string()))
            .or_insert_with(|| empty_pointer(room_id, user_id));
        Some(room)
    }

    fn new_room_locked(state: &mut MemoryState, kind: RoomKind, meetup_id: Option<i64>) -> RoomId {
        let id = state.next_room_id;
        state.next_room_id += 1;
        state.rooms.insert(
            id,
            Room {
                id,
                kind,
                meetup_id,
                member_user_ids: Vec::new(),
                created_at: Utc::now(),
            },
        );
        id
    }

    fn unread_for(state: &MemoryState, room_id: RoomId, user_id: &str) -> u64 {
        let pointer = state
            .pointers
            .get(&(room_id, user_id.to_string()))
            .map(|p| p.last_read_message_id)
            .unwrap_or(0);
        state
            .messages
            .get(&room_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.id > pointer && m.sender_id != user_id)
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_pointer(room_id: RoomId, user_id: &str) -> ReadPointer {
    ReadPointer {
        room_id,
        user_id: user_id.to_string(),
        last_read_message_id: 0,
        read_at: None,
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }

    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>, StoreError> {
        self.check_available()?;
        let state = self.state.read();
        let mut summaries: Vec<RoomSummary> = state
            .rooms
            .values()
            .filter(|room| room.has_member(user_id))
            .map(|room| RoomSummary {
                room: room.clone(),
                last_message: state.messages.get(&room.id).and_then(|m| m.last().cloned()),
                unread_count: Self::unread_for(&state, room.id, user_id),
            })
            .collect();

        summaries.sort_by(|a, b| {
            let a_time = a.last_message.as_ref().map(|m| m.created_at).unwrap_or(a.room.created_at);
            let b_time = b.last_message.as_ref().map(|m| m.created_at).unwrap_or(b.room.created_at);
            b_time.cmp(&a_time).then(b.room.id.cmp(&a.room.id))
        });
        Ok(summaries)
    }

    async fn is_member(&self, room_id: RoomId, user_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .rooms
            .get(&room_id)
            .map(|room| room.has_member(user_id))
            .unwrap_or(false))
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .rooms
            .get(&room_id)
            .map(|room| room.member_user_ids.clone())
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.check_available()?;
        if self.take_write_failure() {
            return Err(StoreError::Unavailable("simulated write failure".into()));
        }

        let mut state = self.state.write();
        let key = (
            message.room_id,
            message.sender_id.clone(),
            message.client_message_id,
        );
        if let Some(existing) = state.by_client_id.get(&key).cloned() {
            return same_write(existing, &message);
        }
        if !state.rooms.contains_key(&message.room_id) {
            return Err(StoreError::NotFound(format!("room {}", message.room_id)));
        }

        let id = state.next_message_id;
        state.next_message_id += 1;
        let stored = Message {
            id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            body: message.body,
            created_at: Utc::now(),
            client_message_id: message.client_message_id,
        };
        state
            .messages
            .entry(stored.room_id)
            .or_default()
            .push(stored.clone());
        state.by_client_id.insert(key, stored.clone());
        Ok(stored)
    }

    async fn messages(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_available()?;
        let state = self.state.read();
        let Some(all) = state.messages.get(&room_id) else {
            return Ok(Vec::new());
        };
        let eligible: Vec<&Message> = all
            .iter()
            .filter(|m| before.map(|b| m.id < b).unwrap_or(true))
            .collect();
        let skip = eligible.len().saturating_sub(limit.max(0) as usize);
        Ok(eligible.into_iter().skip(skip).cloned().collect())
    }

    async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .messages
            .get(&room_id)
            .and_then(|m| m.last())
            .map(|m| m.id))
    }

    async fn advance_read_pointer(
        &self,
        room_id: RoomId,
        user_id: &str,
        message_id: MessageId,
    ) -> Result<ReadAdvance, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let is_member = state
            .rooms
            .get(&room_id)
            .map(|room| room.has_member(user_id))
            .unwrap_or(false);
        if !is_member {
            return Err(StoreError::NotFound(format!(
                "membership of {} in room {}",
                user_id, room_id
            )));
        }

        let pointer = state
            .pointers
            .entry((room_id, user_id.to_string()))
            .or_insert_with(|| empty_pointer(room_id, user_id));
        let advanced = message_id > pointer.last_read_message_id;
        if advanced {
            pointer.last_read_message_id = message_id;
            pointer.read_at = Some(Utc::now());
        }
        Ok(ReadAdvance {
            pointer: pointer.clone(),
            advanced,
        })
    }

    async fn unread_counts(&self, user_id: &str) -> Result<Vec<RoomUnread>, StoreError> {
        self.check_available()?;
        let state = self.state.read();
        let mut counts: Vec<RoomUnread> = state
            .rooms
            .values()
            .filter(|room| room.has_member(user_id))
            .map(|room| RoomUnread {
                room_id: room.id,
                unread_count: Self::unread_for(&state, room.id, user_id),
            })
            .collect();
        counts.sort_by_key(|c| c.room_id);
        Ok(counts)
    }

    async fn create_meetup_room(&self, meetup_id: i64, creator_id: &str) -> Result<Room, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let existing = state.meetup_index.get(&meetup_id).copied();
        let room_id = match existing {
            Some(id) => id,
            None => {
                let id = Self::new_room_locked(&mut state, RoomKind::Meetup, Some(meetup_id));
                state.meetup_index.insert(meetup_id, id);
                id
            }
        };
        Self::add_member_locked(&mut state, room_id, creator_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }

    async fn create_direct_room(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError> {
        self.check_available()?;
        if user_a == user_b {
            return Err(StoreError::Conflict("cannot open a direct room with yourself".into()));
        }
        let key = direct_key(user_a, user_b);
        let mut state = self.state.write();
        let existing = state.direct_index.get(&key).copied();
        let room_id = match existing {
            Some(id) => id,
            None => {
                let id = Self::new_room_locked(&mut state, RoomKind::Direct, None);
                state.direct_index.insert(key, id);
                id
            }
        };
        Self::add_member_locked(&mut state, room_id, user_a);
        Self::add_member_locked(&mut state, room_id, user_b)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }

    async fn add_meetup_member(&self, meetup_id: i64, user_id: &str) -> Result<Room, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let room_id = *state
            .meetup_index
            .get(&meetup_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat room for meetup {}", meetup_id)))?;
        Self::add_member_locked(&mut state, room_id, user_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_idempotent_on_client_id() {
        let store = MemoryChatStore::new();
        store.insert_room(42, RoomKind::Meetup, &["alice", "bob"]);

        let new = NewMessage::new(42, "alice", "hello");
        let first = store.insert_message(new.clone()).await.unwrap();
        let second = store.insert_message(new).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.message_count(42), 1);
    }

    #[tokio::test]
    async fn test_client_id_is_scoped_to_room_and_sender() {
        let store = MemoryChatStore::new();
        store.insert_room(9, RoomKind::Direct, &["alice", "carol"]);
        store.insert_room(42, RoomKind::Meetup, &["alice", "bob"]);
        let key = Uuid::new_v4();

        let mut private = NewMessage::new(9, "alice", "for carol only");
        private.client_message_id = key;
        let mut public = NewMessage::new(42, "alice", "hi all");
        public.client_message_id = key;

        let first = store.insert_message(private).await.unwrap();
        let second = store.insert_message(public).await.unwrap();

        assert_eq!(first.room_id, 9);
        assert_eq!(second.room_id, 42);
        assert_eq!(second.body, "hi all");
        assert_eq!(store.message_count(42), 1);
    }

    #[tokio::test]
    async fn test_reused_client_id_with_new_body_conflicts() {
        let store = MemoryChatStore::new();
        store.insert_room(42, RoomKind::Meetup, &["alice"]);

        let first = NewMessage::new(42, "alice", "hello");
        let mut edited = NewMessage::new(42, "alice", "goodbye");
        edited.client_message_id = first.client_message_id;

        store.insert_message(first).await.unwrap();
        assert!(matches!(
            store.insert_message(edited).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.message_count(42), 1);
    }

    #[tokio::test]
    async fn test_read_pointer_never_regresses() {
        let store = MemoryChatStore::new();
        store.insert_room(1, RoomKind::Direct, &["alice", "bob"]);

        let advance = store.advance_read_pointer(1, "bob", 10).await.unwrap();
        assert!(advance.advanced);
        let advance = store.advance_read_pointer(1, "bob", 4).await.unwrap();
        assert!(!advance.advanced);
        assert_eq!(advance.pointer.last_read_message_id, 10);
    }

    #[tokio::test]
    async fn test_unread_excludes_own_messages() {
        let store = MemoryChatStore::new();
        store.insert_room(1, RoomKind::Direct, &["alice", "bob"]);
        store.insert_message(NewMessage::new(1, "alice", "one")).await.unwrap();
        store.insert_message(NewMessage::new(1, "alice", "two")).await.unwrap();
        store.insert_message(NewMessage::new(1, "bob", "three")).await.unwrap();

        let bob = store.unread_counts("bob").await.unwrap();
        assert_eq!(bob, vec![RoomUnread { room_id: 1, unread_count: 2 }]);
        let alice = store.unread_counts("alice").await.unwrap();
        assert_eq!(alice[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_history_pages_backwards() {
        let store = MemoryChatStore::new();
        store.insert_room(1, RoomKind::Meetup, &["alice"]);
        for i in 0..5 {
            store
                .insert_message(NewMessage::new(1, "alice", format!("m{}", i)))
                .await
                .unwrap();
        }

        let latest = store.messages(1, None, 2).await.unwrap();
        assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), vec![4, 5]);
        let older = store.messages(1, Some(4), 2).await.unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_direct_room_reused_for_pair() {
        let store = MemoryChatStore::new();
        let first = store.create_direct_room("alice", "bob").await.unwrap();
        let second = store.create_direct_room("bob", "alice").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.member_user_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_store_rejects_operations() {
        let store = MemoryChatStore::new();
        store.insert_room(1, RoomKind::Meetup, &["alice"]);
        store.set_available(false);

        let result = store.insert_message(NewMessage::new(1, "alice", "hi")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(store.is_member(1, "alice").await.is_err());
    }

    #[tokio::test]
    async fn test_meetup_members_are_added() {
        let store = MemoryChatStore::new();
        let room = store.create_meetup_room(900, "host").await.unwrap();
        let room_after = store.add_meetup_member(900, "guest").await.unwrap();

        assert_eq!(room.id, room_after.id);
        assert!(store.is_member(room.id, "guest").await.unwrap());
        assert!(matches!(
            store.add_meetup_member(901, "guest").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
