//! Per (room, user) typing indicator with auto-expiry.
//!
//! Idle → Typing on the first start signal; further starts only push the
//! expiry out. Typing → Idle on stop, on expiry, or when the connection that
//! started it goes away. Only transitions are relayed to the room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::connection_manager::{fan_out, ConnectionHandle, ConnectionManager};
use crate::metrics::SignalMetrics;
use crate::store::{RoomId, UserId};
use crate::websocket::ServerMessage;

type TypingKey = (RoomId, UserId);

struct TypingEntry {
    connection_id: Uuid,
    generation: u64,
    timer: AbortHandle,
}

pub struct TypingController {
    connections: Arc<ConnectionManager>,
    entries: DashMap<TypingKey, TypingEntry>,
    generation: AtomicU64,
    expiry: Duration,
}

impl TypingController {
    pub fn new(connections: Arc<ConnectionManager>, expiry: Duration) -> Self {
        Self {
            connections,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            expiry,
        }
    }

    /// Start or renew typing. Returns true when this was an Idle → Typing transition.
    pub fn start(self: &Arc<Self>, handle: &ConnectionHandle, room_id: RoomId) -> bool {
        if !self.connections.is_joined(handle.id, room_id) {
            tracing::debug!(
                connection_id = %handle.id,
                room_id = room_id,
                "Typing signal for a room the connection has not joined"
            );
            return false;
        }

        let key = (room_id, handle.user_id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let started = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.timer.abort();
                entry.timer = self.spawn_timer(key.clone(), generation);
                entry.generation = generation;
                entry.connection_id = handle.id;
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TypingEntry {
                    connection_id: handle.id,
                    generation,
                    timer: self.spawn_timer(key.clone(), generation),
                });
                true
            }
        };

        if started {
            SignalMetrics::record_typing("start");
            self.relay(room_id, &handle.user_id, true);
        }
        started
    }

    /// Explicit stop. Returns true when the user was typing.
    pub fn stop(&self, handle: &ConnectionHandle, room_id: RoomId) -> bool {
        let key = (room_id, handle.user_id.clone());
        match self.entries.remove(&key) {
            Some((_, entry)) => {
                entry.timer.abort();
                SignalMetrics::record_typing("stop");
                self.relay(room_id, &handle.user_id, false);
                true
            }
            None => false,
        }
    }

    /// Drop every entry started by a connection without relaying anything.
    ///
    /// Safe to call while the connection manager lock is held.
    pub fn cancel_for_connection(&self, connection_id: Uuid) -> Vec<(RoomId, UserId)> {
        let keys: Vec<TypingKey> = self
            .entries
            .iter()
            .filter(|e| e.value().connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                self.entries
                    .remove_if(&key, |_, e| e.connection_id == connection_id)
                    .map(|(key, entry)| {
                        entry.timer.abort();
                        key
                    })
            })
            .collect()
    }

    /// Relay `isTyping=false` for entries removed by `cancel_for_connection`
    pub fn announce_cancelled(&self, cancelled: &[(RoomId, UserId)]) {
        for (room_id, user_id) in cancelled {
            SignalMetrics::record_typing("cancelled");
            self.relay(*room_id, user_id, false);
        }
    }

    pub fn is_typing(&self, room_id: RoomId, user_id: &str) -> bool {
        self.entries.contains_key(&(room_id, user_id.to_string()))
    }

    /// (room, user) pairs currently typing
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    fn spawn_timer(self: &Arc<Self>, key: TypingKey, generation: u64) -> AbortHandle {
        let controller = Arc::downgrade(self);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(controller) = controller.upgrade() {
                controller.expire(key, generation);
            }
        })
        .abort_handle()
    }

    fn expire(&self, key: TypingKey, generation: u64) {
        let removed = self
            .entries
            .remove_if(&key, |_, e| e.generation == generation);
        if let Some(((room_id, user_id), _)) = removed {
            SignalMetrics::record_typing("expired");
            tracing::debug!(room_id = room_id, user_id = %user_id, "Typing expired");
            self.relay(room_id, &user_id, false);
        }
    }

    fn relay(&self, room_id: RoomId, user_id: &str, is_typing: bool) {
        let others: Vec<Arc<ConnectionHandle>> = self
            .connections
            .room_connections(room_id)
            .into_iter()
            .filter(|h| h.user_id != user_id)
            .collect();
        fan_out(
            &others,
            &ServerMessage::UserTyping {
                user_id: user_id.to_string(),
                room_id,
                is_typing,
            },
        );
    }
}
