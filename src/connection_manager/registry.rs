use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::ConnectionMetrics;
use crate::store::{RoomId, UserId};
use crate::websocket::OutboundMessage;

use super::stats::{ConnectionStats, RoomInfo};
use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits};

#[derive(Default)]
struct LiveIndex {
    /// connection_id -> handle
    connections: HashMap<Uuid, Arc<ConnectionHandle>>,
    /// user_id -> live connections (the presence refcount)
    users: HashMap<UserId, HashSet<Uuid>>,
    /// room_id -> joined connections
    rooms: HashMap<RoomId, HashSet<Uuid>>,
    /// connection_id -> joined rooms
    joined: HashMap<Uuid, HashSet<RoomId>>,
}

impl LiveIndex {
    fn user_in_room(&self, user_id: &str, room_id: RoomId) -> bool {
        self.rooms
            .get(&room_id)
            .map(|conns| {
                conns.iter().any(|id| {
                    self.connections
                        .get(id)
                        .map(|h| h.user_id == user_id)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn handles(&self, ids: Option<&HashSet<Uuid>>) -> Vec<Arc<ConnectionHandle>> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    fn publish_gauges(&self) {
        ConnectionMetrics::set_live(self.connections.len(), self.users.len(), self.rooms.len());
    }
}

/// Result of registering an authenticated connection
pub struct Registration {
    pub handle: Arc<ConnectionHandle>,
    /// The user's refcount went from 0 to 1
    pub came_online: bool,
}

/// Everything a disconnect removed, captured under one lock
pub struct Teardown {
    pub handle: Arc<ConnectionHandle>,
    pub rooms_left: Vec<RoomId>,
    /// Rooms where the user has no other joined connection
    pub rooms_vacated: Vec<RoomId>,
    /// The user's refcount went from 1 to 0
    pub went_offline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// false when the connection was already in the room
    pub newly_joined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_joined: bool,
    /// The user has no other connection left in the room
    pub user_left_room: bool,
}

/// Manages all authenticated WebSocket connections
pub struct ConnectionManager {
    index: RwLock<LiveIndex>,
    limits: ConnectionLimits,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            index: RwLock::new(LiveIndex::default()),
            limits,
        }
    }

    /// Register an authenticated connection and bump the user's refcount
    pub fn register(
        &self,
        user_id: UserId,
        roles: Vec<String>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Registration, ConnectionError> {
        let mut index = self.index.write();

        let current = index.connections.len();
        if current >= self.limits.max_connections {
            return Err(ConnectionError::TotalLimitExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        let user_current = index.users.get(&user_id).map(|c| c.len()).unwrap_or(0);
        if user_current >= self.limits.max_connections_per_user {
            return Err(ConnectionError::UserLimitExceeded {
                user_id,
                current: user_current,
                max: self.limits.max_connections_per_user,
            });
        }

        let handle = Arc::new(ConnectionHandle::new(user_id.clone(), roles, sender));
        index.connections.insert(handle.id, handle.clone());
        let user_conns = index.users.entry(user_id).or_default();
        user_conns.insert(handle.id);
        let came_online = user_conns.len() == 1;
        index.publish_gauges();
        drop(index);

        tracing::info!(
            connection_id = %handle.id,
            user_id = %handle.user_id,
            came_online = came_online,
            "Connection registered"
        );

        Ok(Registration {
            handle,
            came_online,
        })
    }

    /// Remove a connection from every index in one step.
    ///
    /// `on_teardown` runs while the lock is still held, so work done there
    /// (cancelling typing timers) lands in the same step. It must not call
    /// back into this manager.
    pub fn unregister<F>(&self, connection_id: Uuid, on_teardown: F) -> Option<Teardown>
    where
        F: FnOnce(&Teardown),
    {
        let mut index = self.index.write();
        let handle = index.connections.remove(&connection_id)?;

        let rooms_left: Vec<RoomId> = index
            .joined
            .remove(&connection_id)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();

        for room_id in &rooms_left {
            if let Some(conns) = index.rooms.get_mut(room_id) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    index.rooms.remove(room_id);
                }
            }
        }

        let rooms_vacated: Vec<RoomId> = rooms_left
            .iter()
            .copied()
            .filter(|room_id| !index.user_in_room(&handle.user_id, *room_id))
            .collect();

        let mut went_offline = false;
        if let Some(conns) = index.users.get_mut(&handle.user_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                index.users.remove(&handle.user_id);
                went_offline = true;
            }
        }

        let teardown = Teardown {
            handle,
            rooms_left,
            rooms_vacated,
            went_offline,
        };
        on_teardown(&teardown);
        teardown.handle.close();
        index.publish_gauges();
        drop(index);

        tracing::info!(
            connection_id = %connection_id,
            user_id = %teardown.handle.user_id,
            rooms_left = teardown.rooms_left.len(),
            went_offline = teardown.went_offline,
            "Connection unregistered"
        );

        Some(teardown)
    }

    /// Add a connection to a room's live set. Idempotent.
    pub fn join_room(
        &self,
        connection_id: Uuid,
        room_id: RoomId,
    ) -> Result<JoinOutcome, ConnectionError> {
        let mut index = self.index.write();
        if !index.connections.contains_key(&connection_id) {
            return Err(ConnectionError::UnknownConnection(connection_id));
        }

        let newly_joined = index.rooms.entry(room_id).or_default().insert(connection_id);
        index.joined.entry(connection_id).or_default().insert(room_id);
        index.publish_gauges();

        Ok(JoinOutcome { newly_joined })
    }

    /// Remove a connection from a room's live set. No-op when absent.
    pub fn leave_room(&self, connection_id: Uuid, room_id: RoomId) -> LeaveOutcome {
        let mut index = self.index.write();

        let was_joined = match index.rooms.get_mut(&room_id) {
            Some(conns) => {
                let removed = conns.remove(&connection_id);
                if conns.is_empty() {
                    index.rooms.remove(&room_id);
                }
                removed
            }
            None => false,
        };

        if !was_joined {
            return LeaveOutcome {
                was_joined: false,
                user_left_room: false,
            };
        }

        if let Some(rooms) = index.joined.get_mut(&connection_id) {
            rooms.remove(&room_id);
        }

        let user_left_room = match index.connections.get(&connection_id) {
            Some(handle) => !index.user_in_room(&handle.user_id, room_id),
            None => true,
        };
        index.publish_gauges();

        LeaveOutcome {
            was_joined,
            user_left_room,
        }
    }

    pub fn is_joined(&self, connection_id: Uuid, room_id: RoomId) -> bool {
        self.index
            .read()
            .rooms
            .get(&room_id)
            .map(|conns| conns.contains(&connection_id))
            .unwrap_or(false)
    }

    /// Connections currently joined to a room
    pub fn room_connections(&self, room_id: RoomId) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.read();
        index.handles(index.rooms.get(&room_id))
    }

    pub fn room_connection_ids(&self, room_id: RoomId) -> HashSet<Uuid> {
        self.index
            .read()
            .rooms
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Users with at least one connection joined to a room
    pub fn room_users(&self, room_id: RoomId) -> HashSet<UserId> {
        let index = self.index.read();
        index
            .handles(index.rooms.get(&room_id))
            .into_iter()
            .map(|h| h.user_id.clone())
            .collect()
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.read();
        index.handles(index.users.get(user_id))
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.index
            .read()
            .users
            .get(user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn user_of(&self, connection_id: Uuid) -> Option<UserId> {
        self.index
            .read()
            .connections
            .get(&connection_id)
            .map(|h| h.user_id.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.index.read().users.contains_key(user_id)
    }

    pub fn online_users(&self, user_ids: &[UserId]) -> HashMap<UserId, bool> {
        let index = self.index.read();
        user_ids
            .iter()
            .map(|id| (id.clone(), index.users.contains_key(id)))
            .collect()
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.index.read().connections.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.index.read().connections.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let index = self.index.read();
        let mut rooms: Vec<RoomInfo> = index
            .rooms
            .iter()
            .map(|(room_id, conns)| RoomInfo {
                room_id: *room_id,
                connection_count: conns.len(),
            })
            .collect();
        rooms.sort_by(|a, b| {
            b.connection_count
                .cmp(&a.connection_count)
                .then(a.room_id.cmp(&b.room_id))
        });

        ConnectionStats {
            total_connections: index.connections.len(),
            online_users: index.users.len(),
            live_rooms: index.rooms.len(),
            rooms,
        }
    }

    /// Connections inactive for longer than the timeout
    pub fn find_stale_connections(&self, timeout_secs: u64) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.index
            .read()
            .connections
            .values()
            .filter(|h| now.signed_duration_since(h.last_activity()) > timeout)
            .cloned()
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
