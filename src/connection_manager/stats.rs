//! Connection statistics and info structures

use serde::Serialize;

use crate::store::RoomId;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub online_users: usize,
    pub live_rooms: usize,
    /// Most populated rooms first
    pub rooms: Vec<RoomInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub connection_count: usize,
}
