use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::chat::{
    add_meetup_member, create_direct_room, create_meetup_room, get_messages, list_rooms,
    mark_all_read, mark_room_read, send_message, unread_count,
};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Chat REST surface, the durable source of truth
        .nest(
            "/chat",
            Router::new()
                .route("/rooms", get(list_rooms))
                .route("/rooms/meetup", post(create_meetup_room))
                .route("/rooms/direct", post(create_direct_room))
                .route("/rooms/meetup/{meetup_id}/add-user", post(add_meetup_member))
                .route("/rooms/{room_id}/messages", get(get_messages).post(send_message))
                .route("/rooms/{room_id}/read", post(mark_room_read))
                .route("/read-all", post(mark_all_read))
                .route("/unread-count", get(unread_count)),
        )
}
