//! API layer - HTTP endpoint handlers organized by domain.

mod chat;
mod health;
mod metrics;
mod routes;

pub use chat::{
    add_meetup_member, create_direct_room, create_meetup_room, get_messages, list_rooms,
    mark_all_read, mark_room_read, send_message, unread_count, MessagesPage,
};
pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
