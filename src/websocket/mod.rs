mod gateway;
mod handler;
mod message;

pub use gateway::ChatGateway;
pub use handler::{ws_handler, WsQuery};
pub use message::{event_name_of, ClientMessage, OutboundMessage, ServerMessage};
