//! Client-side building blocks for applications talking to the chat gateway.

mod events;
mod outbox;
mod reconnect;
mod rest;
mod typing;

use thiserror::Error;

use crate::discovery::DiscoveryError;

pub use events::{EventBus, Subscription};
pub use outbox::Outbox;
pub use reconnect::{
    ConnectionState, ReconnectConfig, ReconnectionManager, Transport, TransportLink,
    TungsteniteTransport,
};
pub use rest::{ChatRestClient, UnreadSource};
pub use typing::TypingDebouncer;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    /// The transport's send buffer is full
    #[error("Outbound buffer full")]
    Backpressure,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Gave up after {attempts} reconnect attempt(s)")]
    GaveUp { attempts: u32 },

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
