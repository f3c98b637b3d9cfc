// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod store;

// Chat core
pub mod broadcaster;
pub mod connection_manager;
pub mod presence;
pub mod receipts;
pub mod rooms;
pub mod typing;
pub mod unread;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod client;
pub mod discovery;
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
