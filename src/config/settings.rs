use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends heartbeat frames)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// How long an unauthenticated connection may stay open
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Delay between queuing `auth_error` and closing the socket
    #[serde(default = "default_auth_error_grace_ms")]
    pub auth_error_grace_ms: u64,
    /// Outbound frames buffered per connection before it is treated as a slow consumer
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Concurrent devices per user
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_typing_expiry_ms")]
    pub typing_expiry_ms: u64,
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// When disabled the service runs on the in-memory store
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Candidate base URLs, probed in order
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Full passes over the candidate list before giving up
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_heartbeat_interval() -> u64 {
    30 // 30 seconds
}

fn default_connection_timeout() -> u64 {
    120 // 2 minutes
}

fn default_cleanup_interval() -> u64 {
    60 // 1 minute
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_auth_error_grace_ms() -> u64 {
    500
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_user() -> usize {
    10
}

fn default_typing_expiry_ms() -> u64 {
    2_000
}

fn default_persist_timeout_ms() -> u64 {
    3_000
}

fn default_persist_retries() -> u32 {
    1
}

fn default_max_body_len() -> usize {
    4_000
}

fn default_history_page_size() -> i64 {
    50
}

fn default_database_url() -> String {
    "postgres://localhost:5432/meetup".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_max_rounds() -> u32 {
    2
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "meetup-chat-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("websocket.heartbeat_interval", 30)?
            .set_default("websocket.connection_timeout", 120)?
            .set_default("websocket.cleanup_interval", 60)?
            .set_default("chat.typing_expiry_ms", 2000)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // CHAT_SERVER__PORT, CHAT_JWT__SECRET, CHAT_DATABASE__URL, CHAT_CHAT__TYPING_EXPIRY_MS, ...
            .add_source(
                Environment::with_prefix("CHAT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("discovery.candidates")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl WebSocketConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn auth_error_grace(&self) -> Duration {
        Duration::from_millis(self.auth_error_grace_ms)
    }
}

impl ChatConfig {
    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            auth_error_grace_ms: default_auth_error_grace_ms(),
            outbound_buffer: default_outbound_buffer(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_expiry_ms: default_typing_expiry_ms(),
            persist_timeout_ms: default_persist_timeout_ms(),
            persist_retries: default_persist_retries(),
            max_body_len: default_max_body_len(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            candidates: vec![],
            probe_path: default_probe_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
