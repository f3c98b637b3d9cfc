mod settings;

pub use settings::{
    ChatConfig, DatabaseConfig, DiscoveryConfig, JwtConfig, OtelConfig, ServerConfig, Settings,
    WebSocketConfig,
};
