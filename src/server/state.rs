use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::connection_manager::ConnectionManager;
use crate::error::AppError;
use crate::resilience::CircuitBreaker;
use crate::store::{ChatStore, MemoryChatStore, PostgresChatStore};
use crate::websocket::ChatGateway;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn ChatStore>,
    pub gateway: Arc<ChatGateway>,
    /// Present when the Postgres store is in use
    pub db_circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build state over the configured store, running migrations when it is Postgres
    pub async fn new(settings: Settings) -> Result<Self, AppError> {
        if !settings.database.enabled {
            tracing::warn!("Database disabled, chat history lives in memory only");
            return Ok(Self::with_store(settings, Arc::new(MemoryChatStore::new())));
        }

        let breaker = Arc::new(CircuitBreaker::new("postgres"));
        let store = PostgresChatStore::connect(&settings.database, breaker.clone()).await?;
        store.migrate().await?;
        tracing::info!("Database migrations applied");

        let mut state = Self::with_store(settings, Arc::new(store));
        state.db_circuit_breaker = Some(breaker);
        Ok(state)
    }

    pub fn with_store(settings: Settings, store: Arc<dyn ChatStore>) -> Self {
        let gateway = Arc::new(ChatGateway::new(&settings, store.clone()));
        Self {
            settings: Arc::new(settings),
            store,
            gateway,
            db_circuit_breaker: None,
            start_time: Instant::now(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.gateway.connections()
    }
}
