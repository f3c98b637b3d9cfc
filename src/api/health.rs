//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::connection_manager::ConnectionStats;
use crate::resilience::{CircuitBreakerStats, CircuitState};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealthResponse,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct StoreHealthResponse {
    pub backend: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitState>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub online_users: usize,
    pub live_rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStats,
    pub typing_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_circuit_breaker: Option<CircuitBreakerStats>,
}

/// GET /health - 503 while the store is unreachable so probes fail over
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let reachable = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            false
        }
    };
    let conn_stats = state.connections().stats();

    let (status_code, status) = if reachable {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store: StoreHealthResponse {
            backend: state.store.backend_name().to_string(),
            reachable,
            circuit_breaker: state.db_circuit_breaker.as_ref().map(|cb| cb.state()),
        },
        connections: ConnectionHealthResponse {
            total: conn_stats.total_connections,
            online_users: conn_stats.online_users,
            live_rooms: conn_stats.live_rooms,
        },
    };

    (status_code, Json(body))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.connections().stats(),
        typing_entries: state.gateway.typing().active_count(),
        db_circuit_breaker: state.db_circuit_breaker.as_ref().map(|cb| cb.stats()),
    })
}
