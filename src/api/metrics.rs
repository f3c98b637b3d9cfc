//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, ConnectionMetrics, PersistenceMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh gauges that are read from live state rather than updated on events
fn update_metrics_from_state(state: &AppState) {
    let stats = state.connections().stats();
    ConnectionMetrics::set_live(stats.total_connections, stats.online_users, stats.live_rooms);

    if let Some(cb) = &state.db_circuit_breaker {
        PersistenceMetrics::set_circuit_state(cb.state());
    }
}
