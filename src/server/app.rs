use axum::{http::HeaderValue, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::websocket::ws_handler;

use super::AppState;

/// REST bodies are small JSON documents
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    Router::new()
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        .merge(api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .map_response(|res: axum::response::Response<_>| res.map(axum::body::Body::new))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Any origin unless an allow-list is configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(allowed)
    }
}
