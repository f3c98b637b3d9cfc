use axum::{extract::FromRequestParts, http::header, http::request::Parts};

use super::AppState;
use crate::auth::{bearer_token, Claims};
use crate::error::AppError;
use crate::metrics::ConnectionMetrics;

/// Caller identity for REST routes, taken from the same bearer JWT the socket uses
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn user_id(&self) -> &str {
        self.0.user_id()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| AppError::Auth("Missing bearer token".into()))?;

        state.gateway.jwt().validate(token).map(AuthUser).map_err(|e| {
            ConnectionMetrics::record_auth_failure("rest");
            AppError::Auth(e.to_string())
        })
    }
}
