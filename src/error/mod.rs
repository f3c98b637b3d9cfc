use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Failures of the chat core, surfaced to the caller that initiated the operation.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Handshake token invalid or expired
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Join or send by a user who is not a member of the room
    #[error("User {user_id} is not a member of room {room_id}")]
    Membership { room_id: i64, user_id: String },

    /// Message write failed or timed out; nothing was broadcast
    #[error("Failed to persist message: {0}")]
    Persistence(String),

    /// A single connection could not take a frame
    #[error("Delivery to connection {0} failed")]
    Delivery(uuid::Uuid),

    /// Endpoint probe did not answer in time
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChatError {
    /// Stable code sent in socket `error` frames and REST bodies
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Auth(_) => "AUTH_ERROR",
            ChatError::Membership { .. } => "MEMBERSHIP_ERROR",
            ChatError::Persistence(_) => "PERSISTENCE_ERROR",
            ChatError::Delivery(_) => "DELIVERY_ERROR",
            ChatError::Timeout(_) => "TIMEOUT_ERROR",
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn membership(room_id: i64, user_id: &str) -> Self {
        ChatError::Membership {
            room_id,
            user_id: user_id.to_string(),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ChatError::NotFound(what),
            StoreError::Conflict(msg) => ChatError::Validation(msg),
            other => ChatError::Persistence(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Chat(e.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Auth(msg) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
            AppError::Chat(e) => {
                let status = match e {
                    ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
                    ChatError::Membership { .. } => StatusCode::FORBIDDEN,
                    ChatError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ChatError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    ChatError::Validation(_) => StatusCode::BAD_REQUEST,
                    ChatError::NotFound(_) => StatusCode::NOT_FOUND,
                };
                let log_msg = e.to_string();
                let client_msg = match e {
                    ChatError::Persistence(_) if is_production() => {
                        "Message could not be stored, please retry".to_string()
                    }
                    _ => log_msg.clone(),
                };
                (status, e.code(), client_msg, log_msg)
            }
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_chat_taxonomy() {
        let err: ChatError = StoreError::Unavailable("db down".into()).into();
        assert!(matches!(err, ChatError::Persistence(_)));
        assert_eq!(err.code(), "PERSISTENCE_ERROR");

        let err: ChatError = StoreError::NotFound("room 7".into()).into();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_membership_status_code() {
        let response = AppError::Chat(ChatError::membership(42, "carol")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
