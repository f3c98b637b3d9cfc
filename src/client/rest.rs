//! REST side of the client: authoritative pulls that back up the socket.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::api::MessagesPage;
use crate::discovery::EndpointResolver;
use crate::receipts::ReadReceipt;
use crate::store::{MessageId, RoomId, RoomSummary};
use crate::unread::UnreadSummary;

use super::ClientError;

/// Source of the authoritative unread totals, pulled after every reconnect
#[async_trait]
pub trait UnreadSource: Send + Sync {
    async fn unread_summary(&self) -> Result<UnreadSummary, ClientError>;
}

enum BaseUrl {
    Fixed(String),
    Discovered(Arc<EndpointResolver>),
}

pub struct ChatRestClient {
    http: reqwest::Client,
    base: BaseUrl,
    token: RwLock<String>,
}

impl ChatRestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: BaseUrl::Fixed(base_url.into()),
            token: RwLock::new(token.into()),
        }
    }

    /// Base URL picked by `resolver`; a failed request invalidates it
    pub fn with_resolver(resolver: Arc<EndpointResolver>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: BaseUrl::Discovered(resolver),
            token: RwLock::new(token.into()),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    pub async fn rooms(&self) -> Result<Vec<RoomSummary>, ClientError> {
        self.get("/chat/rooms", &[]).await
    }

    pub async fn unread_count(&self) -> Result<UnreadSummary, ClientError> {
        self.get("/chat/unread-count", &[]).await
    }

    /// One page of history, newest last; `before` pages backwards
    pub async fn messages(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: Option<i64>,
    ) -> Result<MessagesPage, ClientError> {
        let mut query = Vec::new();
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.get(&format!("/chat/rooms/{}/messages", room_id), &query)
            .await
    }

    pub async fn mark_read(&self, room_id: RoomId) -> Result<ReadReceipt, ClientError> {
        let url = self.url(&format!("/chat/rooms/{}/read", room_id)).await?;
        let request = self.http.post(url).bearer_auth(self.token.read().clone());
        self.execute(request).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = self.url(path).await?;
        let request = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(self.token.read().clone());
        self.execute(request).await
    }

    async fn url(&self, path: &str) -> Result<String, ClientError> {
        let base = match &self.base {
            BaseUrl::Fixed(base) => base.clone(),
            BaseUrl::Discovered(resolver) => resolver.resolve().await?,
        };
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                if let BaseUrl::Discovered(resolver) = &self.base {
                    resolver.invalidate();
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.pointer("/error/message")?.as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        Err(match status {
            StatusCode::UNAUTHORIZED => ClientError::Auth(message),
            _ => ClientError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl UnreadSource for ChatRestClient {
    async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        self.unread_count().await
    }
}
