//! Message send path: validate, persist, then fan out.
//!
//! A message reaches no connection until the store has accepted it. Sends to
//! the same room are serialized so every live viewer sees them in id order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::connection_manager::{fan_out, ConnectionHandle, ConnectionManager, FanOut};
use crate::error::ChatError;
use crate::metrics::{DeliveryMetrics, PersistenceMetrics};
use crate::store::{ChatStore, Message, NewMessage, RoomId, StoreError};
use crate::unread::UnreadAggregator;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub persist_timeout: Duration,
    /// Extra attempts after the first failed write
    pub persist_retries: u32,
    pub max_body_len: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

impl From<&ChatConfig> for BroadcastConfig {
    fn from(config: &ChatConfig) -> Self {
        Self {
            persist_timeout: config.persist_timeout(),
            persist_retries: config.persist_retries,
            max_body_len: config.max_body_len,
        }
    }
}

/// What happened to a sent message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub message: Message,
    pub live: FanOut,
    /// Members outside the room who were sent unread updates
    pub notified_users: usize,
}

pub struct MessageBroadcaster {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn ChatStore>,
    unread: Arc<UnreadAggregator>,
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    config: BroadcastConfig,
}

impl MessageBroadcaster {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<dyn ChatStore>,
        unread: Arc<UnreadAggregator>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            connections,
            store,
            unread,
            room_locks: DashMap::new(),
            config,
        }
    }

    /// Persist a message and deliver it.
    ///
    /// `origin` is the socket that sent it, if any; it always gets the
    /// `new_message` echo even when it never joined the room.
    #[tracing::instrument(
        name = "broadcaster.send",
        skip(self, body, origin),
        fields(body_len = body.len())
    )]
    pub async fn send(
        &self,
        room_id: RoomId,
        sender_id: &str,
        body: &str,
        client_message_id: Option<Uuid>,
        origin: Option<&Arc<ConnectionHandle>>,
    ) -> Result<SendResult, ChatError> {
        self.validate(body)?;

        if !self.store.is_member(room_id, sender_id).await? {
            return Err(ChatError::membership(room_id, sender_id));
        }

        let new_message = NewMessage {
            room_id,
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            client_message_id: client_message_id.unwrap_or_else(Uuid::new_v4),
        };

        let lock = self.room_lock(room_id);
        let delivered = {
            let _guard = lock.lock().await;
            self.persist_and_fan_out(new_message, origin).await
        };
        self.release_room_lock(room_id, lock);
        let (message, live, viewers) = delivered?;

        DeliveryMetrics::record_broadcast();
        tracing::debug!(
            room_id = room_id,
            message_id = message.id,
            delivered = live.delivered,
            failed = live.failed,
            "Message broadcast"
        );

        self.advance_viewers(&message, &viewers).await;
        let notified_users = self.notify_absent_members(&message, &viewers).await;

        Ok(SendResult {
            message,
            live,
            notified_users,
        })
    }

    fn validate(&self, body: &str) -> Result<(), ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::Validation("Message body cannot be empty".into()));
        }
        let len = body.chars().count();
        if len > self.config.max_body_len {
            return Err(ChatError::Validation(format!(
                "Message body is {} characters, limit is {}",
                len, self.config.max_body_len
            )));
        }
        Ok(())
    }

    fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        self.room_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the room's lock entry once no other send holds or awaits it
    fn release_room_lock(&self, room_id: RoomId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.room_locks
            .remove_if(&room_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Runs under the room lock. The users returned are exactly those whose
    /// joined connections were handed the message.
    async fn persist_and_fan_out(
        &self,
        new_message: NewMessage,
        origin: Option<&Arc<ConnectionHandle>>,
    ) -> Result<(Message, FanOut, HashSet<String>), ChatError> {
        let room_id = new_message.room_id;
        let message = self.persist(new_message).await?;
        if message.room_id != room_id {
            tracing::error!(
                room_id = room_id,
                stored_room_id = message.room_id,
                message_id = message.id,
                "Store returned a message from another room"
            );
            return Err(StoreError::Conflict(format!(
                "message {} does not belong to room {}",
                message.id, room_id
            ))
            .into());
        }

        let mut targets = self.connections.room_connections(room_id);
        let mut viewers: HashSet<String> = targets.iter().map(|c| c.user_id.clone()).collect();
        viewers.insert(message.sender_id.clone());

        if let Some(origin) = origin {
            if !targets.iter().any(|c| c.id == origin.id) {
                targets.push(origin.clone());
            }
        }
        let live = fan_out(&targets, &ServerMessage::NewMessage(message.clone()));
        Ok((message, live, viewers))
    }

    /// Write with a timeout, retrying transient failures under the same
    /// `client_message_id` so a write that landed late is not duplicated.
    async fn persist(&self, message: NewMessage) -> Result<Message, ChatError> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            let result =
                tokio::time::timeout(self.config.persist_timeout, self.store.insert_message(message.clone()))
                    .await
                    .unwrap_or(Err(StoreError::Timeout));

            match result {
                Ok(stored) => {
                    PersistenceMetrics::record_persisted(started.elapsed());
                    return Ok(stored);
                }
                Err(e @ (StoreError::NotFound(_) | StoreError::Conflict(_))) => {
                    PersistenceMetrics::record_failed(started.elapsed());
                    return Err(e.into());
                }
                Err(e) if attempt < self.config.persist_retries => {
                    attempt += 1;
                    PersistenceMetrics::record_retry();
                    tracing::warn!(
                        room_id = message.room_id,
                        attempt = attempt,
                        error = %e,
                        "Message write failed, retrying"
                    );
                }
                Err(e) => {
                    PersistenceMetrics::record_failed(started.elapsed());
                    tracing::error!(
                        room_id = message.room_id,
                        sender_id = %message.sender_id,
                        error = %e,
                        "Message not persisted, nothing broadcast"
                    );
                    return Err(ChatError::Persistence(e.to_string()));
                }
            }
        }
    }

    /// Users watching the room have seen the message; move their pointers.
    async fn advance_viewers(&self, message: &Message, viewers: &HashSet<String>) {
        for user_id in viewers {
            if let Err(e) = self
                .store
                .advance_read_pointer(message.room_id, user_id, message.id)
                .await
            {
                tracing::warn!(
                    room_id = message.room_id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to advance read pointer for live viewer"
                );
            }
        }
    }

    /// Members not viewing the room get an unread push and a room list update
    async fn notify_absent_members(&self, message: &Message, viewers: &HashSet<String>) -> usize {
        let members = match self.store.room_members(message.room_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(room_id = message.room_id, error = %e, "Could not load room members");
                return 0;
            }
        };

        let updated = ServerMessage::ChatRoomUpdated {
            room_id: message.room_id,
            last_message: message.clone(),
            last_message_time: message.created_at,
        };

        let mut notified = 0;
        for user_id in members {
            let elsewhere: Vec<_> = self
                .connections
                .user_connections(&user_id)
                .into_iter()
                .filter(|c| !self.connections.is_joined(c.id, message.room_id))
                .collect();
            if elsewhere.is_empty() {
                continue;
            }

            fan_out(&elsewhere, &updated);
            if !viewers.contains(&user_id) {
                self.unread.push_to_user(&user_id).await;
                notified += 1;
            }
        }
        notified
    }
}
