//! Session-level chat logic shared by the socket handler and the tests.
//!
//! The axum handler owns the transport; everything that happens once a
//! connection is authenticated goes through [`ChatGateway`].

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{Claims, JwtValidator};
use crate::broadcaster::{BroadcastConfig, MessageBroadcaster};
use crate::config::Settings;
use crate::connection_manager::{ConnectionError, ConnectionHandle, ConnectionManager};
use crate::error::ChatError;
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};
use crate::presence::PresenceTracker;
use crate::receipts::ReadReceiptSynchronizer;
use crate::rooms::RoomRegistry;
use crate::store::ChatStore;
use crate::typing::TypingController;
use crate::unread::UnreadAggregator;

use super::message::{ClientMessage, OutboundMessage, ServerMessage};

pub struct ChatGateway {
    jwt: Arc<JwtValidator>,
    connections: Arc<ConnectionManager>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingController>,
    broadcaster: Arc<MessageBroadcaster>,
    receipts: Arc<ReadReceiptSynchronizer>,
    unread: Arc<UnreadAggregator>,
}

impl ChatGateway {
    /// Wire every chat component over one connection manager and store
    pub fn new(settings: &Settings, store: Arc<dyn ChatStore>) -> Self {
        let jwt = Arc::new(JwtValidator::new(&settings.jwt));
        let connections = Arc::new(ConnectionManager::with_limits((&settings.websocket).into()));
        let unread = Arc::new(UnreadAggregator::new(connections.clone(), store.clone()));

        Self {
            jwt,
            rooms: Arc::new(RoomRegistry::new(connections.clone(), store.clone())),
            presence: Arc::new(PresenceTracker::new(connections.clone())),
            typing: Arc::new(TypingController::new(
                connections.clone(),
                settings.chat.typing_expiry(),
            )),
            broadcaster: Arc::new(MessageBroadcaster::new(
                connections.clone(),
                store.clone(),
                unread.clone(),
                BroadcastConfig::from(&settings.chat),
            )),
            receipts: Arc::new(ReadReceiptSynchronizer::new(
                connections.clone(),
                store,
                unread.clone(),
            )),
            unread,
            connections,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn typing(&self) -> &Arc<TypingController> {
        &self.typing
    }

    pub fn broadcaster(&self) -> &Arc<MessageBroadcaster> {
        &self.broadcaster
    }

    pub fn receipts(&self) -> &Arc<ReadReceiptSynchronizer> {
        &self.receipts
    }

    pub fn unread(&self) -> &Arc<UnreadAggregator> {
        &self.unread
    }

    pub fn jwt(&self) -> &Arc<JwtValidator> {
        &self.jwt
    }

    /// Validate a handshake token
    pub fn authenticate(&self, token: &str) -> Result<Claims, ChatError> {
        self.jwt.validate(token).inspect_err(|e| {
            let reason = match e {
                ChatError::Auth(msg) if msg.contains("expired") => "expired",
                _ => "invalid_token",
            };
            ConnectionMetrics::record_auth_failure(reason);
            tracing::warn!(error = %e, "Handshake token rejected");
        })
    }

    /// Register an authenticated connection.
    ///
    /// Queues `authenticated` and the user's current unread totals on the new
    /// connection, and announces the user if this was their first device.
    /// Once the handle is closed for any reason (slow consumer, heartbeat
    /// reaper, shutdown) the connection is torn down without waiting on its
    /// socket writer.
    #[tracing::instrument(name = "gateway.open_session", skip(self, claims, sender), fields(user_id = %claims.sub))]
    pub async fn open_session(
        self: &Arc<Self>,
        claims: &Claims,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let handle = self.presence.sequenced(&claims.sub, || {
            let registration =
                self.connections
                    .register(claims.sub.clone(), claims.roles.clone(), sender)?;
            if registration.came_online {
                self.presence.user_came_online(&registration.handle.user_id);
            }
            Ok::<_, ConnectionError>(registration.handle)
        })?;

        let _ = handle.deliver(ServerMessage::Authenticated {
            user_id: handle.user_id.clone(),
            connection_id: handle.id,
        });
        self.watch_close(&handle);

        match self.unread.summary(&handle.user_id).await {
            Ok(summary) => {
                let _ = handle.deliver(ServerMessage::unread(summary.rooms));
            }
            Err(e) => {
                tracing::warn!(user_id = %handle.user_id, error = %e, "Initial unread push skipped");
            }
        }

        Ok(handle)
    }

    /// Dispatch one event from an authenticated connection
    #[tracing::instrument(
        name = "gateway.event",
        skip(self, handle, message),
        fields(
            connection_id = %handle.id,
            user_id = %handle.user_id,
            event = message.event_name()
        )
    )]
    pub async fn handle_event(&self, handle: &Arc<ConnectionHandle>, message: ClientMessage) {
        let event = message.event_name();
        WsMessageMetrics::record(event);
        handle.update_activity();

        match message {
            ClientMessage::Authenticate { .. } => {
                let _ = handle.deliver(ServerMessage::event_error(
                    event,
                    "ALREADY_AUTHENTICATED",
                    "Connection is already authenticated",
                ));
            }
            ClientMessage::JoinRoom { room_id } => match self.rooms.join(handle, room_id).await {
                Ok(_) => {
                    let _ = handle.deliver(ServerMessage::JoinedRoom { room_id });
                }
                Err(e) => reply_error(handle, event, &e),
            },
            ClientMessage::LeaveRoom { room_id } => {
                self.typing.stop(handle, room_id);
                self.rooms.leave(handle, room_id);
                let _ = handle.deliver(ServerMessage::LeftRoom { room_id });
            }
            ClientMessage::SendMessage {
                room_id,
                body,
                client_message_id,
            } => {
                // a sent message ends the sender's typing in that room
                self.typing.stop(handle, room_id);
                if let Err(e) = self
                    .broadcaster
                    .send(room_id, &handle.user_id, &body, client_message_id, Some(handle))
                    .await
                {
                    reply_error(handle, event, &e);
                }
            }
            ClientMessage::TypingStart { room_id } => {
                self.typing.start(handle, room_id);
            }
            ClientMessage::TypingStop { room_id } => {
                self.typing.stop(handle, room_id);
            }
            ClientMessage::MarkRead { room_id } => {
                if let Err(e) = self.receipts.mark_read(room_id, &handle.user_id).await {
                    tracing::warn!(
                        connection_id = %handle.id,
                        room_id = room_id,
                        error = %e,
                        "mark_read failed"
                    );
                }
            }
            ClientMessage::GetOnlineUsers { user_ids } => {
                let users = self.presence.get_online_users(&user_ids);
                let _ = handle.deliver(ServerMessage::OnlineUsers { users });
            }
            ClientMessage::Ping => {
                let _ = handle.deliver(ServerMessage::Pong);
            }
        }
    }

    fn watch_close(self: &Arc<Self>, handle: &Arc<ConnectionHandle>) {
        let gateway = Arc::downgrade(self);
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.closed().await;
            if let Some(gateway) = gateway.upgrade() {
                gateway.disconnect(handle.id);
            }
        });
    }

    /// Tear a connection down: typing timers, room sets and presence refcount
    /// go in one step, then the resulting events are emitted.
    ///
    /// Returns false when the connection was already gone.
    pub fn disconnect(&self, connection_id: Uuid) -> bool {
        let Some(user_id) = self.connections.user_of(connection_id) else {
            return false;
        };
        self.presence
            .sequenced(&user_id, || self.teardown(connection_id))
    }

    fn teardown(&self, connection_id: Uuid) -> bool {
        let mut cancelled = Vec::new();
        let typing = &self.typing;
        let teardown = self.connections.unregister(connection_id, |_| {
            cancelled = typing.cancel_for_connection(connection_id);
        });

        let Some(teardown) = teardown else {
            return false;
        };

        let user_id = &teardown.handle.user_id;
        self.typing.announce_cancelled(&cancelled);
        for room_id in &teardown.rooms_vacated {
            self.rooms.announce_departure(user_id, *room_id);
        }
        if teardown.went_offline {
            self.presence.user_went_offline(user_id);
        }

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            rooms_left = teardown.rooms_left.len(),
            went_offline = teardown.went_offline,
            "Connection torn down"
        );
        true
    }
}

fn reply_error(handle: &ConnectionHandle, event: &str, error: &ChatError) {
    tracing::debug!(
        connection_id = %handle.id,
        event = event,
        code = error.code(),
        error = %error,
        "Event rejected"
    );
    let _ = handle.deliver(ServerMessage::event_error(event, error.code(), error.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JwtConfig, Settings};
    use crate::store::{MemoryChatStore, RoomKind};

    fn settings() -> Settings {
        Settings {
            server: Default::default(),
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: None,
                audience: None,
            },
            websocket: Default::default(),
            chat: Default::default(),
            database: Default::default(),
            discovery: Default::default(),
            otel: Default::default(),
        }
    }

    fn gateway() -> (Arc<ChatGateway>, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        store.insert_room(42, RoomKind::Meetup, &["alice", "bob"]);
        (Arc::new(ChatGateway::new(&settings(), store.clone())), store)
    }

    async fn open(
        gateway: &Arc<ChatGateway>,
        user: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = gateway.open_session(&Claims::new(user, 3600), tx).await.unwrap();
        (handle, rx)
    }

    fn events(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let text = frame.into_text().unwrap();
            if let Some(name) = super::super::message::event_name_of(&text) {
                names.push(name);
            }
        }
        names
    }

    #[tokio::test]
    async fn test_open_session_sends_authenticated_then_unread() {
        let (gateway, _) = gateway();
        let (_alice, mut rx) = open(&gateway, "alice").await;
        assert_eq!(events(&mut rx), vec!["authenticated", "unread-count-updated"]);
    }

    #[tokio::test]
    async fn test_join_rejected_for_non_member() {
        let (gateway, _) = gateway();
        let (carol, mut rx) = open(&gateway, "carol").await;
        events(&mut rx);

        gateway
            .handle_event(&carol, ClientMessage::JoinRoom { room_id: 42 })
            .await;
        let frame = rx.try_recv().unwrap().into_text().unwrap();
        assert!(frame.contains("MEMBERSHIP_ERROR"));
        assert!(!gateway.connections().is_joined(carol.id, 42));
    }

    #[tokio::test]
    async fn test_second_authenticate_is_an_error() {
        let (gateway, _) = gateway();
        let (alice, mut rx) = open(&gateway, "alice").await;
        events(&mut rx);

        gateway
            .handle_event(&alice, ClientMessage::Authenticate { token: "x".into() })
            .await;
        assert_eq!(events(&mut rx), vec!["error"]);
    }

    #[tokio::test]
    async fn test_disconnect_is_atomic_and_announced() {
        let (gateway, _) = gateway();
        let (alice, _alice_rx) = open(&gateway, "alice").await;
        let (bob, mut bob_rx) = open(&gateway, "bob").await;
        gateway.handle_event(&alice, ClientMessage::JoinRoom { room_id: 42 }).await;
        gateway.handle_event(&bob, ClientMessage::JoinRoom { room_id: 42 }).await;
        gateway.handle_event(&alice, ClientMessage::TypingStart { room_id: 42 }).await;
        events(&mut bob_rx);

        assert!(gateway.disconnect(alice.id));
        assert!(!gateway.disconnect(alice.id));

        assert!(!gateway.presence().is_online("alice"));
        assert!(!gateway.typing().is_typing(42, "alice"));
        assert!(!gateway.connections().room_users(42).contains("alice"));
        assert_eq!(
            events(&mut bob_rx),
            vec!["user_typing", "participant_left", "user_offline"]
        );
    }

    #[tokio::test]
    async fn test_closed_handle_is_torn_down_without_socket() {
        let (gateway, _) = gateway();
        let (alice, _alice_rx) = open(&gateway, "alice").await;
        let (bob, mut bob_rx) = open(&gateway, "bob").await;
        gateway.handle_event(&alice, ClientMessage::JoinRoom { room_id: 42 }).await;
        gateway.handle_event(&bob, ClientMessage::JoinRoom { room_id: 42 }).await;
        events(&mut bob_rx);

        alice.close();
        for _ in 0..50 {
            if !gateway.presence().is_online("alice") {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!gateway.presence().is_online("alice"));
        assert!(!gateway.connections().room_users(42).contains("alice"));
        assert_eq!(events(&mut bob_rx), vec!["participant_left", "user_offline"]);
        assert!(!gateway.disconnect(alice.id));
    }

    #[tokio::test]
    async fn test_online_query() {
        let (gateway, _) = gateway();
        let (alice, mut rx) = open(&gateway, "alice").await;
        events(&mut rx);

        gateway
            .handle_event(
                &alice,
                ClientMessage::GetOnlineUsers {
                    user_ids: vec!["alice".into(), "bob".into()],
                },
            )
            .await;
        let frame = rx.try_recv().unwrap().into_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["users"]["alice"], true);
        assert_eq!(value["data"]["users"]["bob"], false);
    }
}
