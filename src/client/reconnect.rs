//! Client connection lifecycle.
//!
//! `Disconnected → Connecting → Authenticating → Connected`, and back to
//! `Disconnected` on transport loss. Reconnects back off exponentially. The
//! server keeps no per-connection state across a drop, so once a new session
//! is authenticated the manager rejoins every active room, re-asks presence
//! for the visible contacts and re-pulls the unread totals over REST.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::resilience::{BackoffConfig, ExponentialBackoff};
use crate::store::{RoomId, UserId};
use crate::websocket::{ClientMessage, ServerMessage};

use super::events::EventBus;
use super::outbox::Outbox;
use super::rest::UnreadSource;
use super::typing::TypingDebouncer;
use super::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Text frames in both directions. The link is gone once `inbound` yields `None`.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink, ClientError>;
}

/// WebSocket transport over tokio-tungstenite
pub struct TungsteniteTransport {
    buffer: usize,
}

impl TungsteniteTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink, ClientError> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.buffer);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if in_tx.send(text.as_str().to_string()).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            tracing::debug!("WebSocket transport closed");
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// WebSocket URL of the chat gateway
    pub url: String,
    pub backoff: BackoffConfig,
    /// Idle time after the last keystroke before `typing_stop` is sent
    pub typing_idle: Duration,
}

impl ReconnectConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffConfig::default(),
            typing_idle: Duration::from_millis(1_500),
        }
    }
}

enum SessionEnd {
    Lost,
    /// Server announced a restart and asked for a fixed delay
    Restarting(Duration),
    AuthRejected(String),
    Stopped,
}

pub struct ReconnectionManager {
    config: ReconnectConfig,
    transport: Arc<dyn Transport>,
    token: RwLock<String>,
    events: Arc<EventBus>,
    outbox: Arc<Outbox>,
    typing: Arc<TypingDebouncer>,
    unread: Option<Arc<dyn UnreadSource>>,
    state: RwLock<ConnectionState>,
    user_id: RwLock<Option<UserId>>,
    active_rooms: Mutex<BTreeSet<RoomId>>,
    visible_contacts: Mutex<Vec<UserId>>,
    stopped: AtomicBool,
    shutdown: Notify,
}

impl ReconnectionManager {
    pub fn new(
        config: ReconnectConfig,
        transport: Arc<dyn Transport>,
        token: impl Into<String>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new());
        let typing = Arc::new(TypingDebouncer::new(outbox.clone(), config.typing_idle));
        Self {
            config,
            transport,
            token: RwLock::new(token.into()),
            events: Arc::new(EventBus::new()),
            outbox,
            typing,
            unread: None,
            state: RwLock::new(ConnectionState::Disconnected),
            user_id: RwLock::new(None),
            active_rooms: Mutex::new(BTreeSet::new()),
            visible_contacts: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Pull unread totals from `source` after every successful authentication
    pub fn with_unread_source(mut self, source: Arc<dyn UnreadSource>) -> Self {
        self.unread = Some(source);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn typing(&self) -> &Arc<TypingDebouncer> {
        &self.typing
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// User id the server confirmed in the last `authenticated` frame
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.read().clone()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.active_rooms.lock().iter().copied().collect()
    }

    /// Token used by the next handshake
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    /// Mark a room active. Sent now when connected, otherwise on the next session.
    pub fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.active_rooms.lock().insert(room_id);
        self.send_if_connected(&ClientMessage::JoinRoom { room_id })
    }

    pub fn leave_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.active_rooms.lock().remove(&room_id);
        self.typing.stop(room_id);
        self.send_if_connected(&ClientMessage::LeaveRoom { room_id })
    }

    /// Send a message, returning the id to reuse when retrying the same send
    pub fn send_message(
        &self,
        room_id: RoomId,
        body: impl Into<String>,
        client_message_id: Option<Uuid>,
    ) -> Result<Uuid, ClientError> {
        let client_message_id = client_message_id.unwrap_or_else(Uuid::new_v4);
        self.typing.stop(room_id);
        self.outbox.send(&ClientMessage::SendMessage {
            room_id,
            body: body.into(),
            client_message_id: Some(client_message_id),
        })?;
        Ok(client_message_id)
    }

    /// Feed a keystroke in an active room to the typing debouncer
    pub fn keystroke(&self, room_id: RoomId) {
        if self.is_connected() && self.active_rooms.lock().contains(&room_id) {
            self.typing.keystroke(room_id);
        }
    }

    pub fn mark_read(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.outbox.send(&ClientMessage::MarkRead { room_id })
    }

    /// Contacts whose presence the UI shows; re-queried after every reconnect
    pub fn set_visible_contacts(&self, user_ids: Vec<UserId>) -> Result<(), ClientError> {
        *self.visible_contacts.lock() = user_ids.clone();
        if user_ids.is_empty() {
            return Ok(());
        }
        self.send_if_connected(&ClientMessage::GetOnlineUsers { user_ids })
    }

    /// Ask `run` to close the session and return
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Connect and keep reconnecting until `stop` is called, the server
    /// rejects the token, or the backoff runs out of attempts.
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        let mut backoff = ExponentialBackoff::with_config(self.config.backoff.clone());

        while !self.stopped.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Connecting);

            let delay_override = match self.transport.connect(&self.config.url).await {
                Ok(link) => match self.run_session(link, &mut backoff).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::AuthRejected(reason) => {
                        self.link_lost();
                        tracing::warn!(reason = %reason, "Server rejected credentials");
                        return Err(ClientError::Auth(reason));
                    }
                    SessionEnd::Restarting(delay) => Some(delay),
                    SessionEnd::Lost => None,
                },
                Err(e) => {
                    tracing::warn!(url = %self.config.url, error = %e, "Connect failed");
                    None
                }
            };
            self.link_lost();

            let delay = match delay_override {
                Some(delay) => delay,
                None => match backoff.next_delay() {
                    Some(delay) => delay,
                    None => {
                        return Err(ClientError::GaveUp {
                            attempts: backoff.attempt(),
                        })
                    }
                },
            };
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                "Reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        self.link_lost();
        Ok(())
    }

    async fn run_session(&self, link: TransportLink, backoff: &mut ExponentialBackoff) -> SessionEnd {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        self.outbox.attach(outbound);
        self.set_state(ConnectionState::Authenticating);

        let token = self.token.read().clone();
        if let Err(e) = self.outbox.send(&ClientMessage::Authenticate { token }) {
            tracing::warn!(error = %e, "Could not send authenticate");
            return SessionEnd::Lost;
        }

        let mut restart_after = None;
        loop {
            let text = tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => text,
                    None => {
                        return restart_after.map_or(SessionEnd::Lost, SessionEnd::Restarting);
                    }
                },
                _ = self.shutdown.notified() => return SessionEnd::Stopped,
            };

            let message: ServerMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Unparseable server frame");
                    continue;
                }
            };

            match &message {
                ServerMessage::Authenticated { user_id, .. } => {
                    *self.user_id.write() = Some(user_id.clone());
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    self.events.emit(&message);
                    self.resync().await;
                    continue;
                }
                ServerMessage::AuthError { message: reason } => {
                    self.events.emit(&message);
                    return SessionEnd::AuthRejected(reason.clone());
                }
                ServerMessage::Heartbeat => {
                    // keeps the server from reaping this connection as stale
                    let _ = self.outbox.send(&ClientMessage::Ping);
                }
                ServerMessage::Shutdown {
                    reconnect_after_seconds,
                    ..
                } => {
                    restart_after = Some(Duration::from_secs(*reconnect_after_seconds));
                }
                _ => {}
            }
            self.events.emit(&message);
        }
    }

    /// Re-establish what the server forgot when the previous link dropped
    async fn resync(&self) {
        let rooms = self.active_rooms();
        for room_id in &rooms {
            if let Err(e) = self.outbox.send(&ClientMessage::JoinRoom { room_id: *room_id }) {
                tracing::warn!(room_id = room_id, error = %e, "Rejoin failed");
            }
        }

        let contacts = self.visible_contacts.lock().clone();
        if !contacts.is_empty() {
            let _ = self
                .outbox
                .send(&ClientMessage::GetOnlineUsers { user_ids: contacts });
        }

        if let Some(source) = &self.unread {
            match source.unread_summary().await {
                Ok(summary) => {
                    self.events.emit(&ServerMessage::unread(summary.rooms));
                }
                Err(e) => tracing::warn!(error = %e, "Unread pull failed"),
            }
        }

        tracing::info!(rooms = rooms.len(), "Session resynchronized");
    }

    fn send_if_connected(&self, message: &ClientMessage) -> Result<(), ClientError> {
        if self.is_connected() {
            self.outbox.send(message)
        } else {
            Ok(())
        }
    }

    fn link_lost(&self) {
        self.outbox.detach();
        let cancelled = self.typing.cancel_all();
        if cancelled > 0 {
            tracing::debug!(rooms = cancelled, "Local typing timers cancelled");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
            self.events.emit_state(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RoomUnread;
    use crate::unread::UnreadSummary;
    use std::sync::atomic::AtomicUsize;

    struct ServerEnd {
        from_client: mpsc::Receiver<String>,
        to_client: mpsc::Sender<String>,
    }

    impl ServerEnd {
        async fn next(&mut self) -> ClientMessage {
            let text = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
                .await
                .expect("client frame")
                .expect("link open");
            serde_json::from_str(&text).unwrap()
        }

        async fn push(&self, message: ServerMessage) {
            self.to_client
                .send(serde_json::to_string(&message).unwrap())
                .await
                .unwrap();
        }

        async fn authenticate(&mut self) {
            assert!(matches!(self.next().await, ClientMessage::Authenticate { .. }));
            self.push(ServerMessage::Authenticated {
                user_id: "alice".into(),
                connection_id: Uuid::new_v4(),
            })
            .await;
        }
    }

    struct FakeTransport {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        refuse: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, _url: &str) -> Result<TransportLink, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("connection refused".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            let _ = self.accepted.send(ServerEnd {
                from_client: out_rx,
                to_client: in_tx,
            });
            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    struct FixedUnread;

    #[async_trait]
    impl UnreadSource for FixedUnread {
        async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
            Ok(UnreadSummary::from_rooms(vec![RoomUnread {
                room_id: 1,
                unread_count: 3,
            }]))
        }
    }

    fn manager(
        refuse: bool,
        max_attempts: Option<u32>,
    ) -> (
        Arc<ReconnectionManager>,
        Arc<FakeTransport>,
        mpsc::UnboundedReceiver<ServerEnd>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport {
            accepted: tx,
            refuse: AtomicBool::new(refuse),
            attempts: AtomicUsize::new(0),
        });
        let mut config = ReconnectConfig::new("ws://chat.test/ws");
        config.backoff = BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        };
        let manager = Arc::new(ReconnectionManager::new(config, transport.clone(), "token"));
        (manager, transport, rx)
    }

    async fn accept(rx: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("connect attempt")
            .expect("transport alive")
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_rejoins_active_rooms_after_reconnect() {
        let (manager, _transport, mut accepted) = manager(false, None);
        manager.join_room(2).unwrap();
        manager.join_room(1).unwrap();
        tokio::spawn(manager.clone().run());

        let mut first = accept(&mut accepted).await;
        first.authenticate().await;
        assert_eq!(first.next().await, ClientMessage::JoinRoom { room_id: 1 });
        assert_eq!(first.next().await, ClientMessage::JoinRoom { room_id: 2 });
        wait_for(|| manager.is_connected()).await;

        drop(first);
        let mut second = accept(&mut accepted).await;
        second.authenticate().await;
        assert_eq!(second.next().await, ClientMessage::JoinRoom { room_id: 1 });
        assert_eq!(second.next().await, ClientMessage::JoinRoom { room_id: 2 });

        manager.stop();
    }

    #[tokio::test]
    async fn test_transport_loss_cancels_local_typing() {
        let (manager, _transport, mut accepted) = manager(false, None);
        manager.join_room(7).unwrap();
        tokio::spawn(manager.clone().run());

        let mut end = accept(&mut accepted).await;
        end.authenticate().await;
        end.next().await;
        wait_for(|| manager.is_connected()).await;

        manager.keystroke(7);
        assert_eq!(end.next().await, ClientMessage::TypingStart { room_id: 7 });
        assert!(manager.typing().is_typing(7));

        let states: Arc<Mutex<Vec<ConnectionState>>> = Default::default();
        let s = states.clone();
        manager.events().on_state_change(move |state| s.lock().push(state));

        drop(end);
        wait_for(|| !manager.typing().is_typing(7)).await;
        let _ = accept(&mut accepted).await;
        assert_eq!(states.lock()[0], ConnectionState::Disconnected);

        manager.stop();
    }

    #[tokio::test]
    async fn test_authenticated_pulls_unread_and_presence() {
        let (tx, mut accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport {
            accepted: tx,
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        let manager = Arc::new(
            ReconnectionManager::new(ReconnectConfig::new("ws://chat.test/ws"), transport, "token")
                .with_unread_source(Arc::new(FixedUnread)),
        );
        manager
            .set_visible_contacts(vec!["bob".into(), "carol".into()])
            .unwrap();

        let totals: Arc<Mutex<Vec<u64>>> = Default::default();
        let t = totals.clone();
        manager.events().on_unread_count(move |total, _| t.lock().push(total));

        tokio::spawn(manager.clone().run());
        let mut end = accept(&mut accepted).await;
        end.authenticate().await;

        assert_eq!(
            end.next().await,
            ClientMessage::GetOnlineUsers {
                user_ids: vec!["bob".into(), "carol".into()]
            }
        );
        wait_for(|| *totals.lock() == vec![3]).await;
        assert_eq!(manager.user_id().as_deref(), Some("alice"));

        manager.stop();
    }

    #[tokio::test]
    async fn test_heartbeat_answered_with_ping() {
        let (manager, _transport, mut accepted) = manager(false, None);
        tokio::spawn(manager.clone().run());

        let mut end = accept(&mut accepted).await;
        end.authenticate().await;
        end.push(ServerMessage::Heartbeat).await;
        assert_eq!(end.next().await, ClientMessage::Ping);

        manager.stop();
    }

    #[tokio::test]
    async fn test_auth_error_stops_reconnecting() {
        let (manager, transport, mut accepted) = manager(false, None);
        let run = tokio::spawn(manager.clone().run());

        let mut end = accept(&mut accepted).await;
        assert!(matches!(end.next().await, ClientMessage::Authenticate { .. }));
        end.push(ServerMessage::auth_error("Token expired")).await;

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ClientError::Auth(reason)) if reason == "Token expired"));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_gives_up_when_backoff_exhausted() {
        let (manager, transport, _accepted) = manager(true, Some(2));

        let result = tokio::time::timeout(Duration::from_secs(2), manager.clone().run())
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::GaveUp { attempts: 2 })));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_join_while_disconnected_is_deferred() {
        let (manager, _transport, _accepted) = manager(true, Some(0));
        manager.join_room(5).unwrap();
        assert_eq!(manager.active_rooms(), vec![5]);
        assert!(matches!(
            manager.send_message(5, "hi", None),
            Err(ClientError::NotConnected)
        ));
    }
}
