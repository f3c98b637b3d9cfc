//! End-to-end tests over a real listener
//!
//! The app is served on an ephemeral port; clients speak raw WebSocket via
//! tokio-tungstenite, REST via reqwest, or go through the client module.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use meetup_chat_service::auth::Claims;
use meetup_chat_service::client::{
    ChatRestClient, ClientError, ConnectionState, ReconnectConfig, ReconnectionManager,
    TungsteniteTransport,
};
use meetup_chat_service::config::{DiscoveryConfig, JwtConfig, Settings};
use meetup_chat_service::discovery::EndpointResolver;
use meetup_chat_service::resilience::BackoffConfig;
use meetup_chat_service::server::{create_app, AppState};
use meetup_chat_service::store::{MemoryChatStore, RoomKind};
use meetup_chat_service::websocket::{ClientMessage, ServerMessage};

const SECRET: &str = "integration-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn settings() -> Settings {
    Settings {
        server: Default::default(),
        jwt: JwtConfig {
            secret: SECRET.into(),
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

fn token(user: &str) -> String {
    encode(
        &Header::default(),
        &Claims::new(user, 3600),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// Start the app on 127.0.0.1:0. The server runs in the background.
async fn start_server(configure: impl FnOnce(&mut Settings)) -> (SocketAddr, AppState, Arc<MemoryChatStore>) {
    let mut settings = settings();
    configure(&mut settings);

    let store = Arc::new(MemoryChatStore::new());
    store.insert_room(42, RoomKind::Meetup, &["alice", "bob", "carol"]);

    let state = AppState::with_store(settings, store.clone());
    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, store)
}

async fn connect(addr: SocketAddr, query_token: Option<&str>) -> Ws {
    let url = match query_token {
        Some(t) => format!("ws://{addr}/ws?token={t}"),
        None => format!("ws://{addr}/ws"),
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.expect("ws connect");
    ws
}

async fn send_event(ws: &mut Ws, event: &ClientMessage) {
    ws.send(WsMessage::Text(serde_json::to_string(event).unwrap().into()))
        .await
        .expect("ws send");
}

/// Next server event, or `None` once the socket closes
async fn next_event(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("frame within timeout");
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).expect("server frame parses"))
            }
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Skip events until `pred` matches
async fn wait_event(ws: &mut Ws, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        match next_event(ws).await {
            Some(event) if pred(&event) => return event,
            Some(_) => continue,
            None => panic!("socket closed before the expected event"),
        }
    }
}

async fn login(addr: SocketAddr, user: &str) -> Ws {
    let mut ws = connect(addr, Some(&token(user))).await;
    wait_event(&mut ws, |e| matches!(e, ServerMessage::Authenticated { .. })).await;
    ws
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Handshake Tests
// =============================================================================

mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn test_query_token_authenticates() {
        let (addr, state, _) = start_server(|_| {}).await;
        let mut ws = connect(addr, Some(&token("alice"))).await;

        match next_event(&mut ws).await {
            Some(ServerMessage::Authenticated { user_id, .. }) => assert_eq!(user_id, "alice"),
            other => panic!("expected authenticated, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut ws).await,
            Some(ServerMessage::UnreadCountUpdated { unread_count: 0, .. })
        ));
        assert!(state.connections().is_online("alice"));
    }

    #[tokio::test]
    async fn test_authenticate_event_after_room_event_is_rejected() {
        let (addr, _, _) = start_server(|_| {}).await;
        let mut ws = connect(addr, None).await;

        send_event(&mut ws, &ClientMessage::JoinRoom { room_id: 42 }).await;
        match next_event(&mut ws).await {
            Some(ServerMessage::Error { code, event, .. }) => {
                assert_eq!(code, "UNAUTHENTICATED");
                assert_eq!(event.as_deref(), Some("join_room"));
            }
            other => panic!("expected error, got {:?}", other),
        }

        send_event(&mut ws, &ClientMessage::Authenticate { token: token("bob") }).await;
        assert!(matches!(
            next_event(&mut ws).await,
            Some(ServerMessage::Authenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_token_gets_auth_error_then_close() {
        let (addr, state, _) = start_server(|_| {}).await;
        let mut ws = connect(addr, Some("not-a-jwt")).await;

        assert!(matches!(next_event(&mut ws).await, Some(ServerMessage::AuthError { .. })));
        assert!(next_event(&mut ws).await.is_none());
        assert_eq!(state.connections().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (addr, _, _) = start_server(|s| s.websocket.handshake_timeout_ms = 200).await;
        let mut ws = connect(addr, None).await;

        match next_event(&mut ws).await {
            Some(ServerMessage::AuthError { message }) => {
                assert_eq!(message, "Authentication timeout")
            }
            other => panic!("expected auth_error, got {:?}", other),
        }
        assert!(next_event(&mut ws).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (addr, _, _) = start_server(|_| {}).await;
        let mut ws = login(addr, "alice").await;

        ws.send(WsMessage::Text("{not json".into())).await.unwrap();
        wait_event(&mut ws, |e| {
            matches!(e, ServerMessage::Error { code, .. } if code == "INVALID_MESSAGE")
        })
        .await;

        send_event(&mut ws, &ClientMessage::Ping).await;
        wait_event(&mut ws, |e| matches!(e, ServerMessage::Pong)).await;
    }
}

// =============================================================================
// Chat Flow Tests
// =============================================================================

mod chat_flow_tests {
    use super::*;

    #[tokio::test]
    async fn test_hello_scenario_with_rest_pull() {
        let (addr, _, _) = start_server(|_| {}).await;
        let mut alice = login(addr, "alice").await;
        let mut bob = login(addr, "bob").await;

        for ws in [&mut alice, &mut bob] {
            send_event(ws, &ClientMessage::JoinRoom { room_id: 42 }).await;
            wait_event(ws, |e| matches!(e, ServerMessage::JoinedRoom { room_id: 42 })).await;
        }

        send_event(
            &mut alice,
            &ClientMessage::SendMessage {
                room_id: 42,
                body: "hello".into(),
                client_message_id: None,
            },
        )
        .await;

        match wait_event(&mut bob, |e| matches!(e, ServerMessage::NewMessage(_))).await {
            ServerMessage::NewMessage(m) => {
                assert_eq!(m.body, "hello");
                assert_eq!(m.sender_id, "alice");
            }
            _ => unreachable!(),
        }

        let bob_rest = ChatRestClient::new(format!("http://{addr}"), token("bob"));
        let bob_unread = bob_rest.unread_count().await.unwrap();
        assert_eq!(bob_unread.room(42), 0);

        let carol_rest = ChatRestClient::new(format!("http://{addr}"), token("carol"));
        let carol_unread = carol_rest.unread_count().await.unwrap();
        assert!(carol_unread.unread_count >= 1);
        assert_eq!(carol_unread.room(42), 1);

        let page = carol_rest.messages(42, None, Some(10)).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);

        let receipt = carol_rest.mark_read(42).await.unwrap();
        assert!(receipt.advanced);
        assert_eq!(carol_rest.unread_count().await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_rest_send_reaches_live_viewers() {
        let (addr, _, store) = start_server(|_| {}).await;
        let mut bob = login(addr, "bob").await;
        send_event(&mut bob, &ClientMessage::JoinRoom { room_id: 42 }).await;
        wait_event(&mut bob, |e| matches!(e, ServerMessage::JoinedRoom { .. })).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/chat/rooms/42/messages"))
            .bearer_auth(token("alice"))
            .json(&serde_json::json!({ "body": "from rest" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);

        wait_event(&mut bob, |e| {
            matches!(e, ServerMessage::NewMessage(m) if m.body == "from rest")
        })
        .await;
        assert_eq!(store.message_count(42), 1);
    }

    #[tokio::test]
    async fn test_rest_requires_token_and_membership() {
        let (addr, _, _) = start_server(|_| {}).await;
        let http = reqwest::Client::new();

        let response = http
            .get(format!("http://{addr}/chat/unread-count"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

        let outsider = ChatRestClient::new(format!("http://{addr}"), token("mallory"));
        match outsider.messages(42, None, None).await {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected 403, got {:?}", other.map(|p| p.messages.len())),
        }
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_is_torn_down() {
        let (addr, state, _) = start_server(|s| s.websocket.outbound_buffer = 8).await;
        let mut bob = login(addr, "bob").await;
        send_event(&mut bob, &ClientMessage::JoinRoom { room_id: 42 }).await;
        wait_event(&mut bob, |e| matches!(e, ServerMessage::JoinedRoom { .. })).await;

        // bob stops reading; the server's socket writer eventually blocks
        let body = "x".repeat(3900);
        let connections = state.connections().clone();
        for _ in 0..20_000 {
            if !connections.is_online("bob") {
                break;
            }
            state
                .gateway
                .broadcaster()
                .send(42, "alice", &body, None, None)
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }

        wait_for(|| !connections.is_online("bob")).await;
        assert!(!connections.room_users(42).contains("bob"));
        drop(bob);
    }

    #[tokio::test]
    async fn test_rest_client_skips_dead_candidate() {
        let (addr, _, _) = start_server(|_| {}).await;
        let live = format!("http://{addr}");
        let resolver = Arc::new(EndpointResolver::from_config(&DiscoveryConfig {
            candidates: vec!["http://127.0.0.1:1".into(), live.clone()],
            probe_path: "/health".into(),
            probe_timeout_ms: 500,
            max_rounds: 1,
        }));

        let client = ChatRestClient::with_resolver(resolver.clone(), token("alice"));
        let rooms = client.rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room.id, 42);
        assert_eq!(resolver.cached(), Some(live));
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let (addr, _, _) = start_server(|_| {}).await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"]["backend"], "memory");
    }
}

// =============================================================================
// Client Reconnection Tests
// =============================================================================

mod reconnect_tests {
    use super::*;

    fn manager(addr: SocketAddr, user: &str) -> Arc<ReconnectionManager> {
        let mut config = ReconnectConfig::new(format!("ws://{addr}/ws"));
        config.backoff = BackoffConfig {
            initial_delay_ms: 50,
            max_delay_ms: 200,
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: None,
        };
        let rest = Arc::new(ChatRestClient::new(format!("http://{addr}"), token(user)));
        Arc::new(
            ReconnectionManager::new(config, Arc::new(TungsteniteTransport::default()), token(user))
                .with_unread_source(rest),
        )
    }

    #[tokio::test]
    async fn test_client_catches_up_on_connect() {
        let (addr, _, _) = start_server(|_| {}).await;
        let mut alice = login(addr, "alice").await;
        send_event(
            &mut alice,
            &ClientMessage::SendMessage {
                room_id: 42,
                body: "while you were away".into(),
                client_message_id: None,
            },
        )
        .await;
        wait_event(&mut alice, |e| matches!(e, ServerMessage::NewMessage(_))).await;

        let carol = manager(addr, "carol");
        let totals: Arc<parking_lot::Mutex<Vec<(u64, u64)>>> = Default::default();
        let t = totals.clone();
        carol.events().on_unread_count(move |total, rooms| {
            let room_42 = rooms
                .iter()
                .find(|r| r.room_id == 42)
                .map_or(0, |r| r.unread_count);
            t.lock().push((total, room_42));
        });

        tokio::spawn(carol.clone().run());
        wait_for(|| totals.lock().len() >= 2).await;

        // the server's push on connect and the REST pull agree
        assert!(totals.lock().iter().all(|&(total, room)| total >= 1 && room == 1));
        carol.stop();
    }

    #[tokio::test]
    async fn test_rejoins_rooms_after_server_drops_connection() {
        let (addr, state, _) = start_server(|_| {}).await;
        let carol = manager(addr, "carol");
        carol.join_room(42).unwrap();
        tokio::spawn(carol.clone().run());

        let connections = state.connections().clone();
        wait_for(|| connections.room_users(42).contains("carol")).await;
        let first: Vec<_> = connections.user_connections("carol");
        assert_eq!(first.len(), 1);
        let first_id = first[0].id;

        first[0].close();

        wait_for(|| {
            connections
                .user_connections("carol")
                .iter()
                .any(|h| h.id != first_id && connections.is_joined(h.id, 42))
        })
        .await;
        assert_eq!(carol.state(), ConnectionState::Connected);
        carol.stop();
    }

    #[tokio::test]
    async fn test_rejected_token_stops_client() {
        let (addr, _, _) = start_server(|_| {}).await;
        let config = ReconnectConfig::new(format!("ws://{addr}/ws"));
        let client = Arc::new(ReconnectionManager::new(
            config,
            Arc::new(TungsteniteTransport::default()),
            "forged",
        ));

        let result = tokio::time::timeout(Duration::from_secs(3), client.clone().run())
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::Auth(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
