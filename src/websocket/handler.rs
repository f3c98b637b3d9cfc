use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::{bearer_token, Claims};
use crate::connection_manager::ConnectionHandle;
use crate::metrics::ConnectionMetrics;
use crate::server::AppState;

use super::message::{event_name_of, ClientMessage, OutboundMessage, ServerMessage};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// How long a server-closed connection may spend flushing its queue
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The upgrade is always accepted; a token missing from the query and headers
/// may still arrive in the first `authenticate` event.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
}

#[tracing::instrument(name = "ws.connection", skip_all, fields(otel.kind = "server"))]
async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let connection_start = Instant::now();
    ConnectionMetrics::record_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(claims) = handshake(&state, token, &mut ws_sender, &mut ws_receiver).await else {
        let _ = ws_sender.close().await;
        ConnectionMetrics::record_closed(connection_start.elapsed());
        return;
    };

    let (tx, rx) = mpsc::channel::<OutboundMessage>(state.settings.websocket.outbound_buffer);

    let handle = match state.gateway.open_session(&claims, tx).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(user_id = %claims.sub, error = %e, "Connection rejected");
            send_frame(&mut ws_sender, &ServerMessage::error("CONNECTION_LIMIT", e.to_string())).await;
            let _ = ws_sender.close().await;
            ConnectionMetrics::record_closed(connection_start.elapsed());
            return;
        }
    };
    let connection_id = handle.id;

    tracing::info!(
        connection_id = %connection_id,
        user_id = %handle.user_id,
        "WebSocket connection established"
    );

    let mut send_task = tokio::spawn(forward_outbound(rx, ws_sender, handle.clone()));

    let recv_state = state.clone();
    let recv_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_state, &recv_handle).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            send_task.abort();
        }
        _ = handle.closed() => {
            // a writer stuck on a client that stopped reading is cut off
            tracing::debug!(connection_id = %connection_id, "Connection closed by server");
            recv_task.abort();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    state.gateway.disconnect(connection_id);

    let duration = connection_start.elapsed();
    ConnectionMetrics::record_closed(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %handle.user_id,
        duration_secs = duration.as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Wait for a valid token, answering anything else that arrives meanwhile.
///
/// Returns `None` when the socket should be closed.
async fn handshake(
    state: &AppState,
    token: Option<String>,
    sender: &mut WsSink,
    receiver: &mut WsStream,
) -> Option<Claims> {
    if let Some(token) = token {
        return verify_or_reject(state, &token, sender).await;
    }

    let deadline = tokio::time::sleep(state.settings.websocket.handshake_timeout());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                ConnectionMetrics::record_auth_failure("timeout");
                tracing::debug!("Handshake timed out");
                send_frame(sender, &ServerMessage::auth_error("Authentication timeout")).await;
                return None;
            }
            frame = receiver.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    _ => return None,
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Authenticate { token }) => {
                            return verify_or_reject(state, &token, sender).await;
                        }
                        Ok(ClientMessage::Ping) => send_frame(sender, &ServerMessage::Pong).await,
                        Ok(other) => {
                            send_frame(
                                sender,
                                &ServerMessage::event_error(
                                    other.event_name(),
                                    "UNAUTHENTICATED",
                                    "Authenticate before sending room events",
                                ),
                            )
                            .await;
                        }
                        Err(e) => send_frame(sender, &invalid_message(text.as_str(), &e)).await,
                    },
                    Message::Binary(_) => send_frame(sender, &unsupported_format()).await,
                    Message::Close(_) => return None,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

/// On a bad token the `auth_error` frame goes out first, then the caller
/// closes the socket after the grace period.
async fn verify_or_reject(state: &AppState, token: &str, sender: &mut WsSink) -> Option<Claims> {
    match state.gateway.authenticate(token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            send_frame(sender, &ServerMessage::auth_error(e.to_string())).await;
            tokio::time::sleep(state.settings.websocket.auth_error_grace()).await;
            None
        }
    }
}

/// Drain the connection's outbound buffer into the socket until either side closes
async fn forward_outbound(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut ws_sender: WsSink,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if !write_outbound(&mut ws_sender, msg).await {
                    return;
                }
            }
            _ = handle.closed() => {
                // flush what was queued before the close (e.g. a shutdown notice)
                while let Ok(msg) = rx.try_recv() {
                    if !write_outbound(&mut ws_sender, msg).await {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = ws_sender.close().await;
}

async fn write_outbound(ws_sender: &mut WsSink, msg: OutboundMessage) -> bool {
    let text = match msg.into_text() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize message");
            return true;
        }
    };
    ws_sender.send(Message::Text(text.into())).await.is_ok()
}

async fn send_frame(sender: &mut WsSink, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = sender.send(Message::Text(json.into())).await;
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize message"),
    }
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();

            let client_msg: ClientMessage = match serde_json::from_str(text.as_str()) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(connection_id = %handle.id, error = %e, "Failed to parse client message");
                    let _ = handle.deliver(invalid_message(text.as_str(), &e));
                    return true;
                }
            };

            state.gateway.handle_event(handle, client_msg).await;
            true
        }
        Message::Binary(_) => {
            let _ = handle.deliver(unsupported_format());
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers pings itself
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

fn invalid_message(text: &str, error: &serde_json::Error) -> ServerMessage {
    match event_name_of(text) {
        Some(event) => ServerMessage::event_error(event, "INVALID_MESSAGE", error.to_string()),
        None => ServerMessage::error("INVALID_MESSAGE", error.to_string()),
    }
}

fn unsupported_format() -> ServerMessage {
    ServerMessage::error("UNSUPPORTED_FORMAT", "Binary messages are not supported")
}
