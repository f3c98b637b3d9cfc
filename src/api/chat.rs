//! Chat REST handlers.
//!
//! Sends and reads go through the same broadcaster and receipt paths as the
//! socket events, so both surfaces produce identical side effects.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, ChatError, Result};
use crate::receipts::ReadReceipt;
use crate::server::{AppState, AuthUser};
use crate::store::{Message, MessageId, Room, RoomId, RoomSummary, UserId};
use crate::unread::UnreadSummary;

/// Largest history page a client may ask for
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<MessageId>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub messages: Vec<Message>,
    /// Older messages exist before the first one returned
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub body: String,
    pub client_message_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeetupRoomRequest {
    pub meetup_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAllReadResponse {
    pub rooms_marked: usize,
    pub unread_count: u64,
}

/// GET /chat/rooms
#[tracing::instrument(name = "http.list_rooms", skip(state, user), fields(user_id = %user.user_id()))]
pub async fn list_rooms(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<RoomSummary>>> {
    Ok(Json(state.store.rooms_for_user(user.user_id()).await?))
}

/// GET /chat/rooms/{room_id}/messages?before=&limit=
#[tracing::instrument(name = "http.get_messages", skip(state, user, query), fields(user_id = %user.user_id()))]
pub async fn get_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(room_id): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagesPage>> {
    if !state.store.is_member(room_id, user.user_id()).await? {
        return Err(ChatError::membership(room_id, user.user_id()).into());
    }

    let limit = query
        .limit
        .unwrap_or(state.settings.chat.history_page_size)
        .clamp(1, MAX_PAGE_SIZE);
    let messages = state.store.messages(room_id, query.before, limit).await?;

    Ok(Json(MessagesPage {
        has_more: messages.len() as i64 == limit,
        messages,
    }))
}

/// POST /chat/rooms/{room_id}/messages
#[tracing::instrument(name = "http.send_message", skip(state, user, request), fields(user_id = %user.user_id()))]
pub async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(room_id): Path<RoomId>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>)> {
    let result = state
        .gateway
        .broadcaster()
        .send(room_id, user.user_id(), &request.body, request.client_message_id, None)
        .await?;
    Ok((StatusCode::CREATED, Json(result.message)))
}

/// POST /chat/rooms/meetup
#[tracing::instrument(name = "http.create_meetup_room", skip(state, user, request), fields(user_id = %user.user_id()))]
pub async fn create_meetup_room(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateMeetupRoomRequest>,
) -> Result<Json<Room>> {
    let room = state
        .store
        .create_meetup_room(request.meetup_id, user.user_id())
        .await?;
    tracing::info!(room_id = room.id, meetup_id = request.meetup_id, "Meetup room ready");
    Ok(Json(room))
}

/// POST /chat/rooms/direct
#[tracing::instrument(name = "http.create_direct_room", skip(state, user, request), fields(user_id = %user.user_id()))]
pub async fn create_direct_room(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<UserRequest>,
) -> Result<Json<Room>> {
    if request.user_id.trim().is_empty() || request.user_id == user.user_id() {
        return Err(AppError::Validation(
            "A direct room needs another user".to_string(),
        ));
    }
    let room = state
        .store
        .create_direct_room(user.user_id(), &request.user_id)
        .await?;
    Ok(Json(room))
}

/// POST /chat/rooms/meetup/{meetup_id}/add-user
#[tracing::instrument(name = "http.add_meetup_member", skip(state, user, request), fields(user_id = %user.user_id()))]
pub async fn add_meetup_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(meetup_id): Path<i64>,
    Json(request): Json<UserRequest>,
) -> Result<Json<Room>> {
    if request.user_id.trim().is_empty() {
        return Err(AppError::Validation("userId is required".to_string()));
    }
    let room = state
        .store
        .add_meetup_member(meetup_id, &request.user_id)
        .await?;

    // the new member's open tabs pick up the room's backlog
    state.gateway.unread().push_to_user(&request.user_id).await;

    tracing::info!(
        room_id = room.id,
        meetup_id = meetup_id,
        added_user_id = %request.user_id,
        "Member added to meetup room"
    );
    Ok(Json(room))
}

/// POST /chat/rooms/{room_id}/read
#[tracing::instrument(name = "http.mark_read", skip(state, user), fields(user_id = %user.user_id()))]
pub async fn mark_room_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<Json<ReadReceipt>> {
    let receipt = state
        .gateway
        .receipts()
        .mark_read(room_id, user.user_id())
        .await?;
    Ok(Json(receipt))
}

/// POST /chat/read-all
#[tracing::instrument(name = "http.mark_all_read", skip(state, user), fields(user_id = %user.user_id()))]
pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MarkAllReadResponse>> {
    let receipts = state.gateway.receipts().mark_all_read(user.user_id()).await?;
    let summary = state.gateway.unread().summary(user.user_id()).await?;
    Ok(Json(MarkAllReadResponse {
        rooms_marked: receipts.len(),
        unread_count: summary.unread_count,
    }))
}

/// GET /chat/unread-count
///
/// Authoritative totals. Clients re-pull this on load, reconnect and refocus.
pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UnreadSummary>> {
    Ok(Json(state.gateway.unread().summary(user.user_id()).await?))
}
