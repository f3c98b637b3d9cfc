use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Message, MessageId, RoomId, RoomUnread, UserId};

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage {
        room_id: RoomId,
        body: String,
        /// Lets a client retry a send without creating a second message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<Uuid>,
    },
    TypingStart {
        room_id: RoomId,
    },
    TypingStop {
        room_id: RoomId,
    },
    MarkRead {
        room_id: RoomId,
    },
    GetOnlineUsers {
        user_ids: Vec<UserId>,
    },
    Ping,
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::LeaveRoom { .. } => "leave_room",
            ClientMessage::SendMessage { .. } => "send_message",
            ClientMessage::TypingStart { .. } => "typing_start",
            ClientMessage::TypingStop { .. } => "typing_stop",
            ClientMessage::MarkRead { .. } => "mark_read",
            ClientMessage::GetOnlineUsers { .. } => "get_online_users",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Authenticated {
        user_id: UserId,
        connection_id: Uuid,
    },
    AuthError {
        message: String,
    },
    JoinedRoom {
        room_id: RoomId,
    },
    LeftRoom {
        room_id: RoomId,
    },
    NewMessage(Message),
    UserTyping {
        user_id: UserId,
        room_id: RoomId,
        is_typing: bool,
    },
    MessagesRead {
        user_id: UserId,
        room_id: RoomId,
        last_read_message_id: MessageId,
        read_at: DateTime<Utc>,
    },
    OnlineUsers {
        users: HashMap<UserId, bool>,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    ChatRoomUpdated {
        room_id: RoomId,
        last_message: Message,
        last_message_time: DateTime<Utc>,
    },
    ParticipantLeft {
        user_id: UserId,
        room_id: RoomId,
    },
    #[serde(rename = "unread-count-updated")]
    UnreadCountUpdated {
        unread_count: u64,
        #[serde(default)]
        rooms: Vec<RoomUnread>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    Pong,
    Heartbeat,
    Shutdown {
        reason: String,
        reconnect_after_seconds: u64,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            event: None,
        }
    }

    /// Error frame tied to the client event that caused it
    pub fn event_error(
        event: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            event: Some(event.into()),
        }
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::AuthError {
            message: message.into(),
        }
    }

    pub fn unread(rooms: Vec<RoomUnread>) -> Self {
        Self::UnreadCountUpdated {
            unread_count: rooms.iter().map(|r| r.unread_count).sum(),
            rooms,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated { .. } => "authenticated",
            ServerMessage::AuthError { .. } => "auth_error",
            ServerMessage::JoinedRoom { .. } => "joined_room",
            ServerMessage::LeftRoom { .. } => "left_room",
            ServerMessage::NewMessage(_) => "new_message",
            ServerMessage::UserTyping { .. } => "user_typing",
            ServerMessage::MessagesRead { .. } => "messages_read",
            ServerMessage::OnlineUsers { .. } => "online_users",
            ServerMessage::UserOnline { .. } => "user_online",
            ServerMessage::UserOffline { .. } => "user_offline",
            ServerMessage::ChatRoomUpdated { .. } => "chat_room_updated",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::UnreadCountUpdated { .. } => "unread-count-updated",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
            ServerMessage::Heartbeat => "heartbeat",
            ServerMessage::Shutdown { .. } => "shutdown",
        }
    }
}

/// A frame queued on a connection's outbound buffer.
///
/// Fan-out serializes once and shares the text across every recipient.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Raw(ServerMessage),
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialize(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        Ok(Self::Preserialized(Arc::from(serde_json::to_string(message)?)))
    }

    pub fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Raw(message) => serde_json::to_string(&message),
            OutboundMessage::Preserialized(text) => Ok(text.to_string()),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        OutboundMessage::Raw(message)
    }
}

/// Best-effort extraction of the `event` name from a frame that failed to parse
pub fn event_name_of(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("event")?
        .as_str()
        .map(str::to_string)
}
