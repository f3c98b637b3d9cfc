//! Listener registry for server events on the client side.
//!
//! Every `on_*` call returns a [`Subscription`]; `off` removes exactly the
//! listener that token names. Dropping a token leaves the listener in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::{Message, RoomId, RoomUnread, UserId};
use crate::websocket::ServerMessage;

use super::reconnect::ConnectionState;

type Listener = Arc<dyn Fn(&ServerMessage) + Send + Sync>;
type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

const STATE_CHANNEL: &str = "connection_state";

/// Token naming one registered listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event: &'static str,
}

impl Subscription {
    pub fn event(&self) -> &'static str {
        self.event
    }
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<&'static str, Vec<(u64, Listener)>>>,
    state_listeners: RwLock<Vec<(u64, StateListener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for every frame whose `event` is `event`
    pub fn on<F>(&self, event: &'static str, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription { id, event }
    }

    pub fn on_new_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on("new_message", move |msg| {
            if let ServerMessage::NewMessage(message) = msg {
                listener(message);
            }
        })
    }

    /// `(room, user, is_typing)`
    pub fn on_user_typing<F>(&self, listener: F) -> Subscription
    where
        F: Fn(RoomId, &UserId, bool) + Send + Sync + 'static,
    {
        self.on("user_typing", move |msg| {
            if let ServerMessage::UserTyping {
                room_id,
                user_id,
                is_typing,
            } = msg
            {
                listener(*room_id, user_id, *is_typing);
            }
        })
    }

    /// `(user, online)` for `user_online`, `user_offline` and every entry of an
    /// `online_users` answer
    pub fn on_presence<F>(&self, listener: F) -> Vec<Subscription>
    where
        F: Fn(&UserId, bool) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let online = listener.clone();
        let offline = listener.clone();
        vec![
            self.on("user_online", move |msg| {
                if let ServerMessage::UserOnline { user_id } = msg {
                    online(user_id, true);
                }
            }),
            self.on("user_offline", move |msg| {
                if let ServerMessage::UserOffline { user_id } = msg {
                    offline(user_id, false);
                }
            }),
            self.on("online_users", move |msg| {
                if let ServerMessage::OnlineUsers { users } = msg {
                    for (user_id, online) in users {
                        listener(user_id, *online);
                    }
                }
            }),
        ]
    }

    /// `(total, per-room)` from `unread-count-updated`
    pub fn on_unread_count<F>(&self, listener: F) -> Subscription
    where
        F: Fn(u64, &[RoomUnread]) + Send + Sync + 'static,
    {
        self.on("unread-count-updated", move |msg| {
            if let ServerMessage::UnreadCountUpdated {
                unread_count,
                rooms,
            } = msg
            {
                listener(*unread_count, rooms);
            }
        })
    }

    pub fn on_room_updated<F>(&self, listener: F) -> Subscription
    where
        F: Fn(RoomId, &Message) + Send + Sync + 'static,
    {
        self.on("chat_room_updated", move |msg| {
            if let ServerMessage::ChatRoomUpdated {
                room_id,
                last_message,
                ..
            } = msg
            {
                listener(*room_id, last_message);
            }
        })
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state_listeners.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            event: STATE_CHANNEL,
        }
    }

    /// Remove the listener named by `subscription`. Returns false if it was
    /// already removed.
    pub fn off(&self, subscription: &Subscription) -> bool {
        if subscription.event == STATE_CHANNEL {
            let mut listeners = self.state_listeners.write();
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != subscription.id);
            return listeners.len() != before;
        }

        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(subscription.event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(subscription.event);
        }
        removed
    }

    /// Call every listener for the frame's event. Returns how many ran.
    ///
    /// Listeners run outside the registry lock, so they may call `on`/`off`.
    pub fn emit(&self, message: &ServerMessage) -> usize {
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .get(message.event_name())
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &targets {
            listener(message);
        }
        targets.len()
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let targets: Vec<StateListener> = self
            .state_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in targets {
            listener(state);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        if event == STATE_CHANNEL {
            return self.state_listeners.read().len();
        }
        self.listeners.read().get(event).map_or(0, Vec::len)
    }
}
