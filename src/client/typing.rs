//! Keystroke debouncing for outgoing typing signals.
//!
//! The first keystroke in a room sends `typing_start`. Later keystrokes only
//! re-arm the idle timer, re-sending `typing_start` at most once per renew
//! interval so the server-side indicator does not lapse. `typing_stop` goes
//! out once the room has been idle for the whole window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::store::RoomId;
use crate::websocket::ClientMessage;

use super::outbox::Outbox;

struct LocalTyping {
    last_sent: Instant,
    generation: u64,
    idle_timer: AbortHandle,
}

pub struct TypingDebouncer {
    outbox: Arc<Outbox>,
    idle_window: Duration,
    renew_every: Duration,
    rooms: Mutex<HashMap<RoomId, LocalTyping>>,
    generation: Mutex<u64>,
}

impl TypingDebouncer {
    pub fn new(outbox: Arc<Outbox>, idle_window: Duration) -> Self {
        Self {
            outbox,
            idle_window,
            renew_every: idle_window / 2,
            rooms: Mutex::new(HashMap::new()),
            generation: Mutex::new(0),
        }
    }

    /// Record a keystroke in `room_id`
    pub fn keystroke(self: &Arc<Self>, room_id: RoomId) {
        let generation = {
            let mut g = self.generation.lock();
            *g += 1;
            *g
        };
        let now = Instant::now();
        let timer = self.spawn_idle_timer(room_id, generation);

        let send_start = {
            let mut rooms = self.rooms.lock();
            match rooms.get_mut(&room_id) {
                Some(local) => {
                    local.idle_timer.abort();
                    local.idle_timer = timer;
                    local.generation = generation;
                    if now.duration_since(local.last_sent) >= self.renew_every {
                        local.last_sent = now;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    rooms.insert(
                        room_id,
                        LocalTyping {
                            last_sent: now,
                            generation,
                            idle_timer: timer,
                        },
                    );
                    true
                }
            }
        };

        if send_start {
            self.emit(ClientMessage::TypingStart { room_id });
        }
    }

    /// Stop typing in `room_id` now, e.g. because the message was sent
    pub fn stop(&self, room_id: RoomId) -> bool {
        let removed = self.rooms.lock().remove(&room_id);
        match removed {
            Some(local) => {
                local.idle_timer.abort();
                self.emit(ClientMessage::TypingStop { room_id });
                true
            }
            None => false,
        }
    }

    /// Drop every local timer without sending anything. Used when the
    /// transport is lost; the server clears its side on disconnect.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<LocalTyping> = self.rooms.lock().drain().map(|(_, l)| l).collect();
        for local in &drained {
            local.idle_timer.abort();
        }
        drained.len()
    }

    pub fn is_typing(&self, room_id: RoomId) -> bool {
        self.rooms.lock().contains_key(&room_id)
    }

    fn spawn_idle_timer(self: &Arc<Self>, room_id: RoomId, generation: u64) -> AbortHandle {
        let debouncer = Arc::downgrade(self);
        let window = self.idle_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(debouncer) = debouncer.upgrade() {
                debouncer.idle(room_id, generation);
            }
        })
        .abort_handle()
    }

    fn idle(&self, room_id: RoomId, generation: u64) {
        let expired = {
            let mut rooms = self.rooms.lock();
            match rooms.get(&room_id) {
                Some(local) if local.generation == generation => rooms.remove(&room_id).is_some(),
                _ => false,
            }
        };
        if expired {
            self.emit(ClientMessage::TypingStop { room_id });
        }
    }

    fn emit(&self, message: ClientMessage) {
        if let Err(e) = self.outbox.send(&message) {
            tracing::debug!(event = message.event_name(), error = %e, "Typing signal dropped");
        }
    }
}
