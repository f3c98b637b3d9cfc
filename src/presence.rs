//! Presence derived from the live-connection refcount.
//!
//! The refcount itself lives in `ConnectionManager`; this module turns its
//! 0→1 and 1→0 transitions into `user_online` / `user_offline` events.
//! Transitions for one user go through [`PresenceTracker::sequenced`], so
//! observers see the events in the order the refcount changed.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection_manager::{fan_out, ConnectionManager};
use crate::metrics::SignalMetrics;
use crate::store::UserId;
use crate::websocket::ServerMessage;

pub struct PresenceTracker {
    connections: Arc<ConnectionManager>,
    transitions: DashMap<UserId, Arc<Mutex<()>>>,
}

impl PresenceTracker {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            transitions: DashMap::new(),
        }
    }

    /// Run a refcount change for `user_id` together with the event it emits.
    ///
    /// Holds a per-user lock for the whole closure. The closure must not call
    /// `sequenced` again for the same user.
    pub fn sequenced<T>(&self, user_id: &str, transition: impl FnOnce() -> T) -> T {
        let lock = self
            .transitions
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock();
            transition()
        };
        drop(lock);
        self.transitions
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Called after a registration that took the user's refcount from 0 to 1
    pub fn user_came_online(&self, user_id: &str) {
        SignalMetrics::record_presence(true);
        self.notify_others(
            user_id,
            ServerMessage::UserOnline {
                user_id: user_id.to_string(),
            },
        );
        tracing::debug!(user_id = %user_id, "User online");
    }

    /// Called after a teardown that took the user's refcount from 1 to 0
    pub fn user_went_offline(&self, user_id: &str) {
        SignalMetrics::record_presence(false);
        self.notify_others(
            user_id,
            ServerMessage::UserOffline {
                user_id: user_id.to_string(),
            },
        );
        tracing::debug!(user_id = %user_id, "User offline");
    }

    /// Pure read of the refcount map
    pub fn get_online_users(&self, user_ids: &[UserId]) -> HashMap<UserId, bool> {
        self.connections.online_users(user_ids)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.is_online(user_id)
    }

    fn notify_others(&self, user_id: &str, message: ServerMessage) {
        let others: Vec<_> = self
            .connections
            .all_connections()
            .into_iter()
            .filter(|h| h.user_id != user_id)
            .collect();
        fan_out(&others, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_online_event_reaches_other_users_only() {
        let connections = Arc::new(ConnectionManager::new());
        let presence = PresenceTracker::new(connections.clone());

        let (btx, mut brx) = mpsc::channel(8);
        connections.register("bob".into(), vec![], btx).unwrap();
        let (atx, mut arx) = mpsc::channel(8);
        let alice = connections.register("alice".into(), vec![], atx).unwrap();
        assert!(alice.came_online);
        presence.user_came_online("alice");

        let frame = brx.try_recv().unwrap().into_text().unwrap();
        assert!(frame.contains("user_online"));
        assert!(arx.try_recv().is_err());
    }

    #[test]
    fn test_sequenced_transitions_do_not_overlap() {
        let connections = Arc::new(ConnectionManager::new());
        let presence = Arc::new(PresenceTracker::new(connections));
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let presence = presence.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        presence.sequenced("alice", || {
                            let before = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            assert_eq!(before, 0);
                            std::thread::yield_now();
                            inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(presence.transitions.is_empty());
    }
}
