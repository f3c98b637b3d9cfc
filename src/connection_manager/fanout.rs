//! Non-blocking fan-out of one server event to many connections.

use std::sync::Arc;

use serde::Serialize;

use crate::websocket::{OutboundMessage, ServerMessage};

use super::ConnectionHandle;

/// Pre-serialize when at least this many connections receive the frame
const PRESERIALIZATION_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// Queue `message` on every target.
///
/// A connection that cannot take the frame is logged and skipped; it never
/// delays or fails delivery to the others.
pub fn fan_out<'a, I>(targets: I, message: &ServerMessage) -> FanOut
where
    I: IntoIterator<Item = &'a Arc<ConnectionHandle>>,
    I::IntoIter: ExactSizeIterator,
{
    let targets = targets.into_iter();
    if targets.len() == 0 {
        return FanOut::default();
    }

    let outbound = if targets.len() >= PRESERIALIZATION_THRESHOLD {
        match OutboundMessage::preserialize(message) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "Failed to pre-serialize message");
                OutboundMessage::Raw(message.clone())
            }
        }
    } else {
        OutboundMessage::Raw(message.clone())
    };

    let mut result = FanOut::default();
    for conn in targets {
        match conn.deliver(outbound.clone()) {
            Ok(()) => result.delivered += 1,
            Err(e) => {
                result.failed += 1;
                tracing::debug!(
                    connection_id = %conn.id,
                    user_id = %conn.user_id,
                    event = message.event_name(),
                    error = %e,
                    "Delivery failed, client will catch up over REST"
                );
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_dead_connection_does_not_block_others() {
        let (dead_tx, dead_rx) = mpsc::channel(1);
        drop(dead_rx);
        let dead = Arc::new(ConnectionHandle::new("dead".into(), vec![], dead_tx));

        let mut live = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..4 {
            let (tx, rx) = mpsc::channel(4);
            live.push(Arc::new(ConnectionHandle::new(format!("u{}", i), vec![], tx)));
            receivers.push(rx);
        }

        let mut targets = vec![dead.clone()];
        targets.extend(live.iter().cloned());
        let result = fan_out(&targets, &ServerMessage::Heartbeat);

        assert_eq!(result, FanOut { delivered: 4, failed: 1 });
        assert!(dead.is_closed());
        for rx in receivers.iter_mut() {
            assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Preserialized(_))));
        }
    }
}
