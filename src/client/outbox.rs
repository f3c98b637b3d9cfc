use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::websocket::ClientMessage;

use super::ClientError;

/// Write side of the current transport link, shared by everything that
/// sends client events. Empty while disconnected.
#[derive(Default)]
pub struct Outbox {
    link: Mutex<Option<mpsc::Sender<String>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, link: mpsc::Sender<String>) {
        *self.link.lock() = Some(link);
    }

    pub fn detach(&self) {
        self.link.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| !l.is_closed())
    }

    /// Queue an event on the link. Nothing is buffered while disconnected.
    pub fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(message)?;
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(ClientError::NotConnected)?;
        link.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ClientError::NotConnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_link() {
        let outbox = Outbox::new();
        assert!(matches!(outbox.send(&ClientMessage::Ping), Err(ClientError::NotConnected)));

        let (tx, mut rx) = mpsc::channel(4);
        outbox.attach(tx);
        outbox.send(&ClientMessage::Ping).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"event":"ping"}"#);

        outbox.detach();
        assert!(!outbox.is_attached());
        assert!(outbox.send(&ClientMessage::Ping).is_err());
    }
}
