//! Event fan-out to connected clients.
//!
//! Two delivery paths exist for [`ScopeEvent`]s:
//!
//! - [`EventBroadcaster`] reaches every `/ws` client and the `/api/events`
//!   SSE mirror. Used for state that all clients display (settings, motor
//!   positions, job status and progress, recording status).
//! - [`Responder`] reaches only the client that issued a command. Used for
//!   `*_set` results, `*_response` payloads and `command_error`.

use shared_wasm::ScopeEvent;
use tokio::sync::{broadcast, mpsc};

/// Broadcaster for events to all connected clients.
///
/// Follows the same pattern as `LogBroadcaster`: publishing never fails,
/// slow subscribers see `Lagged` and skip ahead.
pub struct EventBroadcaster {
    tx: broadcast::Sender<ScopeEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ScopeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScopeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Reply channel back to the client that issued a command.
///
/// Cloned into background jobs so their result reaches the originator even
/// after the command handler returned. Sends after the client disconnected
/// are dropped.
#[derive(Clone)]
pub struct Responder {
    tx: mpsc::UnboundedSender<ScopeEvent>,
}

impl Responder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScopeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ScopeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_wasm::event::StatusMessage;

    #[test]
    fn test_publish_without_subscribers() {
        let events = EventBroadcaster::new(4);
        // Should not panic
        events.publish(ScopeEvent::Closed(StatusMessage::success("bye")));
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let events = EventBroadcaster::new(4);
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.publish(ScopeEvent::Closed(StatusMessage::success("bye")));

        assert_eq!(a.recv().await.unwrap().name(), "closed");
        assert_eq!(b.recv().await.unwrap().name(), "closed");
    }

    #[tokio::test]
    async fn test_responder_after_disconnect() {
        let (responder, rx) = Responder::channel();
        drop(rx);
        assert!(responder.is_closed());
        // Dropped silently
        responder.send(ScopeEvent::Closed(StatusMessage::success("bye")));
    }

    #[test]
    fn test_lagged_subscriber_skips_ahead() {
        let events = EventBroadcaster::new(2);
        let mut rx = events.subscribe();
        for i in 0..4 {
            events.publish(ScopeEvent::Closed(StatusMessage::success(format!("{i}"))));
        }

        tokio_test::block_on(async {
            assert!(matches!(
                rx.recv().await,
                Err(broadcast::error::RecvError::Lagged(2))
            ));
            let ScopeEvent::Closed(status) = rx.recv().await.unwrap() else {
                panic!("expected closed");
            };
            assert_eq!(status.message, "2");
        });
    }
}
