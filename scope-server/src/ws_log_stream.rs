//! Live log streaming.
//!
//! A tracing layer copies every event into a [`LogBroadcaster`]. The
//! `/logs` WebSocket streams JSON [`LogEntry`] values with a per-client
//! minimum level, and warnings and errors are mirrored to the control
//! channel as `log_message` events.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared_wasm::event::LogMessage;
use shared_wasm::{LogEntry, LogLevel, ScopeEvent};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::events::EventBroadcaster;

pub struct LogBroadcaster {
    tx: broadcast::Sender<LogEntry>,
}

impl LogBroadcaster {
    /// `capacity` entries are buffered before slow clients see `Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn broadcast(&self, entry: LogEntry) {
        let _ = self.tx.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Pulls the formatted message out of a tracing event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        }
    }
}

pub struct WsLogLayer {
    broadcaster: Arc<LogBroadcaster>,
}

impl WsLogLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

fn to_log_level(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

impl<S> Layer<S> for WsLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        self.broadcaster.broadcast(LogEntry {
            timestamp_ms,
            level: to_log_level(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.message,
        });
    }
}

/// Query parameters for `/logs`.
#[derive(Debug, Deserialize)]
pub struct LogStreamParams {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

pub async fn ws_log_handler(ws: WebSocket, broadcaster: Arc<LogBroadcaster>, min_level: LogLevel) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = broadcaster.subscribe();

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Log WebSocket receive error: {e}");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            log_result = rx.recv() => {
                match log_result {
                    Ok(entry) => {
                        if !entry.level.passes_filter(&min_level) {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&entry) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let missed = format!("{{\"type\":\"lagged\",\"missed\":{n}}}");
                        let _ = sender.send(Message::Text(missed)).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
}

/// Mirror warnings and errors onto the control channel as `log_message`.
pub fn spawn_log_forwarder(
    broadcaster: Arc<LogBroadcaster>,
    events: Arc<EventBroadcaster>,
) -> JoinHandle<()> {
    let mut rx = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    if entry.level.passes_filter(&LogLevel::Warn) {
                        events.publish(ScopeEvent::LogMessage(LogMessage {
                            level: entry.level,
                            message: entry.message,
                        }));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Install the console and `/logs` tracing layers.
///
/// Console output honours `RUST_LOG` and defaults to `info`; the `/logs`
/// layer sees everything and filters per client.
pub fn init_tracing() -> Arc<LogBroadcaster> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let log_broadcaster = Arc::new(LogBroadcaster::new(64));
    let log_layer = WsLogLayer::new(log_broadcaster.clone());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(log_layer)
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    log_broadcaster
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            timestamp_ms: 12345,
            level,
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_with_subscriber() {
        let broadcaster = LogBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast(entry(LogLevel::Info, "hello"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "hello");
        assert_eq!(received.level, LogLevel::Info);
    }

    #[test]
    fn test_layer_captures_message_and_level() {
        let broadcaster = Arc::new(LogBroadcaster::new(16));
        let mut rx = broadcaster.subscribe();
        let subscriber =
            tracing_subscriber::registry().with(WsLogLayer::new(broadcaster.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "scope", "motor {} stalled", "X");
        });

        let received = rx.try_recv().unwrap();
        assert_eq!(received.level, LogLevel::Warn);
        assert_eq!(received.target, "scope");
        assert_eq!(received.message, "motor X stalled");
    }

    #[tokio::test]
    async fn test_forwarder_only_mirrors_warnings() {
        let logs = Arc::new(LogBroadcaster::new(16));
        let events = Arc::new(EventBroadcaster::new(16));
        let mut event_rx = events.subscribe();
        let handle = spawn_log_forwarder(logs.clone(), events.clone());

        logs.broadcast(entry(LogLevel::Info, "routine"));
        logs.broadcast(entry(LogLevel::Error, "camera lost"));

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ScopeEvent::LogMessage(LogMessage {
                level: LogLevel::Error,
                message: "camera lost".to_string(),
            })
        );
        handle.abort();
    }
}
