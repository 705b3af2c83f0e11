//! Control channel WebSocket (`/ws`).
//!
//! Each client receives a settings snapshot on connect, then the merged
//! stream of broadcast events and replies to its own commands.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared_wasm::{CommandError, ScopeCommand, ScopeEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::commands::{dispatch_command, ClientSession};
use crate::events::Responder;
use crate::state::AppState;

/// Command name of a message that failed to parse, if it has one.
fn command_name(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn send_event<S>(sender: &mut S, event: &ScopeEvent) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to serialize {}: {e}", event.name());
            true
        }
    }
}

pub async fn ws_control_handler(ws: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = state.events.subscribe();
    let (responder, mut replies) = Responder::channel();
    let mut session = ClientSession::default();

    let snapshot = state.settings.snapshot_event().await;
    if !send_event(&mut sender, &snapshot).await {
        return;
    }
    tracing::info!("Control client connected");

    let mut last_lag_log = tokio::time::Instant::now() - tokio::time::Duration::from_secs(2);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) if !session.wants(&event) => {}
                    Ok(event) => {
                        if !send_event(&mut sender, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if last_lag_log.elapsed() >= tokio::time::Duration::from_secs(1) {
                            tracing::debug!("Control client lagged, skipped {n} events");
                            last_lag_log = tokio::time::Instant::now();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(reply) = replies.recv() => {
                if !send_event(&mut sender, &reply).await {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let error = match serde_json::from_str::<ScopeCommand>(&text) {
                            Ok(cmd) => {
                                tracing::debug!("Command {}", cmd.name());
                                dispatch_command(&state, &responder, &mut session, cmd)
                                    .await
                                    .err()
                            }
                            Err(e) => {
                                tracing::debug!("Invalid command: {e}");
                                Some(CommandError {
                                    command: command_name(&text),
                                    message: format!("Invalid command: {e}"),
                                })
                            }
                        };
                        if let Some(err) = error {
                            if !send_event(&mut sender, &ScopeEvent::CommandError(err)).await {
                                break;
                            }
                        }
                        if session.closed {
                            while let Ok(reply) = replies.try_recv() {
                                if !send_event(&mut sender, &reply).await {
                                    break;
                                }
                            }
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    session.release(&state).await;
    tracing::info!("Control client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_of_bad_payload() {
        assert_eq!(
            command_name(r#"{"type": "set_exposure", "data": {"value": "fast"}}"#),
            "set_exposure"
        );
        assert_eq!(command_name("not json"), "unknown");
        assert_eq!(command_name(r#"{"data": 1}"#), "unknown");
    }
}
