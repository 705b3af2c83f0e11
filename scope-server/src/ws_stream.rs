//! Binary WebSocket frame streaming (`/ws/frames/:camera`).
//!
//! An alternative to MJPEG with a proper connection lifecycle. Each binary
//! message carries:
//! - bytes 0..4: frame width, u32 little-endian
//! - bytes 4..8: frame height, u32 little-endian
//! - bytes 8..16: frame number, u64 little-endian
//! - remaining bytes: JPEG data
//!
//! When the frame size changes (perspective mode toggled, camera
//! reconfigured) the server closes every connection with code 1000 and
//! clients reconnect.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct WsFrame {
    pub jpeg_data: Bytes,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
}

impl WsFrame {
    pub fn to_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.jpeg_data.len());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.frame_number.to_le_bytes());
        buf.extend_from_slice(&self.jpeg_data);
        buf
    }
}

/// Broadcaster for binary frames of one camera.
///
/// A size change recreates the channel, which disconnects every existing
/// subscriber.
pub struct WsBroadcaster {
    tx: RwLock<broadcast::Sender<WsFrame>>,
    capacity: usize,
    last_size: RwLock<Option<(u32, u32)>>,
}

impl WsBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: RwLock::new(tx),
            capacity,
            last_size: RwLock::new(None),
        }
    }

    /// Returns the number of subscribers that received the frame.
    pub fn publish(&self, frame: WsFrame) -> usize {
        let new_size = (frame.width, frame.height);
        let previous = self.last_size.write().unwrap().replace(new_size);

        if previous.is_some_and(|old| old != new_size) {
            let (new_tx, _) = broadcast::channel(self.capacity);
            *self.tx.write().unwrap() = new_tx;
            tracing::info!(
                "Frame size changed to {}x{}, disconnected binary stream subscribers",
                new_size.0,
                new_size.1
            );
        }

        self.tx.read().unwrap().send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsFrame> {
        self.tx.read().unwrap().subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.read().unwrap().receiver_count()
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Forward frames from `broadcaster` to one WebSocket client until either
/// side goes away.
pub async fn ws_stream_handler(ws: WebSocket, broadcaster: Arc<WsBroadcaster>) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = broadcaster.subscribe();

    // Drain inbound messages so close frames and pings are noticed
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Frame stream receive error: {e}");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame_result = rx.recv() => {
                match frame_result {
                    Ok(frame) => {
                        if let Err(e) = sender.send(Message::Binary(frame.to_binary())).await {
                            tracing::debug!("Frame stream send error: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::trace!("Frame stream client lagged {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "Stream restarting".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
    tracing::debug!("Frame stream connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64, width: u32, height: u32) -> WsFrame {
        WsFrame {
            jpeg_data: Bytes::from_static(b"\xFF\xD8data"),
            frame_number: n,
            width,
            height,
        }
    }

    #[test]
    fn test_binary_header() {
        let binary = frame(42, 640, 480).to_binary();
        assert_eq!(&binary[0..4], &640u32.to_le_bytes());
        assert_eq!(&binary[4..8], &480u32.to_le_bytes());
        assert_eq!(&binary[8..16], &42u64.to_le_bytes());
        assert_eq!(&binary[16..], b"\xFF\xD8data");
    }

    #[test]
    fn test_size_change_disconnects_subscribers() {
        let broadcaster = WsBroadcaster::new(4);
        broadcaster.publish(frame(1, 640, 480));

        let _rx = broadcaster.subscribe();
        broadcaster.publish(frame(2, 640, 480));
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(frame(3, 800, 600));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_old_subscriber_sees_closed() {
        let broadcaster = WsBroadcaster::new(4);
        broadcaster.publish(frame(1, 64, 48));
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(frame(2, 32, 24));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
