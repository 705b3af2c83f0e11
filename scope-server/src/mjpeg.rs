//! MJPEG streaming for the camera feeds.
//!
//! Browsers consume `multipart/x-mixed-replace` natively: `<img src="/video_feed">`
//! replaces the displayed JPEG with every part the server sends.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Boundary string separating MJPEG parts. Must not appear in JPEG data.
const MJPEG_BOUNDARY: &str = "frame_boundary_7f8c3d2e";

/// A JPEG frame ready for streaming.
#[derive(Clone)]
pub struct MjpegFrame {
    pub jpeg_data: Bytes,
    pub frame_number: u64,
}

impl MjpegFrame {
    /// One multipart part: boundary, part headers, JPEG, trailing CRLF.
    pub fn to_part(&self) -> Bytes {
        let head = format!(
            "--{boundary}\r\n\
             Content-Type: image/jpeg\r\n\
             Content-Length: {len}\r\n\
             \r\n",
            boundary = MJPEG_BOUNDARY,
            len = self.jpeg_data.len()
        );

        let mut bytes = Vec::with_capacity(head.len() + self.jpeg_data.len() + 2);
        bytes.extend_from_slice(head.as_bytes());
        bytes.extend_from_slice(&self.jpeg_data);
        bytes.extend_from_slice(b"\r\n");
        Bytes::from(bytes)
    }
}

/// Fans encoded frames of one camera out to any number of HTTP clients.
///
/// Slow clients skip frames rather than buffering them.
pub struct MjpegBroadcaster {
    tx: broadcast::Sender<MjpegFrame>,
}

impl MjpegBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of subscribers that received the frame.
    pub fn publish(&self, frame: MjpegFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> MjpegSubscriber {
        MjpegSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MjpegBroadcaster {
    fn default() -> Self {
        Self::new(4)
    }
}

pub struct MjpegSubscriber {
    rx: broadcast::Receiver<MjpegFrame>,
}

impl MjpegSubscriber {
    /// Stream this subscription as a `multipart/x-mixed-replace` response.
    pub fn into_response(self) -> Response {
        // Lagged and closed errors both just skip to the next frame
        let stream = BroadcastStream::new(self.rx).filter_map(|result| {
            result
                .ok()
                .map(|frame| Ok::<_, std::convert::Infallible>(frame.to_part()))
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
            )
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .header(header::EXPIRES, "0")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build MJPEG response: {e}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> MjpegFrame {
        MjpegFrame {
            jpeg_data: Bytes::from_static(b"\xFF\xD8jpeg"),
            frame_number: n,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = MjpegBroadcaster::new(4);
        assert_eq!(broadcaster.publish(frame(1)), 0);
    }

    #[test]
    fn test_subscriber_count() {
        let broadcaster = MjpegBroadcaster::new(4);
        let sub1 = broadcaster.subscribe();
        let _sub2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(sub1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.publish(frame(2)), 1);
    }

    #[test]
    fn test_part_layout() {
        let part = frame(3).to_part();
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame_boundary_7f8c3d2e\r\n"));
        assert!(text.contains("Content-Length: 6\r\n\r\n"));
        assert!(part.ends_with(b"jpeg\r\n"));
    }

    #[test]
    fn test_response_headers() {
        let broadcaster = MjpegBroadcaster::new(4);
        let response = broadcaster.subscribe().into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame_boundary_7f8c3d2e"
        );
    }
}
