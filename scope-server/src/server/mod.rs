//! HTTP and WebSocket front end.

pub mod commands;
pub mod ws;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use clap::Args;
use shared_wasm::event::StreamStatsReport;
use shared_wasm::CameraId;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;
use crate::ws_log_stream::{ws_log_handler, LogStreamParams};
use crate::ws_stream::ws_stream_handler;

pub use commands::{dispatch_command, ClientSession};
pub use ws::ws_control_handler;

/// Common command-line arguments for the server binary.
#[derive(Args, Debug, Clone)]
pub struct CommonServerArgs {
    #[arg(
        short = 'p',
        long,
        default_value = "5000",
        help = "HTTP server port",
        long_help = "TCP port for the HTTP/WebSocket server. The control channel is served \
            at ws://<bind_address>:<port>/ws. Default: 5000."
    )]
    pub port: u16,

    #[arg(
        short = 'b',
        long,
        default_value = "0.0.0.0",
        help = "HTTP server bind address",
        long_help = "IP address to bind the HTTP server to. Use '0.0.0.0' to listen on all \
            interfaces (required for remote access), or '127.0.0.1' for localhost-only access."
    )]
    pub bind_address: String,

    #[arg(
        long,
        default_value = "4",
        help = "JPEG encoding threads per camera",
        long_help = "Number of worker threads each camera pipeline uses to JPEG-encode \
            frames for the MJPEG, WebSocket and push streams."
    )]
    pub encoding_threads: usize,
}

async fn logging_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    info!(
        "{} {} from {} - {:.1}ms",
        method,
        uri.path(),
        addr.ip(),
        elapsed.as_secs_f64() * 1000.0
    );

    response
}

async fn ws_control_endpoint(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_control_handler(socket, state))
}

async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    state.main.start_stream();
    state.main.mjpeg().subscribe().into_response()
}

async fn video_feed_cam1(State(state): State<Arc<AppState>>) -> Response {
    state.aux.start_stream();
    state.aux.mjpeg().subscribe().into_response()
}

async fn ws_frames_endpoint(
    State(state): State<Arc<AppState>>,
    Path(camera): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let camera: CameraId = match camera.parse() {
        Ok(camera) => camera,
        Err(e) => return (StatusCode::NOT_FOUND, e).into_response(),
    };
    let pipeline = state.pipeline(camera);
    pipeline.start_stream();
    let broadcaster = pipeline.ws();
    ws.on_upgrade(move |socket| ws_stream_handler(socket, broadcaster))
}

/// WebRTC negotiation is not provided; clients fall back to MJPEG or the
/// binary frame socket.
fn offer_response(camera: CameraId) -> Response {
    let (mjpeg, frames) = match camera {
        CameraId::Main => ("/video_feed", "/ws/frames/main"),
        CameraId::Aux => ("/video_feed_cam1", "/ws/frames/cam1"),
    };
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "error": "WebRTC is not supported by this server",
            "mjpeg": mjpeg,
            "ws_frames": frames,
        })),
    )
        .into_response()
}

async fn offer_main() -> Response {
    offer_response(CameraId::Main)
}

async fn offer_cam1() -> Response {
    offer_response(CameraId::Aux)
}

async fn settings_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.settings.snapshot().await)
}

async fn streams_endpoint(State(state): State<Arc<AppState>>) -> Json<StreamStatsReport> {
    Json(StreamStatsReport {
        streams: CameraId::ALL
            .iter()
            .map(|&camera| state.pipeline(camera).stats())
            .collect(),
    })
}

/// Server-sent mirror of the broadcast event stream.
async fn events_endpoint(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                // Frame pushes are opt-in on the control socket only
                Ok(event) if event.pushed_frame_camera().is_some() => continue,
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event(event.name()).data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::default()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn ws_log_endpoint(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogStreamParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let broadcaster = state.log_broadcaster.clone();
    ws.on_upgrade(move |socket| ws_log_handler(socket, broadcaster, params.level))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let media = ServeDir::new(state.media.dir());
    Router::new()
        .route("/ws", get(ws_control_endpoint))
        .route("/video_feed", get(video_feed))
        .route("/video_feed_cam1", get(video_feed_cam1))
        .route("/ws/frames/:camera", get(ws_frames_endpoint))
        .route("/offer", post(offer_main))
        .route("/offer_cam1", post(offer_cam1))
        .route("/api/settings", get(settings_endpoint))
        .route("/api/streams", get(streams_endpoint))
        .route("/api/events", get(events_endpoint))
        .route("/logs", get(ws_log_endpoint))
        .nest_service("/media", media)
        .with_state(state)
        .layer(middleware::from_fn(logging_middleware))
}

/// Serve until the listener fails.
pub async fn run_server(state: Arc<AppState>, args: &CommonServerArgs) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", args.bind_address, args.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;

    info!("Starting server on http://{}", addr);
    info!("Control WebSocket: ws://{}/ws", addr);
    info!("MJPEG streams: http://{0}/video_feed, http://{0}/video_feed_cam1", addr);
    info!("Event stream: http://{}/api/events", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {e}"))?;

    Ok(())
}
