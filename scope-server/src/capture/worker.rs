//! The pipeline thread and its helpers.
//!
//! The pipeline thread owns the camera. Each stream session spawns a pool
//! of JPEG encoding workers fed through a bounded crossbeam channel, plus a
//! motion detection worker when enabled. The camera callback never blocks:
//! frames the workers have no room for are dropped and counted.
//!
//! Control requests (exposure, gain, white balance) end the current
//! session; they are applied between sessions and the stream restarts.

use base64::Engine;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, TrySendError};
use image::RgbImage;
use shared::camera_interface::{CameraInterface, CameraResult};
use shared::image_proc::encode_jpeg;
use shared::image_proc::motion::MotionDetector;
use shared_wasm::event::{MotionDetected, VideoFrame};
use shared_wasm::{CameraId, ScopeEvent};
use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CameraControl, PipelineRequest, PipelineShared, SharedFrame};
use crate::mjpeg::MjpegFrame;
use crate::ws_stream::WsFrame;

/// Minimum spacing of binary WebSocket and push frames.
pub const STREAM_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum spacing of `motion_detected` events.
const MOTION_EVENT_COOLDOWN: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How often a paused pipeline checks for requests.
const IDLE_POLL: Duration = Duration::from_millis(100);

fn apply_control(camera: &mut dyn CameraInterface, control: CameraControl) -> CameraResult<()> {
    match control {
        CameraControl::Exposure(exposure) => camera.set_exposure(exposure),
        CameraControl::Gain(gain) => camera.set_gain(gain),
        CameraControl::WhiteBalance { r_gain, b_gain } => camera.set_white_balance(r_gain, b_gain),
    }
}

/// Returns false on shutdown.
fn handle_request(camera: &mut dyn CameraInterface, request: PipelineRequest) -> bool {
    match request {
        PipelineRequest::Control(control, reply) => {
            let result = apply_control(camera, control);
            match &result {
                Ok(()) => tracing::info!("{}: applied {control:?}", camera.name()),
                Err(e) => tracing::warn!("{}: failed to apply {control:?}: {e}", camera.name()),
            }
            let _ = reply.send(result);
            true
        }
        PipelineRequest::Shutdown => false,
    }
}

/// Apply every queued request. Returns false on shutdown.
fn drain_requests(camera: &mut dyn CameraInterface, requests: &Receiver<PipelineRequest>) -> bool {
    while let Ok(request) = requests.try_recv() {
        if !handle_request(camera, request) {
            return false;
        }
    }
    true
}

/// Wait up to `timeout` for one request. Returns false on shutdown.
fn wait_for_request(
    camera: &mut dyn CameraInterface,
    requests: &Receiver<PipelineRequest>,
    timeout: Duration,
) -> bool {
    match requests.recv_timeout(timeout) {
        Ok(request) => handle_request(camera, request),
        Err(RecvTimeoutError::Timeout) => true,
        Err(RecvTimeoutError::Disconnected) => false,
    }
}

pub(super) fn pipeline_loop(
    shared: Arc<PipelineShared>,
    mut camera: Box<dyn CameraInterface>,
    requests: Receiver<PipelineRequest>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if shared.shutdown.load(Ordering::SeqCst) || !drain_requests(&mut *camera, &requests) {
            break;
        }

        if !shared.is_active() {
            if !wait_for_request(&mut *camera, &requests, IDLE_POLL) {
                break;
            }
            continue;
        }

        let session_start = Instant::now();
        let (encode_tx, encode_rx) = crossbeam_channel::bounded::<SharedFrame>(2);
        let encode_handles: Vec<_> = (0..shared.options.encoding_threads.max(1))
            .map(|_| {
                let rx = encode_rx.clone();
                let shared = shared.clone();
                std::thread::spawn(move || encoding_worker(rx, shared))
            })
            .collect();
        drop(encode_rx);

        let (motion_tx, motion_handle) = match shared.options.motion_detection {
            Some(config) => {
                let (tx, rx) = crossbeam_channel::bounded::<SharedFrame>(1);
                let shared = shared.clone();
                let handle = std::thread::spawn(move || {
                    motion_worker(rx, shared, MotionDetector::new(config))
                });
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        shared.stats.lock().unwrap().reset_timing();
        let mut session_frames = 0u64;
        let mut last_warp_error: Option<Instant> = None;

        let stream_result = camera.stream(&mut |frame, metadata| {
            if shared.shutdown.load(Ordering::SeqCst)
                || !shared.is_active()
                || !requests.is_empty()
            {
                return false;
            }

            let frame = corrected_frame(&shared, frame, &mut last_warp_error);
            let (width, height) = frame.dimensions();
            let shared_frame: SharedFrame = Arc::new((frame.into_owned(), metadata.clone()));
            session_frames += 1;

            let dropped = matches!(
                encode_tx.try_send(shared_frame.clone()),
                Err(TrySendError::Full(_))
            );
            if let Some(tx) = &motion_tx {
                let _ = tx.try_send(shared_frame.clone());
            }

            {
                let mut stats = shared.stats.lock().unwrap();
                stats.record_frame(width, height);
                if dropped {
                    stats.frames_dropped += 1;
                }
            }

            shared.frame_tx.send_replace(Some(shared_frame));
            true
        });

        // Workers exit once their channels disconnect
        drop(encode_tx);
        drop(motion_tx);
        for handle in encode_handles {
            let _ = handle.join();
        }
        if let Some(handle) = motion_handle {
            let _ = handle.join();
        }

        match stream_result {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
                tracing::debug!(
                    "{} stream session ended after {} frames ({:.1}s)",
                    shared.name,
                    session_frames,
                    session_start.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                if session_frames > 0 {
                    backoff = INITIAL_BACKOFF;
                }
                tracing::error!("{} stream error: {e}, retrying in {backoff:?}", shared.name);
                shared.stats.lock().unwrap().last_error = Some(e.to_string());
                if !wait_for_request(&mut *camera, &requests, backoff) {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    tracing::info!("{} pipeline stopped", shared.name);
}

/// Apply the perspective correction when it is enabled.
fn corrected_frame<'a>(
    shared: &PipelineShared,
    frame: &'a RgbImage,
    last_error: &mut Option<Instant>,
) -> Cow<'a, RgbImage> {
    if !shared.perspective_enabled.load(Ordering::SeqCst) {
        return Cow::Borrowed(frame);
    }
    let transform = shared.perspective.read().unwrap().clone();
    let Some(transform) = transform else {
        return Cow::Borrowed(frame);
    };
    match transform.warp(frame) {
        Ok(warped) => Cow::Owned(warped),
        Err(e) => {
            if last_error.map_or(true, |t| t.elapsed() >= Duration::from_secs(5)) {
                tracing::warn!("{}: perspective correction failed: {e}", shared.name);
                *last_error = Some(Instant::now());
            }
            Cow::Borrowed(frame)
        }
    }
}

fn encoding_worker(rx: Receiver<SharedFrame>, shared: Arc<PipelineShared>) {
    let mut last_stream_publish = Instant::now() - STREAM_MIN_INTERVAL;

    while let Ok(frame) = rx.recv() {
        let (image, metadata) = frame.as_ref();

        let mjpeg_wanted = shared.mjpeg.subscriber_count() > 0;
        let stream_due = last_stream_publish.elapsed() >= STREAM_MIN_INTERVAL;
        let ws_wanted = stream_due && shared.ws.subscriber_count() > 0;
        let push_wanted = stream_due && shared.push_subscribers.load(Ordering::SeqCst) > 0;
        if !(mjpeg_wanted || ws_wanted || push_wanted) {
            continue;
        }

        let jpeg = match encode_jpeg(image, shared.options.jpeg_quality) {
            Ok(jpeg) => Bytes::from(jpeg),
            Err(e) => {
                tracing::warn!("{}: JPEG encoding failed: {e}", shared.name);
                continue;
            }
        };
        shared.stats.lock().unwrap().frames_encoded += 1;

        if mjpeg_wanted {
            shared.mjpeg.publish(MjpegFrame {
                jpeg_data: jpeg.clone(),
                frame_number: metadata.frame_number,
            });
        }
        if ws_wanted {
            shared.ws.publish(WsFrame {
                jpeg_data: jpeg.clone(),
                frame_number: metadata.frame_number,
                width: image.width(),
                height: image.height(),
            });
        }
        if push_wanted {
            let video_frame = VideoFrame {
                frame: base64::engine::general_purpose::STANDARD.encode(&jpeg),
                frame_number: metadata.frame_number,
            };
            shared.events.publish(match shared.camera_id {
                CameraId::Main => ScopeEvent::VideoFrame(video_frame),
                CameraId::Aux => ScopeEvent::VideoFrameCam1(video_frame),
            });
        }
        if ws_wanted || push_wanted {
            last_stream_publish = Instant::now();
        }
    }
}

fn motion_worker(rx: Receiver<SharedFrame>, shared: Arc<PipelineShared>, mut detector: MotionDetector) {
    let mut last_event: Option<Instant> = None;

    while let Ok(frame) = rx.recv() {
        let Some(ratio) = detector.detect(&frame.0) else {
            continue;
        };
        if last_event.is_some_and(|t| t.elapsed() < MOTION_EVENT_COOLDOWN) {
            continue;
        }
        last_event = Some(Instant::now());
        tracing::debug!("{}: motion detected, {:.1}% changed", shared.name, ratio * 100.0);
        shared.events.publish(ScopeEvent::MotionDetected(MotionDetected {
            camera: shared.camera_id,
            ratio,
        }));
    }
}
