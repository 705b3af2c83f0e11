//! Capture and streaming engine.
//!
//! One [`CapturePipeline`] per camera. Each runs on its own OS thread that
//! exclusively owns the camera handle, so a failing camera never blocks the
//! other one. Frames fan out to MJPEG (`/video_feed*`), binary WebSocket
//! (`/ws/frames/:camera`) and opt-in base64 push events, and the latest
//! frame is kept in a watch channel for stills, recordings and jobs.

pub mod lease;
pub mod stats;
mod worker;

pub use lease::{CameraBusy, CameraLease, LeaseGuard};
pub use stats::{PipelineStats, SlidingWindow};
pub use worker::STREAM_MIN_INTERVAL;

use crossbeam_channel::Sender;
use image::RgbImage;
use shared::camera_interface::{CameraError, CameraInterface, FrameMetadata};
use shared::image_proc::motion::MotionConfig;
use shared::image_proc::perspective::PerspectiveTransform;
use shared::image_proc::{encode_jpeg, ImageProcError};
use shared_wasm::event::StreamStats;
use shared_wasm::CameraId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::events::EventBroadcaster;
use crate::media::MediaStore;
use crate::mjpeg::MjpegBroadcaster;
use crate::ws_stream::WsBroadcaster;

/// A captured frame shared between the pipeline consumers.
pub type SharedFrame = Arc<(RgbImage, FrameMetadata)>;

/// JPEG quality of saved stills.
pub const STILL_JPEG_QUALITY: u8 = 95;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("{0} stream is stopped")]
    NotStreaming(CameraId),
    #[error("No frame from {camera} within {timeout:?}")]
    Timeout { camera: CameraId, timeout: Duration },
    #[error("{0} pipeline is not running")]
    PipelineStopped(CameraId),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("Failed to encode image: {0}")]
    Encode(#[from] ImageProcError),
    #[error("Failed to save image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Device settings applied by the pipeline thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraControl {
    Exposure(Duration),
    Gain(f64),
    WhiteBalance { r_gain: f64, b_gain: f64 },
}

pub(crate) enum PipelineRequest {
    Control(CameraControl, oneshot::Sender<Result<(), CameraError>>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub encoding_threads: usize,
    pub jpeg_quality: u8,
    /// Run frame-difference motion detection on this camera
    pub motion_detection: Option<MotionConfig>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            encoding_threads: 2,
            jpeg_quality: 80,
            motion_detection: None,
        }
    }
}

/// State shared between the pipeline thread, its workers and the handle.
pub(crate) struct PipelineShared {
    pub(crate) camera_id: CameraId,
    pub(crate) name: String,
    pub(crate) options: PipelineOptions,
    pub(crate) streaming: AtomicBool,
    /// Recordings and jobs that keep the stream running while held
    pub(crate) holds: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stats: Mutex<PipelineStats>,
    pub(crate) frame_tx: watch::Sender<Option<SharedFrame>>,
    pub(crate) mjpeg: Arc<MjpegBroadcaster>,
    pub(crate) ws: Arc<WsBroadcaster>,
    pub(crate) events: Arc<EventBroadcaster>,
    /// Clients that opted into `video_frame` push events
    pub(crate) push_subscribers: AtomicUsize,
    pub(crate) perspective: RwLock<Option<PerspectiveTransform>>,
    pub(crate) perspective_enabled: AtomicBool,
}

impl PipelineShared {
    /// Requested by a client or held by a recording or job.
    pub(crate) fn is_active(&self) -> bool {
        self.streaming.load(Ordering::SeqCst) || self.holds.load(Ordering::SeqCst) > 0
    }
}

/// Keeps a pipeline streaming until dropped, whatever clients request.
pub struct StreamHold {
    shared: Arc<PipelineShared>,
}

impl Drop for StreamHold {
    fn drop(&mut self) {
        self.shared.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A still saved to the media directory.
#[derive(Debug, Clone)]
pub struct SavedStill {
    pub filename: String,
    pub jpeg: Vec<u8>,
}

pub struct CapturePipeline {
    shared: Arc<PipelineShared>,
    requests: Sender<PipelineRequest>,
    frames: watch::Receiver<Option<SharedFrame>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CapturePipeline {
    /// Start the pipeline thread for `camera`. Streaming starts immediately.
    pub fn spawn(
        camera_id: CameraId,
        camera: Box<dyn CameraInterface>,
        options: PipelineOptions,
        events: Arc<EventBroadcaster>,
    ) -> std::io::Result<Self> {
        let name = camera.name().to_string();
        let (frame_tx, frames) = watch::channel(None);
        let shared = Arc::new(PipelineShared {
            camera_id,
            name: name.clone(),
            options,
            streaming: AtomicBool::new(true),
            holds: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(PipelineStats::default()),
            frame_tx,
            mjpeg: Arc::new(MjpegBroadcaster::new(4)),
            ws: Arc::new(WsBroadcaster::new(4)),
            events,
            push_subscribers: AtomicUsize::new(0),
            perspective: RwLock::new(None),
            perspective_enabled: AtomicBool::new(false),
        });

        let (requests, request_rx) = crossbeam_channel::unbounded();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("capture-{camera_id}"))
            .spawn(move || worker::pipeline_loop(thread_shared, camera, request_rx))?;
        tracing::info!("Started {camera_id} pipeline for {name}");

        Ok(Self {
            shared,
            requests,
            frames,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.shared.camera_id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Apply a device setting and wait for the camera's answer.
    pub async fn apply(&self, control: CameraControl) -> Result<(), CaptureError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(PipelineRequest::Control(control, tx))
            .map_err(|_| CaptureError::PipelineStopped(self.camera_id()))?;
        rx.await
            .map_err(|_| CaptureError::PipelineStopped(self.camera_id()))?
            .map_err(CaptureError::from)
    }

    pub fn start_stream(&self) {
        if !self.shared.streaming.swap(true, Ordering::SeqCst) {
            tracing::info!("{} stream started", self.camera_id());
        }
    }

    /// Pause the stream. Frames keep flowing while a [`StreamHold`] exists.
    pub fn stop_stream(&self) {
        if self.shared.streaming.swap(false, Ordering::SeqCst) {
            let holds = self.shared.holds.load(Ordering::SeqCst);
            if holds > 0 {
                tracing::info!("{} stream stop requested, kept running for {holds} holder(s)", self.camera_id());
            } else {
                tracing::info!("{} stream stopped", self.camera_id());
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_active()
    }

    pub fn hold(&self) -> StreamHold {
        self.shared.holds.fetch_add(1, Ordering::SeqCst);
        StreamHold {
            shared: self.shared.clone(),
        }
    }

    /// Any MJPEG, frame socket or push consumer attached.
    pub fn has_consumers(&self) -> bool {
        self.shared.mjpeg.subscriber_count() > 0
            || self.shared.ws.subscriber_count() > 0
            || self.shared.push_subscribers.load(Ordering::SeqCst) > 0
    }

    pub fn latest_frame(&self) -> Option<SharedFrame> {
        self.frames.borrow().clone()
    }

    /// Wait for a frame captured after this call.
    pub async fn next_frame(&self, timeout: Duration) -> Result<SharedFrame, CaptureError> {
        let camera = self.camera_id();
        if !self.is_streaming() {
            return Err(CaptureError::NotStreaming(camera));
        }
        let mut rx = self.frames.clone();
        rx.borrow_and_update();

        tokio::time::timeout(timeout, async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| CaptureError::PipelineStopped(camera))?;
                if let Some(frame) = rx.borrow_and_update().clone() {
                    return Ok(frame);
                }
            }
        })
        .await
        .map_err(|_| CaptureError::Timeout { camera, timeout })?
    }

    /// Latest frame, or the next one if nothing was captured yet.
    pub async fn current_frame(&self, timeout: Duration) -> Result<SharedFrame, CaptureError> {
        match self.latest_frame() {
            Some(frame) => Ok(frame),
            None => self.next_frame(timeout).await,
        }
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<SharedFrame>> {
        self.frames.clone()
    }

    /// Grab a fresh frame, encode it as JPEG and save it to `media`.
    ///
    /// Neither stream is paused.
    pub async fn capture_still(
        &self,
        media: &MediaStore,
        timeout: Duration,
    ) -> Result<SavedStill, CaptureError> {
        let frame = self.next_frame(timeout).await?;
        let media = media.clone();
        let still = tokio::task::spawn_blocking(move || -> Result<SavedStill, CaptureError> {
            let jpeg = encode_jpeg(&frame.0, STILL_JPEG_QUALITY)?;
            let filename = media.save("jpeg", &jpeg)?;
            Ok(SavedStill { filename, jpeg })
        })
        .await??;
        Ok(still)
    }

    pub fn set_perspective(&self, transform: Option<PerspectiveTransform>) {
        *self.shared.perspective.write().unwrap() = transform;
    }

    pub fn has_perspective(&self) -> bool {
        self.shared.perspective.read().unwrap().is_some()
    }

    /// Toggle the perspective correction; takes effect on the next frame.
    pub fn set_perspective_enabled(&self, enabled: bool) {
        self.shared
            .perspective_enabled
            .store(enabled, Ordering::SeqCst);
    }

    pub fn add_push_subscriber(&self) {
        self.shared.push_subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_push_subscriber(&self) {
        let _ = self.shared.push_subscribers.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
    }

    pub fn stats(&self) -> StreamStats {
        let stats = self.shared.stats.lock().unwrap().clone();
        StreamStats {
            camera: Some(self.camera_id()),
            name: self.shared.name.clone(),
            streaming: self.is_streaming(),
            width: stats.width,
            height: stats.height,
            avg_fps: stats.fps_samples.average(),
            frames_captured: stats.frames_captured,
            frames_encoded: stats.frames_encoded,
            frames_dropped: stats.frames_dropped,
            subscribers: self.shared.mjpeg.subscriber_count()
                + self.shared.ws.subscriber_count()
                + self.shared.push_subscribers.load(Ordering::SeqCst),
            last_error: stats.last_error,
        }
    }

    pub fn mjpeg(&self) -> Arc<MjpegBroadcaster> {
        self.shared.mjpeg.clone()
    }

    pub fn ws(&self) -> Arc<WsBroadcaster> {
        self.shared.ws.clone()
    }

    /// Stop the pipeline thread and wait for it.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.requests.send(PipelineRequest::Shutdown);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.requests.send(PipelineRequest::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::camera_interface::simulated::{SimulatedCamera, Specimen};
    use shared::camera_interface::CameraConfig;
    use shared::devices::simulated::{SimulatedFaults, SimulatedStage};
    use shared_wasm::ScopeEvent;

    fn camera(stage: &Arc<SimulatedStage>) -> Box<dyn CameraInterface> {
        let config = CameraConfig {
            width: 64,
            height: 48,
            exposure: Duration::from_millis(10),
            frame_rate: 50.0,
        };
        Box::new(SimulatedCamera::new(
            "sim",
            config,
            stage.clone(),
            Specimen::Cells { seed: 3 },
        ))
    }

    fn pipeline(stage: &Arc<SimulatedStage>) -> (CapturePipeline, Arc<EventBroadcaster>) {
        let events = Arc::new(EventBroadcaster::new(64));
        let pipeline = CapturePipeline::spawn(
            CameraId::Main,
            camera(stage),
            PipelineOptions::default(),
            events.clone(),
        )
        .unwrap();
        (pipeline, events)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_next_frame_is_fresh() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);

        let first = pipeline.next_frame(TIMEOUT).await.unwrap();
        let second = pipeline.next_frame(TIMEOUT).await.unwrap();
        assert!(second.1.frame_number > first.1.frame_number);
        assert_eq!(first.0.dimensions(), (64, 48));
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_capture_still_saves_jpeg() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);
        let tmp = tempfile::TempDir::new().unwrap();
        let media = MediaStore::new(tmp.path()).unwrap();

        let still = pipeline.capture_still(&media, TIMEOUT).await.unwrap();
        assert!(still.filename.ends_with(".jpeg"));
        assert_eq!(&still.jpeg[..2], &[0xFF, 0xD8]);
        assert!(tmp.path().join(&still.filename).exists());
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_apply_reports_device_failure() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);

        pipeline
            .apply(CameraControl::Exposure(Duration::from_millis(12)))
            .await
            .unwrap();

        SimulatedFaults::set(&stage.faults.camera_settings, true);
        let err = pipeline.apply(CameraControl::Gain(2.0)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Camera(_)));

        // Stream resumes after the failed request
        pipeline.next_frame(TIMEOUT).await.unwrap();
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_stopped_stream_rejects_capture() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);
        pipeline.stop_stream();

        let err = pipeline.next_frame(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CaptureError::NotStreaming(CameraId::Main)));
        assert!(!pipeline.stats().streaming);

        pipeline.start_stream();
        pipeline.next_frame(TIMEOUT).await.unwrap();
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_hold_keeps_stream_running() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);

        let hold = pipeline.hold();
        pipeline.stop_stream();
        assert!(pipeline.is_streaming());
        let first = pipeline.next_frame(TIMEOUT).await.unwrap();
        let second = pipeline.next_frame(TIMEOUT).await.unwrap();
        assert!(second.1.frame_number > first.1.frame_number);

        drop(hold);
        assert!(!pipeline.is_streaming());
        assert!(matches!(
            pipeline.next_frame(TIMEOUT).await,
            Err(CaptureError::NotStreaming(CameraId::Main))
        ));
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_stream_errors_are_recorded_and_retried() {
        let stage = Arc::new(SimulatedStage::default());
        SimulatedFaults::set(&stage.faults.camera_stream, true);
        let (pipeline, _events) = pipeline(&stage);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = pipeline.stats();
        assert!(stats.last_error.is_some());
        assert_eq!(stats.frames_captured, 0);

        SimulatedFaults::set(&stage.faults.camera_stream, false);
        pipeline.next_frame(TIMEOUT).await.unwrap();
        assert!(pipeline.stats().last_error.is_none());
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_push_frames_only_when_subscribed() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, events) = pipeline(&stage);
        let mut rx = events.subscribe();

        pipeline.next_frame(TIMEOUT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        pipeline.add_push_subscriber();
        let event = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ScopeEvent::VideoFrame(_)));
        assert!(pipeline.stats().frames_encoded > 0);
        pipeline.remove_push_subscriber();
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_perspective_changes_frame_size() {
        let stage = Arc::new(SimulatedStage::default());
        let (pipeline, _events) = pipeline(&stage);

        // The first fresh frame may have been corrected before the toggle
        pipeline.set_perspective(Some(PerspectiveTransform::identity(32, 24)));
        pipeline.set_perspective_enabled(true);
        pipeline.next_frame(TIMEOUT).await.unwrap();
        let frame = pipeline.next_frame(TIMEOUT).await.unwrap();
        assert_eq!(frame.0.dimensions(), (32, 24));

        pipeline.set_perspective_enabled(false);
        pipeline.next_frame(TIMEOUT).await.unwrap();
        let frame = pipeline.next_frame(TIMEOUT).await.unwrap();
        assert_eq!(frame.0.dimensions(), (64, 48));
        pipeline.shutdown();
    }
}
