//! Video recording.
//!
//! Each camera is either idle or recording, and only one camera records at
//! a time. The active recording lives in a single slot; a background task
//! follows the pipeline's frame channel and appends JPEG frames to a
//! Motion-JPEG AVI in the media directory. Continuous recordings take the
//! frames at the nominal rate, time-lapse recordings one frame per
//! interval.

pub mod avi;

use chrono::{DateTime, Local};
use shared::image_proc::encode_jpeg;
use shared_wasm::event::RecordingStatus;
use shared_wasm::{CameraId, ScopeEvent};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use self::avi::AviWriter;
use crate::capture::{
    CameraBusy, CameraLease, CaptureError, CapturePipeline, LeaseGuard, SharedFrame, StreamHold,
};
use crate::events::EventBroadcaster;
use crate::media::MediaStore;

/// Nominal playback rate of recorded files.
pub const NOMINAL_FPS: u32 = 20;

/// Frames per file; recording pauses once reached.
pub const MAX_FRAMES: u32 = 20_000;

const RECORDING_JPEG_QUALITY: u8 = 85;

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("{0} camera is already recording")]
    AlreadyRecording(CameraId),
    #[error("Cannot record {requested} while {active} is recording")]
    CrossCameraConflict { requested: CameraId, active: CameraId },
    #[error("{0} camera is not recording")]
    NotRecording(CameraId),
    #[error(transparent)]
    CameraBusy(#[from] CameraBusy),
    #[error("Invalid recording interval {0}")]
    InvalidInterval(f64),
    #[error("No frames were recorded")]
    NoFrames,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Recording I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Recording task failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub camera_id: CameraId,
    /// Seconds between frames, 0 for continuous
    pub interval_s: f64,
    pub started_at: DateTime<Local>,
    /// Work file the frames are written to
    pub output_path: PathBuf,
}

/// A finalized recording, saved to the media directory.
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    pub filename: String,
    pub data: Vec<u8>,
    pub frames: u32,
}

struct ActiveRecording {
    session: RecordingSession,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<NamedTempFile, RecordingError>>,
}

impl ActiveRecording {
    /// Still capturing (not failed).
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

pub fn status_event(camera: CameraId, status: RecordingStatus) -> ScopeEvent {
    match camera {
        CameraId::Main => ScopeEvent::RecordingStatus(status),
        CameraId::Aux => ScopeEvent::RecordingCam1Status(status),
    }
}

pub struct RecordingManager {
    slot: Mutex<Option<ActiveRecording>>,
    media: MediaStore,
    lease: Arc<CameraLease>,
    events: Arc<EventBroadcaster>,
}

impl RecordingManager {
    pub fn new(media: MediaStore, lease: Arc<CameraLease>, events: Arc<EventBroadcaster>) -> Self {
        Self {
            slot: Mutex::new(None),
            media,
            lease,
            events,
        }
    }

    /// The live recording, if any.
    pub async fn active(&self) -> Option<RecordingSession> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|active| active.is_live())
            .map(|active| active.session.clone())
    }

    /// Start recording `pipeline`'s frames.
    ///
    /// Main camera recordings hold the camera lease until they end.
    pub async fn start(
        &self,
        pipeline: &CapturePipeline,
        interval_s: f64,
    ) -> Result<RecordingSession, RecordingError> {
        let camera = pipeline.camera_id();
        if !interval_s.is_finite() || interval_s < 0.0 {
            return Err(RecordingError::InvalidInterval(interval_s));
        }

        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref().filter(|active| active.is_live()) {
            let active = active.session.camera_id;
            return Err(if active == camera {
                RecordingError::AlreadyRecording(camera)
            } else {
                RecordingError::CrossCameraConflict {
                    requested: camera,
                    active,
                }
            });
        }

        let lease = match camera {
            CameraId::Main => Some(self.lease.try_acquire("recording")?),
            CameraId::Aux => None,
        };

        let file = tempfile::Builder::new()
            .prefix(".recording-")
            .suffix(".avi")
            .tempfile_in(self.media.dir())?;
        let session = RecordingSession {
            camera_id: camera,
            interval_s,
            started_at: Local::now(),
            output_path: file.path().to_path_buf(),
        };
        let writer = AviWriter::new(file, NOMINAL_FPS)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(record(
            writer,
            pipeline.subscribe_frames(),
            session.clone(),
            stop_rx,
            (lease, pipeline.hold()),
            self.events.clone(),
        ));

        tracing::info!(
            "Recording {camera} started ({})",
            if interval_s > 0.0 {
                format!("one frame every {interval_s}s")
            } else {
                "continuous".to_string()
            }
        );
        self.events.publish(status_event(
            camera,
            RecordingStatus {
                recording: true,
                message: "Recording started".to_string(),
                interval: interval_s,
            },
        ));

        *slot = Some(ActiveRecording {
            session: session.clone(),
            stop_tx,
            task,
        });
        Ok(session)
    }

    /// Finalize the recording of `camera` and return the saved file.
    pub async fn stop(&self, camera: CameraId) -> Result<FinishedRecording, RecordingError> {
        self.stop_matching(camera, |_| true).await
    }

    /// Finalize `session` if it is still the active recording.
    pub async fn stop_session(
        &self,
        session: &RecordingSession,
    ) -> Result<FinishedRecording, RecordingError> {
        self.stop_matching(session.camera_id, |active| {
            active.output_path == session.output_path
        })
        .await
    }

    async fn stop_matching(
        &self,
        camera: CameraId,
        matches: impl Fn(&RecordingSession) -> bool,
    ) -> Result<FinishedRecording, RecordingError> {
        let active = {
            let mut slot = self.slot.lock().await;
            match slot.take() {
                Some(active)
                    if active.is_live()
                        && active.session.camera_id == camera
                        && matches(&active.session) =>
                {
                    active
                }
                Some(active) if active.is_live() => {
                    *slot = Some(active);
                    return Err(RecordingError::NotRecording(camera));
                }
                // A failed recording already reported itself
                _ => return Err(RecordingError::NotRecording(camera)),
            }
        };

        let session = active.session;
        let _ = active.stop_tx.send(());
        let result = self.finalize(&session, active.task).await;

        let (message, interval) = match &result {
            Ok(finished) => (
                format!("Recording saved ({} frames)", finished.frames),
                session.interval_s,
            ),
            Err(e) => (format!("Recording failed: {e}"), session.interval_s),
        };
        self.events.publish(status_event(
            camera,
            RecordingStatus {
                recording: false,
                message,
                interval,
            },
        ));
        result
    }

    async fn finalize(
        &self,
        session: &RecordingSession,
        task: JoinHandle<Result<NamedTempFile, RecordingError>>,
    ) -> Result<FinishedRecording, RecordingError> {
        let file = task.await??;
        let media = self.media.clone();
        let started_at = session.started_at;

        let finished = tokio::task::spawn_blocking(move || -> Result<FinishedRecording, RecordingError> {
            let filename = media.timestamped_name_at(started_at, "avi");
            let path = media.dir().join(&filename);
            file.persist(&path).map_err(|e| e.error)?;
            let data = std::fs::read(&path)?;
            let frames = frame_count(&data);
            Ok(FinishedRecording {
                filename,
                data,
                frames,
            })
        })
        .await??;

        tracing::info!(
            "Recording {} saved as {} ({} frames, {} bytes)",
            session.camera_id,
            finished.filename,
            finished.frames,
            finished.data.len()
        );
        Ok(finished)
    }
}

/// Total frames from a finished AVI header.
fn frame_count(avi: &[u8]) -> u32 {
    avi.get(48..52)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

async fn record(
    writer: AviWriter<NamedTempFile>,
    mut frames: watch::Receiver<Option<SharedFrame>>,
    session: RecordingSession,
    mut stop_rx: oneshot::Receiver<()>,
    guards: (Option<LeaseGuard>, StreamHold),
    events: Arc<EventBroadcaster>,
) -> Result<NamedTempFile, RecordingError> {
    let camera = session.camera_id;
    let writer = match capture_frames(writer, &mut frames, &session, &mut stop_rx, &events).await {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!("Recording {camera} aborted: {e}");
            drop(guards);
            events.publish(status_event(
                camera,
                RecordingStatus {
                    recording: false,
                    message: format!("Recording failed: {e}"),
                    interval: session.interval_s,
                },
            ));
            return Err(e);
        }
    };

    let frames_written = writer.frame_count();
    let file = tokio::task::spawn_blocking(move || writer.finish()).await??;
    drop(guards);
    if frames_written == 0 {
        return Err(RecordingError::NoFrames);
    }
    Ok(file)
}

/// Append frames until stopped. Returns the writer for finalizing.
async fn capture_frames(
    mut writer: AviWriter<NamedTempFile>,
    frames: &mut watch::Receiver<Option<SharedFrame>>,
    session: &RecordingSession,
    stop_rx: &mut oneshot::Receiver<()>,
    events: &EventBroadcaster,
) -> Result<AviWriter<NamedTempFile>, RecordingError> {
    let camera = session.camera_id;
    let gap = if session.interval_s > 0.0 {
        Duration::from_secs_f64(session.interval_s)
    } else {
        Duration::from_secs_f64(1.0 / NOMINAL_FPS as f64)
    };
    let mut next_due = Instant::now();
    frames.borrow_and_update();

    loop {
        tokio::select! {
            _ = &mut *stop_rx => return Ok(writer),
            changed = frames.changed() => {
                changed.map_err(|_| CaptureError::PipelineStopped(camera))?;
                if Instant::now() < next_due {
                    continue;
                }
                let Some(frame) = frames.borrow_and_update().clone() else {
                    continue;
                };
                next_due = Instant::now() + gap;

                writer = tokio::task::spawn_blocking(move || -> Result<_, RecordingError> {
                    let jpeg = encode_jpeg(&frame.0, RECORDING_JPEG_QUALITY)
                        .map_err(CaptureError::from)?;
                    let (width, height) = frame.0.dimensions();
                    writer.write_frame(&jpeg, width, height)?;
                    Ok(writer)
                })
                .await??;

                if writer.frame_count() >= MAX_FRAMES {
                    tracing::warn!("Recording {camera} reached {MAX_FRAMES} frames, waiting for stop");
                    events.publish(status_event(
                        camera,
                        RecordingStatus {
                            recording: true,
                            message: format!("Frame limit of {MAX_FRAMES} reached"),
                            interval: session.interval_s,
                        },
                    ));
                    let _ = (&mut *stop_rx).await;
                    return Ok(writer);
                }
            }
        }
    }
}
