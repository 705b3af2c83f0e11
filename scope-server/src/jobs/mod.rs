//! Long-running image-processing jobs.
//!
//! Every job runs as a tokio task guarded by the [`JobRegistry`], so only
//! one instance per kind runs at a time (auto-brightness: one per LED
//! channel). Jobs that move the stage or change the illumination also
//! hold the main camera lease. Start, progress and the final status are
//! broadcast; the result goes back to the client that asked for it.

pub mod analysis;
pub mod brightness;
pub mod focus;
pub mod registry;
pub mod stitch;

pub use registry::{job_label, AlreadyRunning, JobGuard, JobKey, JobRegistry, ProgressReporter};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::RgbImage;
use shared::devices::DeviceError;
use shared::image_proc::{encode_jpeg, ImageProcError};
use shared_wasm::event::{
    ArtifactResponse, AutoBrightnessResponse, CalibrationResponse, CellCountResponse,
    FocusComplete, Progress, StatusMessage,
};
use shared_wasm::{JobKind, LedChannel, ScopeEvent};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

use crate::capture::{CameraBusy, CaptureError, CapturePipeline, SharedFrame};
use crate::events::Responder;
use crate::motion::MotionError;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),
    #[error(transparent)]
    CameraBusy(#[from] CameraBusy),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    ImageProc(#[from] ImageProcError),
    #[error("LED driver: {0}")]
    Device(#[from] DeviceError),
    #[error("Failed to save result: {0}")]
    Io(#[from] io::Error),
    #[error("Job task failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Stitch grid as (columns, rows)
    pub stitch_grid: (usize, usize),
    /// Fraction of each tile shared with its neighbour
    pub stitch_overlap: f64,
    /// Depth levels captured for a focus stack, spaced by the Z step size
    pub stack_levels: usize,
    /// Pitch of the calibration dot grid
    pub calibration_pitch_um: f64,
    pub brightness_samples: usize,
    /// Refinement stops once the LED bracket is narrower than this (percent)
    pub brightness_tolerance: f64,
    pub brightness_iterations: usize,
    /// Fast focus searches this far either side of the current Z
    pub focus_range_mm: f64,
    pub focus_tolerance_mm: f64,
    pub focus_iterations: usize,
    pub frame_timeout: Duration,
    pub move_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            stitch_grid: (3, 3),
            stitch_overlap: 0.25,
            stack_levels: 5,
            calibration_pitch_um: 10.0,
            brightness_samples: 6,
            brightness_tolerance: 1.0,
            brightness_iterations: 8,
            focus_range_mm: 0.15,
            focus_tolerance_mm: 1.0 / 1024.0,
            focus_iterations: 20,
            frame_timeout: Duration::from_secs(5),
            move_timeout: Duration::from_secs(30),
            jpeg_quality: 90,
        }
    }
}

/// A job a client can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRequest {
    Stitch,
    FocusStack,
    CellCount,
    Calibration,
    AutoBrightness(LedChannel),
    FastFocus,
}

impl JobRequest {
    pub fn kind(self) -> JobKind {
        match self {
            JobRequest::Stitch => JobKind::Stitch,
            JobRequest::FocusStack => JobKind::FocusStack,
            JobRequest::CellCount => JobKind::CellCount,
            JobRequest::Calibration => JobKind::Calibration,
            JobRequest::AutoBrightness(_) => JobKind::AutoBrightness,
            JobRequest::FastFocus => JobKind::FastFocus,
        }
    }

    pub fn channel(self) -> Option<LedChannel> {
        match self {
            JobRequest::AutoBrightness(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn label(self) -> String {
        job_label(&self.kind(), &self.channel())
    }

    /// Jobs that disturb the main camera image.
    pub fn needs_lease(self) -> bool {
        !matches!(self, JobRequest::CellCount | JobRequest::Calibration)
    }

    fn expected_steps(self, config: &JobConfig) -> u32 {
        let steps = match self {
            JobRequest::Stitch => config.stitch_grid.0 * config.stitch_grid.1,
            JobRequest::FocusStack => config.stack_levels,
            JobRequest::CellCount | JobRequest::Calibration => 1,
            JobRequest::AutoBrightness(_) => {
                brightness::expected_evaluations(config.brightness_samples, config.brightness_iterations)
            }
            JobRequest::FastFocus => config.focus_iterations + 2,
        };
        steps as u32
    }

    fn status_event(self, status: StatusMessage) -> Option<ScopeEvent> {
        Some(match self {
            JobRequest::Stitch => ScopeEvent::StitchStatus(status),
            JobRequest::FocusStack => ScopeEvent::FocusStackStatus(status),
            JobRequest::CellCount => ScopeEvent::CellCountStatus(status),
            JobRequest::Calibration => ScopeEvent::CalibrationStatus(status),
            JobRequest::AutoBrightness(_) => ScopeEvent::AutoBrightnessStatus(status),
            JobRequest::FastFocus => return None,
        })
    }

    fn progress_event(self, progress: Progress) -> Option<ScopeEvent> {
        match self {
            JobRequest::Stitch => Some(ScopeEvent::StitchProgress(progress)),
            JobRequest::FocusStack => Some(ScopeEvent::FocusStackProgress(progress)),
            _ => None,
        }
    }

    /// The response sent when the job could not start or failed.
    pub fn failure_event(self, error: &dyn std::fmt::Display) -> ScopeEvent {
        let error = error.to_string();
        match self {
            JobRequest::Stitch => ScopeEvent::StitchResponse(ArtifactResponse::failed(error)),
            JobRequest::FocusStack => {
                ScopeEvent::FocusStackResponse(ArtifactResponse::failed(error))
            }
            JobRequest::CellCount => ScopeEvent::CellCountResponse(CellCountResponse {
                success: false,
                error: Some(error),
                ..Default::default()
            }),
            JobRequest::Calibration => ScopeEvent::CalibrationResponse(CalibrationResponse {
                success: false,
                pixel_size: None,
                error: Some(error),
            }),
            JobRequest::AutoBrightness(channel) => {
                ScopeEvent::AutoBrightnessResponse(AutoBrightnessResponse {
                    success: false,
                    led_type: channel,
                    level: None,
                    metric: None,
                    error: Some(error),
                })
            }
            JobRequest::FastFocus => ScopeEvent::FocusComplete(FocusComplete {
                status: "error".to_string(),
                position: None,
                message: Some(error),
            }),
        }
    }
}

/// An image written to the media directory.
#[derive(Debug, Clone)]
pub struct SavedImage {
    pub filename: String,
    pub jpeg: Vec<u8>,
}

impl SavedImage {
    fn base64(&self) -> String {
        BASE64.encode(&self.jpeg)
    }
}

/// Successful result of a job.
#[derive(Debug, Clone)]
pub enum JobOutput {
    Stitched(SavedImage),
    Stacked {
        image: SavedImage,
        depth_map_jpeg: Vec<u8>,
    },
    Cells {
        image: SavedImage,
        count: usize,
        avg_diameter_um: f64,
    },
    Calibrated {
        pixel_size_um: f64,
    },
    Brightness {
        channel: LedChannel,
        level: f64,
        metric: f64,
    },
    Focused {
        z_mm: f64,
    },
}

impl JobOutput {
    pub fn into_event(self) -> ScopeEvent {
        match self {
            JobOutput::Stitched(image) => {
                ScopeEvent::StitchResponse(ArtifactResponse::ok(&image.filename, image.base64()))
            }
            JobOutput::Stacked {
                image,
                depth_map_jpeg,
            } => ScopeEvent::FocusStackResponse(ArtifactResponse {
                depthmap: Some(BASE64.encode(depth_map_jpeg)),
                ..ArtifactResponse::ok(&image.filename, image.base64())
            }),
            JobOutput::Cells {
                image,
                count,
                avg_diameter_um,
            } => ScopeEvent::CellCountResponse(CellCountResponse {
                success: true,
                data: Some(image.base64()),
                filename: Some(image.filename),
                count: Some(count),
                avg_diameter: Some(avg_diameter_um),
                error: None,
            }),
            JobOutput::Calibrated { pixel_size_um } => {
                ScopeEvent::CalibrationResponse(CalibrationResponse {
                    success: true,
                    pixel_size: Some(pixel_size_um),
                    error: None,
                })
            }
            JobOutput::Brightness {
                channel,
                level,
                metric,
            } => ScopeEvent::AutoBrightnessResponse(AutoBrightnessResponse {
                success: true,
                led_type: channel,
                level: Some(level),
                metric: Some(metric),
                error: None,
            }),
            JobOutput::Focused { z_mm } => ScopeEvent::FocusComplete(FocusComplete {
                status: "success".to_string(),
                position: Some(z_mm),
                message: Some(format!("Focused at Z = {z_mm:.3} mm")),
            }),
        }
    }

    fn summary(&self) -> String {
        match self {
            JobOutput::Stitched(image) | JobOutput::Stacked { image, .. } => {
                format!("saved {}", image.filename)
            }
            JobOutput::Cells { count, .. } => format!("found {count} cells"),
            JobOutput::Calibrated { pixel_size_um } => format!("{pixel_size_um:.4} um/px"),
            JobOutput::Brightness { level, .. } => format!("level {level:.1}%"),
            JobOutput::Focused { z_mm } => format!("Z = {z_mm:.3} mm"),
        }
    }
}

/// What a running job can see.
pub struct JobContext {
    pub state: Arc<AppState>,
    pub request: JobRequest,
    reporter: ProgressReporter,
}

impl JobContext {
    pub fn config(&self) -> &JobConfig {
        &self.state.job_config
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    /// Record progress and broadcast it for jobs that report it.
    pub fn progress(&self, current: u32, total: u32, message: impl Into<String>) {
        self.reporter.progress(current, total);
        let progress = Progress {
            current,
            total,
            message: message.into(),
        };
        if let Some(event) = self.request.progress_event(progress) {
            self.state.events.publish(event);
        }
    }

    /// JPEG-encode and save `image` to the media directory.
    pub async fn save_image(&self, image: RgbImage) -> Result<SavedImage, JobError> {
        let media = self.state.media.clone();
        let quality = self.config().jpeg_quality;
        tokio::task::spawn_blocking(move || -> Result<SavedImage, JobError> {
            let jpeg = encode_jpeg(&image, quality)?;
            let filename = media.save("jpeg", &jpeg)?;
            Ok(SavedImage { filename, jpeg })
        })
        .await?
    }
}

/// A frame exposed entirely after this call.
///
/// The first new frame may have been exposing while the stage or LED was
/// still changing, so it is skipped.
pub async fn settled_frame(
    pipeline: &CapturePipeline,
    timeout: Duration,
) -> Result<SharedFrame, CaptureError> {
    pipeline.next_frame(timeout).await?;
    pipeline.next_frame(timeout).await
}

async fn run(ctx: &JobContext) -> Result<JobOutput, JobError> {
    match ctx.request {
        JobRequest::Stitch => stitch::run(ctx).await.map(JobOutput::Stitched),
        JobRequest::FocusStack => focus::stack(ctx).await,
        JobRequest::CellCount => analysis::count_cells(ctx).await,
        JobRequest::Calibration => analysis::calibrate(ctx).await,
        JobRequest::AutoBrightness(channel) => brightness::run(ctx, channel).await,
        JobRequest::FastFocus => focus::fast_focus(ctx).await,
    }
}

/// Start `request` in the background.
///
/// A job that cannot start (already running, camera busy) is answered with
/// a failed response to `responder` and `None` is returned. The main
/// stream keeps running until the job ends.
pub fn start_job(
    state: &Arc<AppState>,
    responder: &Responder,
    request: JobRequest,
) -> Option<JoinHandle<()>> {
    let label = request.label();
    let guard = match state.jobs.try_start(
        request.kind(),
        request.channel(),
        request.expected_steps(&state.job_config),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!("Rejected {}: {e}", request.kind().as_str());
            responder.send(request.failure_event(&e));
            return None;
        }
    };

    let lease = if request.needs_lease() {
        match state.lease.try_acquire(label.clone()) {
            Ok(lease) => Some(lease),
            Err(e) => {
                guard.fail(&e);
                responder.send(request.failure_event(&e));
                return None;
            }
        }
    } else {
        None
    };

    if let Some(event) = request.status_event(StatusMessage::started(format!("{label} started"))) {
        state.events.publish(event);
    }

    let ctx = JobContext {
        state: state.clone(),
        request,
        reporter: guard.reporter(),
    };
    let stream = state.main.hold();
    let responder = responder.clone();
    Some(tokio::spawn(async move {
        let _guards = (lease, stream);
        match run(&ctx).await {
            Ok(output) => {
                let summary = output.summary();
                guard.complete();
                if let Some(event) =
                    request.status_event(StatusMessage::success(format!("{label} finished: {summary}")))
                {
                    ctx.state.events.publish(event);
                }
                responder.send(output.into_event());
            }
            Err(e) => {
                guard.fail(&e);
                if let Some(event) = request.status_event(StatusMessage::error(&e)) {
                    ctx.state.events.publish(event);
                }
                responder.send(request.failure_event(&e));
            }
        }
    }))
}
