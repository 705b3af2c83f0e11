//! Process-wide server state.

use anyhow::Context;
use shared::camera_interface::CameraInterface;
use shared::config_storage::{ConfigStorage, StoredMotorPositions};
use shared::devices::{DeviceError, LedDriver, StepperMotor};
use shared::image_proc::DEFAULT_PIXEL_SIZE_UM;
use shared_wasm::{Axis, CameraId, InstrumentSettings, LedChannel, STEPS_PER_MM};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{CameraControl, CameraLease, CapturePipeline, PipelineOptions};
use crate::connectivity::{UpdateConfig, Updater, WifiBackend, WifiManager};
use crate::events::EventBroadcaster;
use crate::jobs::{JobConfig, JobRegistry};
use crate::media::MediaStore;
use crate::motion::{MotionConfig, MotionController};
use crate::recording::RecordingManager;
use crate::settings::SettingsStore;
use crate::ws_log_stream::LogBroadcaster;

/// Hardware handed to [`AppState::start`].
pub struct Devices {
    pub main_camera: Box<dyn CameraInterface>,
    pub aux_camera: Box<dyn CameraInterface>,
    /// Ordered X, Y, Z
    pub motors: [Box<dyn StepperMotor>; 3],
    pub leds: Box<dyn LedDriver>,
    pub wifi: Arc<dyn WifiBackend>,
}

pub struct StateConfig {
    /// Persistent configuration; `None` keeps everything in memory
    pub storage: Option<ConfigStorage>,
    pub media_dir: PathBuf,
    pub motion: MotionConfig,
    pub main_pipeline: PipelineOptions,
    pub aux_pipeline: PipelineOptions,
    pub jobs: JobConfig,
    pub update: Option<UpdateConfig>,
    /// Timeout for stills and other single-frame requests
    pub frame_timeout: Duration,
}

/// Stored step counts, or the origin when nothing was saved.
pub fn load_motor_positions(storage: Option<&ConfigStorage>) -> StoredMotorPositions {
    match storage.and_then(|s| s.get_motor_positions()) {
        Some(Ok(positions)) => {
            info!(
                "Restored motor positions ({}, {}, {}) steps",
                positions.x_pos, positions.y_pos, positions.z_pos
            );
            positions
        }
        Some(Err(e)) => {
            warn!("Failed to load motor positions: {e}, starting at the origin");
            StoredMotorPositions::default()
        }
        None => StoredMotorPositions::default(),
    }
}

fn load_settings(storage: Option<&ConfigStorage>) -> InstrumentSettings {
    let mut settings = InstrumentSettings::default();
    match storage.and_then(|s| s.get_settings()) {
        Some(Ok(saved)) => {
            saved.apply_to(&mut settings);
            info!("Loaded saved camera settings");
        }
        Some(Err(e)) => warn!("Failed to load settings: {e}, using defaults"),
        None => info!("No saved settings, using defaults"),
    }
    settings
}

pub struct AppState {
    pub events: Arc<EventBroadcaster>,
    pub settings: Arc<SettingsStore>,
    pub motion: Arc<MotionController>,
    pub main: Arc<CapturePipeline>,
    pub aux: Arc<CapturePipeline>,
    pub recordings: RecordingManager,
    pub jobs: Arc<JobRegistry>,
    pub lease: Arc<CameraLease>,
    pub leds: Arc<Mutex<Box<dyn LedDriver>>>,
    pub wifi: WifiManager,
    pub updater: Option<Arc<Updater>>,
    pub storage: Option<ConfigStorage>,
    pub media: MediaStore,
    pub log_broadcaster: Arc<LogBroadcaster>,
    pub job_config: JobConfig,
    pub frame_timeout: Duration,
    /// µm per pixel of the main camera
    pixel_size_um: RwLock<f64>,
    telemetry: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Restore persisted state, start every device worker and apply the
    /// restored settings to the hardware.
    pub async fn start(
        devices: Devices,
        config: StateConfig,
        log_broadcaster: Arc<LogBroadcaster>,
    ) -> anyhow::Result<Arc<Self>> {
        let storage = config.storage;
        let events = Arc::new(EventBroadcaster::default());
        let media = MediaStore::new(&config.media_dir)
            .with_context(|| format!("Failed to create {}", config.media_dir.display()))?;

        let positions = load_motor_positions(storage.as_ref());
        let mut initial = load_settings(storage.as_ref());
        for axis in Axis::ALL {
            initial.set_target(axis, positions.get(axis) as f64 / STEPS_PER_MM);
        }

        let pixel_size_um = match storage.as_ref().and_then(|s| s.get_calibration()) {
            Some(Ok(calibration)) => {
                info!("Using calibrated pixel size {:.4} um", calibration.pixel_size_um);
                calibration.pixel_size_um
            }
            Some(Err(e)) => {
                warn!("Failed to load calibration: {e}");
                DEFAULT_PIXEL_SIZE_UM
            }
            None => DEFAULT_PIXEL_SIZE_UM,
        };

        let main = Arc::new(
            CapturePipeline::spawn(
                CameraId::Main,
                devices.main_camera,
                config.main_pipeline,
                events.clone(),
            )
            .context("Failed to start main camera pipeline")?,
        );
        let aux = Arc::new(
            CapturePipeline::spawn(
                CameraId::Aux,
                devices.aux_camera,
                config.aux_pipeline,
                events.clone(),
            )
            .context("Failed to start auxiliary camera pipeline")?,
        );
        match storage.as_ref().and_then(|s| s.get_perspective_transform()) {
            Some(Ok(transform)) => match transform.validate() {
                Ok(()) => {
                    let [width, height] = transform.output_size;
                    info!("Loaded perspective transform ({width}x{height})");
                    aux.set_perspective(Some(transform));
                }
                Err(e) => warn!("Ignoring perspective transform: {e}"),
            },
            Some(Err(e)) => warn!("Failed to load perspective transform: {e}"),
            None => info!("No perspective transform, cam1 perspective mode unavailable"),
        }

        let motion = MotionController::start(devices.motors, positions, config.motion, events.clone())
            .context("Failed to start motion controller")?;
        let settings = Arc::new(SettingsStore::new(initial.clone(), events.clone()));
        let telemetry = motion.spawn_telemetry(settings.clone(), storage.clone());

        let lease = CameraLease::new();
        let state = Arc::new(Self {
            recordings: RecordingManager::new(media.clone(), lease.clone(), events.clone()),
            jobs: JobRegistry::new(events.clone()),
            leds: Arc::new(Mutex::new(devices.leds)),
            wifi: WifiManager::new(devices.wifi),
            updater: config.update.map(Updater::new),
            events,
            settings,
            motion,
            main,
            aux,
            lease,
            storage,
            media,
            log_broadcaster,
            job_config: config.jobs,
            frame_timeout: config.frame_timeout,
            pixel_size_um: RwLock::new(pixel_size_um),
            telemetry: Mutex::new(Some(telemetry)),
        });

        state.apply_device_settings(&initial).await;
        Ok(state)
    }

    /// Push camera and LED settings to the hardware. Failures are logged.
    async fn apply_device_settings(&self, settings: &InstrumentSettings) {
        let controls = [
            CameraControl::Exposure(Duration::from_secs_f64(settings.exposure_ms / 1000.0)),
            CameraControl::Gain(settings.gain),
            CameraControl::WhiteBalance {
                r_gain: settings.r_gain,
                b_gain: settings.b_gain,
            },
        ];
        for control in controls {
            if let Err(e) = self.main.apply(control).await {
                warn!("Failed to apply {control:?}: {e}");
            }
        }
        for channel in LedChannel::ALL {
            if let Err(e) = self.set_led(channel, settings.led_level(channel)).await {
                warn!("Failed to set {channel} LED: {e}");
            }
        }
    }

    pub fn pipeline(&self, camera: CameraId) -> &Arc<CapturePipeline> {
        match camera {
            CameraId::Main => &self.main,
            CameraId::Aux => &self.aux,
        }
    }

    pub fn pixel_size_um(&self) -> f64 {
        *self.pixel_size_um.read().unwrap()
    }

    pub fn set_pixel_size_um(&self, um_per_px: f64) {
        *self.pixel_size_um.write().unwrap() = um_per_px;
    }

    pub async fn set_led(&self, channel: LedChannel, percent: f64) -> Result<(), DeviceError> {
        let leds = self.leds.clone();
        tokio::task::spawn_blocking(move || leds.lock().unwrap().set_level(channel, percent))
            .await
            .map_err(|e| DeviceError::CommandFailed(format!("LED task failed: {e}")))?
    }

    /// Stop background tasks and device threads.
    pub fn shutdown(&self) {
        if let Some(handle) = self.telemetry.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(updater) = &self.updater {
            updater.cancel_restart();
        }
        self.motion.shutdown();
        self.main.shutdown();
        self.aux.shutdown();
        info!("Devices shut down");
    }
}
