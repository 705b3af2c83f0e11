//! Shared harness: a full server state over a small simulated rig.

#![allow(dead_code)]

use scope_server::capture::PipelineOptions;
use scope_server::events::Responder;
use scope_server::jobs::JobConfig;
use scope_server::motion::MotionConfig;
use scope_server::rig::{RigConfig, SimulatedRig};
use scope_server::server::{dispatch_command, ClientSession};
use scope_server::state::{load_motor_positions, AppState, StateConfig};
use scope_server::ws_log_stream::LogBroadcaster;
use shared::config_storage::ConfigStorage;
use shared::devices::simulated::SimulatedStage;
use shared_wasm::{CommandError, ScopeCommand, ScopeEvent};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_motion_config() -> MotionConfig {
    MotionConfig {
        step_interval: Duration::from_micros(100),
        tick_moving: Duration::from_millis(20),
        tick_idle: Duration::from_millis(100),
        reconcile_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn test_job_config() -> JobConfig {
    JobConfig {
        stitch_grid: (2, 2),
        stack_levels: 3,
        brightness_samples: 4,
        brightness_iterations: 4,
        focus_iterations: 8,
        frame_timeout: Duration::from_secs(2),
        move_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

pub struct TestScope {
    pub state: Arc<AppState>,
    pub stage: Arc<SimulatedStage>,
    pub responder: Responder,
    pub replies: mpsc::UnboundedReceiver<ScopeEvent>,
    pub session: ClientSession,
    pub media_dir: TempDir,
}

impl TestScope {
    pub async fn start() -> Self {
        Self::start_with_storage(None).await
    }

    pub async fn start_with_storage(storage: Option<ConfigStorage>) -> Self {
        let media_dir = TempDir::new().unwrap();
        let rig = SimulatedRig::new(&RigConfig::small(), load_motor_positions(storage.as_ref()));
        let config = StateConfig {
            storage,
            media_dir: media_dir.path().to_path_buf(),
            motion: test_motion_config(),
            main_pipeline: PipelineOptions {
                encoding_threads: 1,
                ..Default::default()
            },
            aux_pipeline: PipelineOptions {
                encoding_threads: 1,
                ..Default::default()
            },
            jobs: test_job_config(),
            update: None,
            frame_timeout: Duration::from_secs(2),
        };
        let logs = Arc::new(LogBroadcaster::new(64));
        let state = AppState::start(rig.devices, config, logs).await.unwrap();
        let (responder, replies) = Responder::channel();
        Self {
            state,
            stage: rig.stage,
            responder,
            replies,
            session: ClientSession::default(),
            media_dir,
        }
    }

    pub async fn send(&mut self, cmd: ScopeCommand) -> Result<(), CommandError> {
        dispatch_command(&self.state, &self.responder, &mut self.session, cmd).await
    }

    /// Next reply addressed to this client.
    pub async fn reply(&mut self) -> ScopeEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.replies.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed")
    }

    /// Skip replies until one matches.
    pub async fn reply_matching(&mut self, pred: impl Fn(&ScopeEvent) -> bool) -> ScopeEvent {
        loop {
            let event = self.reply().await;
            if pred(&event) {
                return event;
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScopeEvent> {
        self.state.events.subscribe()
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}

/// Wait for a broadcast event matching `pred`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<ScopeEvent>,
    pred: impl Fn(&ScopeEvent) -> bool,
) -> ScopeEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}
