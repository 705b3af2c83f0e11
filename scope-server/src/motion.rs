//! Stage motion control.
//!
//! Each axis is driven by its own OS thread that owns the [`StepperMotor`]
//! and executes one step at a time, checking its command channel between
//! steps so a new target or a stop takes effect immediately. Positions are
//! tracked in motor steps (1024 per mm) in atomics shared with the async
//! side.
//!
//! A tokio telemetry task publishes `motor_positions` every 200 ms while any
//! axis moves and every second otherwise, persists the step counts, and
//! after a move finishes snaps the stored targets to the real position
//! unless the user edited a target in the meantime.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use shared::config_storage::{ConfigStorage, StoredMotorPositions};
use shared::devices::{x_voltage_to_mm, DeviceError, StepDirection, StepperMotor};
use shared_wasm::event::{MotorPositions, MoveStatus};
use shared_wasm::{Axis, ScopeEvent, STEPS_PER_MM};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use crate::events::EventBroadcaster;
use crate::settings::SettingsStore;

/// Steps between sensor reads while moving.
const VOLTAGE_SAMPLE_STEPS: u32 = 64;

/// Poll period of [`MotionController::wait_idle`].
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Round to the 3 decimals (µm resolution) reported to clients.
pub fn round_mm(mm: f64) -> f64 {
    (mm * 1000.0).round() / 1000.0
}

fn steps_to_mm(steps: i64) -> f64 {
    steps as f64 / STEPS_PER_MM
}

/// Physical travel of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelRange {
    pub min_mm: f64,
    pub max_mm: f64,
}

impl TravelRange {
    pub fn new(min_mm: f64, max_mm: f64) -> Self {
        Self { min_mm, max_mm }
    }

    pub fn contains(&self, mm: f64) -> bool {
        mm.is_finite() && mm >= self.min_mm && mm <= self.max_mm
    }
}

#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Travel limits indexed by [`Axis::index`]
    pub travel: [TravelRange; 3],
    /// Pause between consecutive steps, sets the stage speed
    pub step_interval: Duration,
    pub tick_moving: Duration,
    pub tick_idle: Duration,
    /// Quiet period after a move before targets snap to the real position
    pub reconcile_delay: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            travel: [
                TravelRange::new(-20.0, 20.0),
                TravelRange::new(-20.0, 20.0),
                TravelRange::new(-5.0, 5.0),
            ],
            step_interval: Duration::from_micros(200),
            tick_moving: Duration::from_millis(200),
            tick_idle: Duration::from_secs(1),
            reconcile_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("{axis} target {target_mm:.3} mm is outside the travel range {min_mm:.3} to {max_mm:.3} mm")]
    InvalidRange {
        axis: Axis,
        target_mm: f64,
        min_mm: f64,
        max_mm: f64,
    },
    #[error("{0}")]
    InvalidStep(String),
    #[error("{axis} motor: {source}")]
    Device { axis: Axis, source: DeviceError },
    #[error("{0} axis controller is not running")]
    AxisOffline(Axis),
    #[error("{axis} axis did not settle within {timeout:?}")]
    Timeout { axis: Axis, timeout: Duration },
}

/// Snapshot of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisPosition {
    pub current_mm: f64,
    pub target_mm: f64,
    pub moving: bool,
}

enum AxisCommand {
    MoveTo(i64),
    /// Halt and acknowledge once the motor stopped
    Stop(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct AxisState {
    position: AtomicI64,
    target: AtomicI64,
    moving: AtomicBool,
    /// Last sensor voltage as f64 bits
    voltage: AtomicU64,
    last_error: Mutex<Option<DeviceError>>,
}

impl AxisState {
    fn voltage(&self) -> f64 {
        f64::from_bits(self.voltage.load(Ordering::Relaxed))
    }
}

struct AxisWorker {
    motor: Box<dyn StepperMotor>,
    state: Arc<AxisState>,
    completed_moves: Arc<AtomicU64>,
    step_interval: Duration,
    sample_interval: Duration,
}

impl AxisWorker {
    fn sample_voltage(&mut self) {
        match self.motor.read_voltage() {
            Ok(v) => self.state.voltage.store(v.to_bits(), Ordering::Relaxed),
            Err(e) => tracing::debug!("{} sensor read failed: {e}", self.motor.axis()),
        }
    }

    fn finish_move(&mut self, goal: &mut Option<i64>) {
        *goal = None;
        self.state.moving.store(false, Ordering::SeqCst);
        self.completed_moves.fetch_add(1, Ordering::SeqCst);
        self.sample_voltage();
    }

    fn run(mut self, rx: Receiver<AxisCommand>) {
        let axis = self.motor.axis();
        let mut goal: Option<i64> = None;
        let mut steps_since_sample = 0u32;
        self.sample_voltage();

        loop {
            let command = if goal.is_some() {
                match rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match rx.recv_timeout(self.sample_interval) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => {
                        self.sample_voltage();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match command {
                Some(AxisCommand::MoveTo(steps)) => {
                    tracing::debug!("{axis} moving to step {steps}");
                    self.state.target.store(steps, Ordering::SeqCst);
                    self.state.moving.store(true, Ordering::SeqCst);
                    goal = Some(steps);
                }
                Some(AxisCommand::Stop(ack)) => {
                    if let Err(e) = self.motor.halt() {
                        tracing::warn!("{axis} halt failed: {e}");
                    }
                    let position = self.state.position.load(Ordering::SeqCst);
                    self.state.target.store(position, Ordering::SeqCst);
                    if goal.is_some() {
                        tracing::info!("{axis} stopped at step {position}");
                        self.finish_move(&mut goal);
                    } else {
                        self.state.moving.store(false, Ordering::SeqCst);
                    }
                    let _ = ack.send(());
                    continue;
                }
                Some(AxisCommand::Shutdown) => {
                    let _ = self.motor.halt();
                    self.state.moving.store(false, Ordering::SeqCst);
                    break;
                }
                None => {}
            }

            let Some(target) = goal else { continue };
            let current = self.state.position.load(Ordering::SeqCst);
            match StepDirection::towards(current, target) {
                None => {
                    tracing::debug!("{axis} reached step {target}");
                    self.finish_move(&mut goal);
                }
                Some(direction) => match self.motor.step(direction) {
                    Ok(()) => {
                        self.state.position.fetch_add(direction.delta(), Ordering::SeqCst);
                        steps_since_sample += 1;
                        if steps_since_sample >= VOLTAGE_SAMPLE_STEPS {
                            steps_since_sample = 0;
                            self.sample_voltage();
                        }
                        if !self.step_interval.is_zero() {
                            std::thread::sleep(self.step_interval);
                        }
                    }
                    Err(e) => {
                        tracing::error!("{axis} step failed, aborting move: {e}");
                        let _ = self.motor.halt();
                        self.state.target.store(current, Ordering::SeqCst);
                        *self.state.last_error.lock().unwrap() = Some(e);
                        self.finish_move(&mut goal);
                    }
                },
            }
        }

        tracing::debug!("{axis} axis worker exiting");
    }
}

struct AxisHandle {
    tx: Sender<AxisCommand>,
    state: Arc<AxisState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct MotionController {
    axes: [AxisHandle; 3],
    config: MotionConfig,
    events: Arc<EventBroadcaster>,
    /// Wakes the telemetry task when a move starts
    activity: Notify,
    target_edits: AtomicU64,
    completed_moves: Arc<AtomicU64>,
}

impl MotionController {
    /// Spawn one worker thread per axis.
    ///
    /// `motors` are ordered X, Y, Z. `initial` is the restored step count
    /// of each axis.
    pub fn start(
        motors: [Box<dyn StepperMotor>; 3],
        initial: StoredMotorPositions,
        config: MotionConfig,
        events: Arc<EventBroadcaster>,
    ) -> std::io::Result<Arc<Self>> {
        let completed_moves = Arc::new(AtomicU64::new(0));
        let [x, y, z] = motors;

        let spawn_axis = |axis: Axis, motor: Box<dyn StepperMotor>| -> std::io::Result<AxisHandle> {
            if motor.axis() != axis {
                tracing::warn!("Motor for {} reports axis {}", axis, motor.axis());
            }
            let steps = initial.get(axis);
            let state = Arc::new(AxisState::default());
            state.position.store(steps, Ordering::SeqCst);
            state.target.store(steps, Ordering::SeqCst);

            let (tx, rx) = crossbeam_channel::unbounded();
            let worker = AxisWorker {
                motor,
                state: state.clone(),
                completed_moves: completed_moves.clone(),
                step_interval: config.step_interval,
                sample_interval: config.tick_idle,
            };
            let thread = std::thread::Builder::new()
                .name(format!("axis-{}", axis.as_str()))
                .spawn(move || worker.run(rx))?;

            Ok(AxisHandle {
                tx,
                state,
                thread: Mutex::new(Some(thread)),
            })
        };

        let axes = [
            spawn_axis(Axis::X, x)?,
            spawn_axis(Axis::Y, y)?,
            spawn_axis(Axis::Z, z)?,
        ];
        tracing::info!(
            "Motion controller started at steps ({}, {}, {})",
            initial.x_pos,
            initial.y_pos,
            initial.z_pos
        );

        Ok(Arc::new(Self {
            axes,
            config,
            events,
            activity: Notify::new(),
            target_edits: AtomicU64::new(0),
            completed_moves,
        }))
    }

    fn handle(&self, axis: Axis) -> &AxisHandle {
        &self.axes[axis.index()]
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn position(&self, axis: Axis) -> AxisPosition {
        let state = &self.handle(axis).state;
        AxisPosition {
            current_mm: steps_to_mm(state.position.load(Ordering::SeqCst)),
            target_mm: steps_to_mm(state.target.load(Ordering::SeqCst)),
            moving: state.moving.load(Ordering::SeqCst),
        }
    }

    pub fn positions_steps(&self) -> [i64; 3] {
        Axis::ALL.map(|axis| self.handle(axis).state.position.load(Ordering::SeqCst))
    }

    pub fn positions_mm(&self) -> [f64; 3] {
        self.positions_steps().map(steps_to_mm)
    }

    pub fn is_moving(&self) -> bool {
        Axis::ALL
            .iter()
            .any(|&axis| self.handle(axis).state.moving.load(Ordering::SeqCst))
    }

    pub fn validate_target(&self, axis: Axis, target_mm: f64) -> Result<(), MotionError> {
        let range = self.config.travel[axis.index()];
        if range.contains(target_mm) {
            Ok(())
        } else {
            Err(MotionError::InvalidRange {
                axis,
                target_mm,
                min_mm: range.min_mm,
                max_mm: range.max_mm,
            })
        }
    }

    /// Start an absolute move. A move already in flight on this axis is
    /// retargeted.
    pub fn move_to(&self, axis: Axis, target_mm: f64) -> Result<f64, MotionError> {
        self.validate_target(axis, target_mm)?;
        let handle = self.handle(axis);
        let steps = (target_mm * STEPS_PER_MM).round() as i64;

        *handle.state.last_error.lock().unwrap() = None;
        handle.state.target.store(steps, Ordering::SeqCst);
        handle.state.moving.store(true, Ordering::SeqCst);
        handle
            .tx
            .send(AxisCommand::MoveTo(steps))
            .map_err(|_| MotionError::AxisOffline(axis))?;

        self.target_edits.fetch_add(1, Ordering::SeqCst);
        self.activity.notify_one();
        tracing::info!("Moving {axis} to {target_mm:.3} mm");
        Ok(target_mm)
    }

    /// Move relative to the current target of `axis`. Returns the new target.
    pub fn move_relative(&self, axis: Axis, delta_um: f64) -> Result<f64, MotionError> {
        if !delta_um.is_finite() {
            return Err(MotionError::InvalidStep(format!(
                "{axis} step of {delta_um} um is not a number"
            )));
        }
        let base = self.position(axis).target_mm;
        // Keep targets on a µm grid so repeated jogs don't accumulate float noise
        let target = ((base + delta_um / 1000.0) * 1e6).round() / 1e6;
        self.move_to(axis, target)
    }

    /// Halt `axis` (or every axis) and wait for the workers to acknowledge.
    ///
    /// Publishes a final position tick and `move_status{status: false}`.
    /// Safe to call when nothing is moving.
    pub async fn stop(&self, axis: Option<Axis>) {
        let selected: Vec<Axis> = match axis {
            Some(axis) => vec![axis],
            None => Axis::ALL.to_vec(),
        };

        let mut acks = Vec::with_capacity(selected.len());
        for axis in selected {
            let (tx, rx) = oneshot::channel();
            if self.handle(axis).tx.send(AxisCommand::Stop(tx)).is_ok() {
                acks.push(rx);
            } else {
                tracing::warn!("{axis} axis worker is gone, cannot stop");
            }
        }
        for ack in acks {
            let _ = ack.await;
        }

        self.events.publish(ScopeEvent::MotorPositions(self.tick()));
        self.events.publish(ScopeEvent::MoveStatus(MoveStatus {
            status: false,
            message: "Moving stopped".to_string(),
        }));
    }

    /// Wait until `axis` stops moving. Fails if the move aborted on a
    /// device error.
    pub async fn wait_idle(&self, axis: Axis, timeout: Duration) -> Result<(), MotionError> {
        let state = &self.handle(axis).state;
        let deadline = tokio::time::Instant::now() + timeout;
        while state.moving.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                return Err(MotionError::Timeout { axis, timeout });
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        match state.last_error.lock().unwrap().clone() {
            Some(source) => Err(MotionError::Device { axis, source }),
            None => Ok(()),
        }
    }

    pub async fn move_and_wait(
        &self,
        axis: Axis,
        target_mm: f64,
        timeout: Duration,
    ) -> Result<(), MotionError> {
        self.move_to(axis, target_mm)?;
        self.wait_idle(axis, timeout).await
    }

    /// Current `motor_positions` telemetry.
    pub fn tick(&self) -> MotorPositions {
        let [x, y, z] = self.positions_mm();
        let voltage = |axis: Axis| self.handle(axis).state.voltage();
        MotorPositions {
            x_pos: round_mm(x),
            y_pos: round_mm(y),
            z_pos: round_mm(z),
            motor_status: self.is_moving(),
            x_vol: round_mm(x_voltage_to_mm(voltage(Axis::X))),
            y_vol: voltage(Axis::Y),
            z_vol: voltage(Axis::Z),
        }
    }

    /// Start the telemetry task. `storage` persists step counts on change.
    pub fn spawn_telemetry(
        self: &Arc<Self>,
        settings: Arc<SettingsStore>,
        storage: Option<ConfigStorage>,
    ) -> tokio::task::JoinHandle<()> {
        let motion = self.clone();
        tokio::spawn(async move { motion.telemetry_loop(settings, storage).await })
    }

    async fn telemetry_loop(self: Arc<Self>, settings: Arc<SettingsStore>, storage: Option<ConfigStorage>) {
        let mut last_saved = Some(self.positions_steps());
        let mut seen_completions = self.completed_moves.load(Ordering::SeqCst);

        loop {
            let period = if self.is_moving() {
                self.config.tick_moving
            } else {
                self.config.tick_idle
            };
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.activity.notified() => {}
            }

            self.events.publish(ScopeEvent::MotorPositions(self.tick()));

            let steps = self.positions_steps();
            if last_saved != Some(steps) {
                if let Some(storage) = storage.clone() {
                    let positions = StoredMotorPositions::from_steps(steps);
                    let saved = tokio::task::spawn_blocking(move || {
                        storage.save_motor_positions(&positions)
                    })
                    .await;
                    match saved {
                        Ok(Ok(_)) => last_saved = Some(steps),
                        Ok(Err(e)) => tracing::warn!("Failed to save motor positions: {e}"),
                        Err(e) => tracing::warn!("Motor position save task failed: {e}"),
                    }
                } else {
                    last_saved = Some(steps);
                }
            }

            let completions = self.completed_moves.load(Ordering::SeqCst);
            if completions != seen_completions && !self.is_moving() {
                seen_completions = completions;
                tokio::spawn(reconcile_after_move(self.clone(), settings.clone()));
            }
        }
    }

    /// Stop every worker thread and wait for them to exit.
    pub fn shutdown(&self) {
        for handle in &self.axes {
            let _ = handle.tx.send(AxisCommand::Shutdown);
        }
        for handle in &self.axes {
            if let Some(thread) = handle.thread.lock().unwrap().take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for MotionController {
    fn drop(&mut self) {
        for handle in &self.axes {
            let _ = handle.tx.send(AxisCommand::Shutdown);
        }
    }
}

async fn reconcile_after_move(motion: Arc<MotionController>, settings: Arc<SettingsStore>) {
    let edits = motion.target_edits.load(Ordering::SeqCst);
    tokio::time::sleep(motion.config.reconcile_delay).await;
    if motion.target_edits.load(Ordering::SeqCst) != edits || motion.is_moving() {
        return;
    }
    let positions = motion.positions_mm().map(round_mm);
    tracing::debug!("Reconciling targets to {positions:?}");
    settings.reconcile_targets(positions).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use shared::devices::simulated::{SimulatedFaults, SimulatedStage, SimulatedStepper};
    use shared_wasm::InstrumentSettings;

    fn fast_config(step_interval: Duration) -> MotionConfig {
        MotionConfig {
            step_interval,
            tick_moving: Duration::from_millis(20),
            tick_idle: Duration::from_millis(50),
            reconcile_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn start(
        stage: &Arc<SimulatedStage>,
        step_interval: Duration,
    ) -> (Arc<MotionController>, Arc<EventBroadcaster>) {
        let events = Arc::new(EventBroadcaster::new(256));
        let motors = Axis::ALL.map(|axis| {
            Box::new(SimulatedStepper::new(axis, stage.clone(), Duration::ZERO))
                as Box<dyn StepperMotor>
        });
        let motion = MotionController::start(
            motors,
            StoredMotorPositions::default(),
            fast_config(step_interval),
            events.clone(),
        )
        .unwrap();
        (motion, events)
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, _events) = start(&stage, Duration::ZERO);

        let err = motion.move_to(Axis::Z, 50.0).unwrap_err();
        assert!(matches!(err, MotionError::InvalidRange { axis: Axis::Z, .. }));
        assert!(!motion.is_moving());
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_relative_move_reaches_target() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, _events) = start(&stage, Duration::ZERO);

        let target = motion.move_relative(Axis::Z, 50.0).unwrap();
        assert_abs_diff_eq!(target, 0.05);
        motion.wait_idle(Axis::Z, Duration::from_secs(5)).await.unwrap();

        assert_eq!(stage.position_steps(Axis::Z), 51);
        assert_eq!(round_mm(motion.position(Axis::Z).current_mm), 0.05);
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_stop_halts_without_drift() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, events) = start(&stage, Duration::from_millis(1));
        let mut rx = events.subscribe();

        motion.move_to(Axis::X, 2.0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        motion.stop(None).await;

        assert!(!motion.is_moving());
        let stopped_at = stage.position_steps(Axis::X);
        assert!(stopped_at > 0 && stopped_at < 2048);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stage.position_steps(Axis::X), stopped_at);
        assert_eq!(motion.position(Axis::X).target_mm, steps_to_mm(stopped_at));

        let mut saw_stop = false;
        while let Ok(event) = rx.try_recv() {
            if let ScopeEvent::MoveStatus(status) = event {
                assert!(!status.status);
                assert_eq!(status.message, "Moving stopped");
                saw_stop = true;
            }
        }
        assert!(saw_stop);
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_safe() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, _events) = start(&stage, Duration::ZERO);
        motion.stop(Some(Axis::Y)).await;
        assert!(!motion.is_moving());
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, _events) = start(&stage, Duration::from_micros(100));

        motion.move_to(Axis::Y, 1.0).unwrap();
        motion.move_to(Axis::Y, 0.25).unwrap();
        motion.wait_idle(Axis::Y, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stage.position_steps(Axis::Y), 256);
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_device_failure_aborts_move() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, _events) = start(&stage, Duration::ZERO);
        SimulatedFaults::set(&stage.faults.motor, true);

        let result = motion
            .move_and_wait(Axis::X, 1.0, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(MotionError::Device { axis: Axis::X, .. })));
        assert!(!motion.is_moving());
        motion.shutdown();
    }

    #[tokio::test]
    async fn test_targets_reconcile_after_move() {
        let stage = Arc::new(SimulatedStage::default());
        let (motion, events) = start(&stage, Duration::ZERO);
        let settings = Arc::new(SettingsStore::new(
            InstrumentSettings::default(),
            events.clone(),
        ));
        let mut rx = events.subscribe();
        let telemetry = motion.spawn_telemetry(settings.clone(), None);

        motion.move_relative(Axis::Z, 50.0).unwrap();

        let update = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(ScopeEvent::TargetPositionsUpdate(t)) = rx.recv().await {
                    return t;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(update.z_target, 0.05);
        assert_eq!(settings.snapshot().await.z_target, 0.05);
        telemetry.abort();
        motion.shutdown();
    }
}
