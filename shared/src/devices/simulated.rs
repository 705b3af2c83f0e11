//! Simulated stage, steppers and LED driver.
//!
//! All simulated devices share one [`SimulatedStage`] so the simulated
//! camera sees the stage move and the illumination change.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared_wasm::{Axis, LedChannel, STEPS_PER_MM};

use super::{x_mm_to_voltage, DeviceError, DeviceResult, LedDriver, StepDirection, StepperMotor};

/// Switches for injecting device failures in tests.
#[derive(Debug, Default)]
pub struct SimulatedFaults {
    /// Camera exposure/gain/white balance changes fail
    pub camera_settings: AtomicBool,
    /// Camera streams fail immediately
    pub camera_stream: AtomicBool,
    /// Motor steps fail
    pub motor: AtomicBool,
    /// LED level changes fail
    pub led: AtomicBool,
}

impl SimulatedFaults {
    pub fn set(flag: &AtomicBool, failing: bool) {
        flag.store(failing, Ordering::SeqCst);
    }

    pub fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

/// Physical state of the simulated microscope.
#[derive(Debug)]
pub struct SimulatedStage {
    /// Physical position of each axis in steps
    positions: [AtomicI64; 3],
    /// LED levels as f64 bits, indexed by channel
    led_levels: [AtomicU64; 2],
    /// Z position (steps) at which the specimen is in focus
    focal_plane_steps: i64,
    pub faults: SimulatedFaults,
}

impl SimulatedStage {
    pub fn new(focal_plane_mm: f64) -> Self {
        Self {
            positions: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
            led_levels: [AtomicU64::new(50f64.to_bits()), AtomicU64::new(0f64.to_bits())],
            focal_plane_steps: (focal_plane_mm * STEPS_PER_MM).round() as i64,
            faults: SimulatedFaults::default(),
        }
    }

    pub fn position_steps(&self, axis: Axis) -> i64 {
        self.positions[axis.index()].load(Ordering::SeqCst)
    }

    pub fn position_mm(&self, axis: Axis) -> f64 {
        self.position_steps(axis) as f64 / STEPS_PER_MM
    }

    /// Place an axis without stepping, e.g. to match restored controller state.
    pub fn set_position_steps(&self, axis: Axis, steps: i64) {
        self.positions[axis.index()].store(steps, Ordering::SeqCst);
    }

    fn advance(&self, axis: Axis, delta: i64) {
        self.positions[axis.index()].fetch_add(delta, Ordering::SeqCst);
    }

    pub fn led_level(&self, channel: LedChannel) -> f64 {
        f64::from_bits(self.led_levels[channel.index()].load(Ordering::SeqCst))
    }

    fn store_led_level(&self, channel: LedChannel, percent: f64) {
        self.led_levels[channel.index()].store(percent.to_bits(), Ordering::SeqCst);
    }

    /// Distance of the Z axis from the focal plane, in mm.
    pub fn defocus_mm(&self) -> f64 {
        (self.position_steps(Axis::Z) - self.focal_plane_steps) as f64 / STEPS_PER_MM
    }

    pub fn focal_plane_mm(&self) -> f64 {
        self.focal_plane_steps as f64 / STEPS_PER_MM
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Stepper driving one axis of a [`SimulatedStage`].
pub struct SimulatedStepper {
    axis: Axis,
    stage: Arc<SimulatedStage>,
    step_delay: Duration,
}

impl SimulatedStepper {
    pub fn new(axis: Axis, stage: Arc<SimulatedStage>, step_delay: Duration) -> Self {
        Self {
            axis,
            stage,
            step_delay,
        }
    }
}

impl StepperMotor for SimulatedStepper {
    fn axis(&self) -> Axis {
        self.axis
    }

    fn step(&mut self, direction: StepDirection) -> DeviceResult<()> {
        if SimulatedFaults::is_set(&self.stage.faults.motor) {
            return Err(DeviceError::CommandFailed(format!(
                "{} driver not responding",
                self.axis
            )));
        }
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        self.stage.advance(self.axis, direction.delta());
        Ok(())
    }

    fn halt(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn read_voltage(&mut self) -> DeviceResult<f64> {
        let mm = self.stage.position_mm(self.axis);
        let volts = match self.axis {
            Axis::X => x_mm_to_voltage(mm),
            // Linear hall sensors centred at mid travel
            Axis::Y => 1.6 + 0.05 * mm,
            Axis::Z => 1.4 + 0.2 * mm,
        };
        Ok((volts * 1e4).round() / 1e4)
    }
}

/// LED driver writing into a [`SimulatedStage`].
pub struct SimulatedLed {
    stage: Arc<SimulatedStage>,
}

impl SimulatedLed {
    pub fn new(stage: Arc<SimulatedStage>) -> Self {
        Self { stage }
    }
}

impl LedDriver for SimulatedLed {
    fn set_level(&mut self, channel: LedChannel, percent: f64) -> DeviceResult<()> {
        if SimulatedFaults::is_set(&self.stage.faults.led) {
            return Err(DeviceError::CommandFailed(format!(
                "{channel} LED driver not responding"
            )));
        }
        if !(0.0..=100.0).contains(&percent) {
            return Err(DeviceError::CommandFailed(format!(
                "LED level {percent} outside 0-100%"
            )));
        }
        self.stage.store_led_level(channel, percent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::x_voltage_to_mm;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_stepper_moves_stage() {
        let stage = Arc::new(SimulatedStage::new(0.5));
        let mut z = SimulatedStepper::new(Axis::Z, stage.clone(), Duration::ZERO);
        for _ in 0..512 {
            z.step(StepDirection::Forward).unwrap();
        }
        assert_eq!(stage.position_steps(Axis::Z), 512);
        assert_abs_diff_eq!(stage.defocus_mm(), 0.0);
    }

    #[test]
    fn test_x_voltage_tracks_position() {
        let stage = Arc::new(SimulatedStage::default());
        stage.set_position_steps(Axis::X, 2048);
        let mut x = SimulatedStepper::new(Axis::X, stage, Duration::ZERO);
        let volts = x.read_voltage().unwrap();
        assert_abs_diff_eq!(x_voltage_to_mm(volts), 2.0, epsilon = 0.01);
    }

    #[test]
    fn test_injected_faults() {
        let stage = Arc::new(SimulatedStage::default());
        let mut led = SimulatedLed::new(stage.clone());
        led.set_level(LedChannel::Transmitted, 30.0).unwrap();
        assert_eq!(stage.led_level(LedChannel::Transmitted), 30.0);

        SimulatedFaults::set(&stage.faults.led, true);
        assert!(led.set_level(LedChannel::Transmitted, 40.0).is_err());
        assert_eq!(stage.led_level(LedChannel::Transmitted), 30.0);

        SimulatedFaults::set(&stage.faults.motor, true);
        let mut y = SimulatedStepper::new(Axis::Y, stage, Duration::ZERO);
        assert!(y.step(StepDirection::Forward).is_err());
    }

    #[test]
    fn test_led_rejects_out_of_range() {
        let stage = Arc::new(SimulatedStage::default());
        let mut led = SimulatedLed::new(stage);
        assert!(led.set_level(LedChannel::Reflected, 120.0).is_err());
    }
}
