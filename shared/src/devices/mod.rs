//! Motor and illumination device interfaces.
//!
//! Each stage axis is driven by a stepper motor with an analog position
//! sensor. Position bookkeeping (step counting) belongs to the motion
//! controller, the drivers only execute single steps.

pub mod simulated;

use shared_wasm::{Axis, LedChannel};

/// Error type for motor and LED drivers
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// The device rejected or failed to execute a command
    #[error("Device command failed: {0}")]
    CommandFailed(String),
    /// Communication with the device failed
    #[error("Hardware error: {0}")]
    HardwareError(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Direction of a single motor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

impl StepDirection {
    /// Direction that moves from `from` towards `to`, or None when equal.
    pub fn towards(from: i64, to: i64) -> Option<Self> {
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => Some(StepDirection::Forward),
            std::cmp::Ordering::Less => Some(StepDirection::Backward),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn delta(self) -> i64 {
        match self {
            StepDirection::Forward => 1,
            StepDirection::Backward => -1,
        }
    }
}

/// One stage axis.
pub trait StepperMotor: Send {
    fn axis(&self) -> Axis;

    /// Execute one full step. Blocks for the step duration.
    fn step(&mut self, direction: StepDirection) -> DeviceResult<()>;

    /// De-energize the coils.
    fn halt(&mut self) -> DeviceResult<()>;

    /// Raw reading of the axis position sensor, in volts.
    fn read_voltage(&mut self) -> DeviceResult<f64>;
}

/// Illumination driver with one PWM output per channel.
pub trait LedDriver: Send {
    /// Set a channel to `percent` (0-100) of full power.
    fn set_level(&mut self, channel: LedChannel, percent: f64) -> DeviceResult<()>;
}

/// Calibrated arctan model mapping the X axis sensor voltage to millimetres.
pub const X_SENSOR_MODEL: [f64; 4] = [11.868, 2.776, -4.678, 0.282];

/// Position estimate in mm from an X sensor voltage: `A·atan(B·v + C) + D`.
pub fn x_voltage_to_mm(voltage: f64) -> f64 {
    let [a, b, c, d] = X_SENSOR_MODEL;
    a * (b * voltage + c).atan() + d
}

/// Inverse of [`x_voltage_to_mm`], clamped to the model's valid range.
pub fn x_mm_to_voltage(mm: f64) -> f64 {
    let [a, b, c, d] = X_SENSOR_MODEL;
    let angle = ((mm - d) / a).clamp(-1.5, 1.5);
    (angle.tan() - c) / b
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_x_sensor_model_roundtrip() {
        for mm in [-5.0, -1.0, 0.0, 0.5, 3.0, 8.0] {
            assert_relative_eq!(x_voltage_to_mm(x_mm_to_voltage(mm)), mm, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_step_direction_towards() {
        assert_eq!(StepDirection::towards(0, 5), Some(StepDirection::Forward));
        assert_eq!(StepDirection::towards(5, 0), Some(StepDirection::Backward));
        assert_eq!(StepDirection::towards(3, 3), None);
        assert_eq!(StepDirection::Backward.delta(), -1);
    }
}
