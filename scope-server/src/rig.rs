//! Simulated microscope wired into [`Devices`].

use shared::camera_interface::simulated::{SimulatedCamera, Specimen};
use shared::camera_interface::CameraConfig;
use shared::config_storage::StoredMotorPositions;
use shared::devices::simulated::{SimulatedLed, SimulatedStage, SimulatedStepper};
use shared_wasm::Axis;
use std::sync::Arc;
use std::time::Duration;

use crate::connectivity::SimulatedWifi;
use crate::state::Devices;

#[derive(Debug, Clone)]
pub struct RigConfig {
    pub main_width: u32,
    pub main_height: u32,
    pub aux_width: u32,
    pub aux_height: u32,
    pub frame_rate: f64,
    pub exposure: Duration,
    /// Z position of best focus
    pub focal_plane_mm: f64,
    /// Time per motor step
    pub step_delay: Duration,
    /// Sample under the main camera
    pub specimen: Specimen,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            main_width: 640,
            main_height: 480,
            aux_width: 320,
            aux_height: 240,
            frame_rate: 15.0,
            exposure: Duration::from_millis(10),
            focal_plane_mm: 0.05,
            step_delay: Duration::from_micros(50),
            specimen: Specimen::Cells { seed: 42 },
        }
    }
}

impl RigConfig {
    /// Small, fast rig for tests.
    pub fn small() -> Self {
        Self {
            main_width: 96,
            main_height: 72,
            aux_width: 64,
            aux_height: 48,
            frame_rate: 60.0,
            exposure: Duration::from_millis(5),
            step_delay: Duration::ZERO,
            ..Default::default()
        }
    }
}

/// Simulated devices sharing one stage.
pub struct SimulatedRig {
    /// Physical state, also used to inject faults
    pub stage: Arc<SimulatedStage>,
    pub devices: Devices,
}

impl SimulatedRig {
    /// Build the rig with the stage at `positions`.
    pub fn new(config: &RigConfig, positions: StoredMotorPositions) -> Self {
        let stage = Arc::new(SimulatedStage::new(config.focal_plane_mm));
        for axis in Axis::ALL {
            stage.set_position_steps(axis, positions.get(axis));
        }

        let camera_config = |width, height| CameraConfig {
            width,
            height,
            exposure: config.exposure,
            frame_rate: config.frame_rate,
        };
        let main_camera = SimulatedCamera::new(
            "Microscope (simulated)",
            camera_config(config.main_width, config.main_height),
            stage.clone(),
            config.specimen,
        );
        let aux_camera = SimulatedCamera::new(
            "Overview (simulated)",
            camera_config(config.aux_width, config.aux_height),
            stage.clone(),
            Specimen::Cells { seed: 7 },
        )
        .with_pixel_size(5.0)
        .with_fixed_focus();

        let stepper = |axis| -> Box<dyn shared::devices::StepperMotor> {
            Box::new(SimulatedStepper::new(axis, stage.clone(), config.step_delay))
        };
        let devices = Devices {
            main_camera: Box::new(main_camera),
            aux_camera: Box::new(aux_camera),
            motors: [stepper(Axis::X), stepper(Axis::Y), stepper(Axis::Z)],
            leds: Box::new(SimulatedLed::new(stage.clone())),
            wifi: Arc::new(SimulatedWifi::lab()),
        };
        Self { stage, devices }
    }
}
