//! Simulated microscope camera.
//!
//! Renders a synthetic specimen (stained cells or a calibration dot grid)
//! through the state of a [`SimulatedStage`]: X/Y pan the field of view,
//! distance from the focal plane blurs the image and the LED levels set the
//! brightness, saturating at full scale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use image::{Rgb, RgbImage};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared_wasm::{Axis, LedChannel};

use super::{CameraConfig, CameraError, CameraInterface, CameraResult, FrameMetadata};
use crate::devices::simulated::{SimulatedFaults, SimulatedStage};

/// Synthetic sample under the objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Specimen {
    /// Randomly placed round cells, radius 12-30 px
    Cells { seed: u64 },
    /// Square grid of dark dots
    DotGrid { pitch_px: f64 },
}

/// Gaussian blur sigma (px) per micrometre of defocus.
const BLUR_PER_UM: f64 = 0.08;
const MAX_BLUR_SIGMA: f64 = 15.0;

pub struct SimulatedCamera {
    name: String,
    serial: String,
    config: CameraConfig,
    stage: Arc<SimulatedStage>,
    /// Specimen transmittance (0-1), wraps at the edges
    world: Array2<f32>,
    um_per_px: f64,
    fixed_focus: bool,
    gain: f64,
    r_gain: f64,
    b_gain: f64,
    frame_count: u64,
    rng: StdRng,
}

impl SimulatedCamera {
    pub fn new(
        name: &str,
        config: CameraConfig,
        stage: Arc<SimulatedStage>,
        specimen: Specimen,
    ) -> Self {
        let world = render_specimen(specimen, config.width as usize, config.height as usize);
        let seed = match specimen {
            Specimen::Cells { seed } => seed,
            Specimen::DotGrid { .. } => 7,
        };
        Self {
            name: name.to_string(),
            serial: format!("SIM{seed:05}"),
            config,
            stage,
            world,
            um_per_px: crate::image_proc::DEFAULT_PIXEL_SIZE_UM,
            fixed_focus: false,
            gain: 1.0,
            r_gain: 1.0,
            b_gain: 1.0,
            frame_count: 0,
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    /// Sample-plane size of one pixel.
    pub fn with_pixel_size(mut self, um_per_px: f64) -> Self {
        self.um_per_px = um_per_px;
        self
    }

    /// Ignore the Z axis (overview camera with its own fixed optics).
    pub fn with_fixed_focus(mut self) -> Self {
        self.fixed_focus = true;
        self
    }

    pub fn pixel_size_um(&self) -> f64 {
        self.um_per_px
    }

    fn illumination(&self) -> f64 {
        let led = self.stage.led_level(LedChannel::Transmitted)
            + 0.6 * self.stage.led_level(LedChannel::Reflected);
        let exposure_ms = self.config.exposure.as_secs_f64() * 1000.0;
        1.5 * (led / 50.0) * (exposure_ms / 10.0) * self.gain
    }

    fn render(&mut self) -> RgbImage {
        let (world_h, world_w) = self.world.dim();
        let width = self.config.width;
        let height = self.config.height;

        let px_per_mm = 1000.0 / self.um_per_px;
        let offset_x = (self.stage.position_mm(Axis::X) * px_per_mm).round() as i64;
        let offset_y = (self.stage.position_mm(Axis::Y) * px_per_mm).round() as i64;

        let level = self.illumination();
        let gains = [self.r_gain, 1.0, self.b_gain];

        let mut frame = RgbImage::new(width, height);
        for (x, y, pixel) in frame.enumerate_pixels_mut() {
            let wx = (offset_x + x as i64).rem_euclid(world_w as i64) as usize;
            let wy = (offset_y + y as i64).rem_euclid(world_h as i64) as usize;
            let value = self.world[[wy, wx]] as f64 * level * 255.0;
            *pixel = Rgb([
                (value * gains[0]).clamp(0.0, 255.0) as u8,
                (value * gains[1]).clamp(0.0, 255.0) as u8,
                (value * gains[2]).clamp(0.0, 255.0) as u8,
            ]);
        }

        if !self.fixed_focus {
            let sigma = (self.stage.defocus_mm().abs() * 1000.0 * BLUR_PER_UM).min(MAX_BLUR_SIGMA);
            if sigma > 0.3 {
                frame = imageproc::filter::gaussian_blur_f32(&frame, sigma as f32);
            }
        }

        for pixel in frame.pixels_mut() {
            let noise: i16 = self.rng.random_range(-2..=2);
            for channel in pixel.0.iter_mut() {
                *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
            }
        }

        frame
    }

    fn check_settings_fault(&self) -> CameraResult<()> {
        if SimulatedFaults::is_set(&self.stage.faults.camera_settings) {
            return Err(CameraError::HardwareError(format!(
                "{} not responding to control requests",
                self.name
            )));
        }
        Ok(())
    }
}

impl CameraInterface for SimulatedCamera {
    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()> {
        self.check_settings_fault()?;
        if exposure.is_zero() || exposure > Duration::from_secs(10) {
            return Err(CameraError::ConfigError(format!(
                "exposure {:.3} ms outside supported range",
                exposure.as_secs_f64() * 1000.0
            )));
        }
        self.config.exposure = exposure;
        Ok(())
    }

    fn get_exposure(&self) -> Duration {
        self.config.exposure
    }

    fn set_gain(&mut self, gain: f64) -> CameraResult<()> {
        self.check_settings_fault()?;
        if !(0.0..=64.0).contains(&gain) {
            return Err(CameraError::ConfigError(format!(
                "gain {gain} outside 0-64"
            )));
        }
        self.gain = gain;
        Ok(())
    }

    fn get_gain(&self) -> f64 {
        self.gain
    }

    fn set_white_balance(&mut self, r_gain: f64, b_gain: f64) -> CameraResult<()> {
        self.check_settings_fault()?;
        if !(0.0..=8.0).contains(&r_gain) || !(0.0..=8.0).contains(&b_gain) {
            return Err(CameraError::ConfigError(format!(
                "white balance ({r_gain}, {b_gain}) outside 0-8"
            )));
        }
        self.r_gain = r_gain;
        self.b_gain = b_gain;
        Ok(())
    }

    fn get_config(&self) -> &CameraConfig {
        &self.config
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get_serial(&self) -> String {
        self.serial.clone()
    }

    fn stream(
        &mut self,
        callback: &mut dyn FnMut(&RgbImage, &FrameMetadata) -> bool,
    ) -> CameraResult<()> {
        loop {
            if SimulatedFaults::is_set(&self.stage.faults.camera_stream) {
                return Err(CameraError::CaptureError(format!(
                    "{}: sensor readout timed out",
                    self.name
                )));
            }

            let start = Instant::now();
            let frame = self.render();
            self.frame_count += 1;
            let metadata = FrameMetadata {
                frame_number: self.frame_count,
                exposure: self.config.exposure,
                gain: self.gain,
                timestamp: Local::now(),
            };

            if !callback(&frame, &metadata) {
                return Ok(());
            }

            let remaining = self.config.frame_interval().saturating_sub(start.elapsed());
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }
    }
}

/// Build the specimen transmittance map, three frames wide and high.
fn render_specimen(specimen: Specimen, width: usize, height: usize) -> Array2<f32> {
    match specimen {
        Specimen::Cells { seed } => render_cells(seed, width * 3, height * 3),
        Specimen::DotGrid { pitch_px } => {
            let pitch = pitch_px.max(4.0);
            // Whole number of periods so the grid wraps seamlessly
            let w = ((width * 3) as f64 / pitch).ceil() * pitch;
            let h = ((height * 3) as f64 / pitch).ceil() * pitch;
            render_dot_grid(pitch, w.round() as usize, h.round() as usize)
        }
    }
}

fn render_cells(seed: u64, width: usize, height: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut world = Array2::from_shape_fn((height, width), |_| 0.85 + 0.05 * rng.random::<f32>());

    let count = (width * height) / (90 * 90);
    for _ in 0..count {
        let cx = rng.random_range(0..width) as i64;
        let cy = rng.random_range(0..height) as i64;
        let radius: f64 = rng.random_range(12.0..30.0);
        let r = radius.ceil() as i64;
        for dy in -r..=r {
            for dx in -r..=r {
                let d = ((dx * dx + dy * dy) as f64).sqrt();
                if d > radius {
                    continue;
                }
                let value = if d > radius - 2.0 {
                    0.2
                } else if d < radius * 0.3 {
                    0.25
                } else {
                    0.35 + 0.1 * (d / radius)
                } as f32;
                let x = (cx + dx).rem_euclid(width as i64) as usize;
                let y = (cy + dy).rem_euclid(height as i64) as usize;
                let cell = &mut world[[y, x]];
                *cell = cell.min(value);
            }
        }
    }
    world
}

fn render_dot_grid(pitch: f64, width: usize, height: usize) -> Array2<f32> {
    let radius = pitch / 6.0;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let fx = (x as f64 + 0.5) % pitch - pitch / 2.0;
        let fy = (y as f64 + 0.5) % pitch - pitch / 2.0;
        if (fx * fx + fy * fy).sqrt() <= radius {
            0.15
        } else {
            0.9
        }
    })
}
