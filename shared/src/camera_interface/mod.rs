//! Camera abstraction layer.
//!
//! Provides a unified interface for the microscope and overview cameras so
//! the capture pipelines can run against real hardware or the simulator.

pub mod simulated;

use chrono::{DateTime, Local};
use image::RgbImage;
use std::time::Duration;

/// Error type for camera operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CameraError {
    /// Hardware communication error
    #[error("Hardware error: {0}")]
    HardwareError(String),
    /// Frame capture error
    #[error("Capture error: {0}")]
    CaptureError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Metadata returned with each frame
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number, starting at 1 for each camera
    pub frame_number: u64,
    /// Exposure duration
    pub exposure: Duration,
    /// Analog gain at capture time
    pub gain: f64,
    /// Wall-clock capture time
    pub timestamp: DateTime<Local>,
}

/// Configuration for camera initialization
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Exposure duration
    pub exposure: Duration,
    /// Nominal streaming rate in frames per second
    pub frame_rate: f64,
}

impl CameraConfig {
    /// Minimum time between frames, whichever of exposure and frame rate is slower.
    pub fn frame_interval(&self) -> Duration {
        let rate_interval = if self.frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.frame_rate)
        } else {
            Duration::ZERO
        };
        rate_interval.max(self.exposure)
    }
}

/// Trait for unified camera interface
pub trait CameraInterface: Send {
    /// Capture a single frame
    ///
    /// This is not a high-performance interface. For continuous capture,
    /// use `stream()` instead.
    fn capture_frame(&mut self) -> CameraResult<(RgbImage, FrameMetadata)> {
        let mut result: Option<(RgbImage, FrameMetadata)> = None;

        self.stream(&mut |frame, metadata| {
            result = Some((frame.clone(), metadata.clone()));
            false
        })?;

        result.ok_or_else(|| CameraError::CaptureError("No frame captured".to_string()))
    }

    /// Set exposure time
    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()>;

    /// Get current exposure duration
    fn get_exposure(&self) -> Duration;

    /// Set analog gain
    fn set_gain(&mut self, gain: f64) -> CameraResult<()>;

    /// Get current analog gain
    fn get_gain(&self) -> f64;

    /// Set red and blue channel gains relative to green
    fn set_white_balance(&mut self, r_gain: f64, b_gain: f64) -> CameraResult<()>;

    /// Get camera configuration
    fn get_config(&self) -> &CameraConfig;

    /// Check if camera is ready to capture
    fn is_ready(&self) -> bool;

    /// Get camera name/identifier
    fn name(&self) -> &str;

    /// Get camera serial number
    fn get_serial(&self) -> String;

    /// Stream frames continuously
    ///
    /// `callback` is called for each frame and returns true to continue,
    /// false to stop. The callback must return quickly; clone the frame and
    /// hand it to another thread for anything slow.
    ///
    /// # Returns
    /// * `Ok(())` when streaming completes normally (callback returned false)
    /// * `Err(CameraError)` if capture fails
    fn stream(
        &mut self,
        callback: &mut dyn FnMut(&RgbImage, &FrameMetadata) -> bool,
    ) -> CameraResult<()>;
}

impl CameraInterface for Box<dyn CameraInterface> {
    fn capture_frame(&mut self) -> CameraResult<(RgbImage, FrameMetadata)> {
        (**self).capture_frame()
    }

    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()> {
        (**self).set_exposure(exposure)
    }

    fn get_exposure(&self) -> Duration {
        (**self).get_exposure()
    }

    fn set_gain(&mut self, gain: f64) -> CameraResult<()> {
        (**self).set_gain(gain)
    }

    fn get_gain(&self) -> f64 {
        (**self).get_gain()
    }

    fn set_white_balance(&mut self, r_gain: f64, b_gain: f64) -> CameraResult<()> {
        (**self).set_white_balance(r_gain, b_gain)
    }

    fn get_config(&self) -> &CameraConfig {
        (**self).get_config()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_serial(&self) -> String {
        (**self).get_serial()
    }

    fn stream(
        &mut self,
        callback: &mut dyn FnMut(&RgbImage, &FrameMetadata) -> bool,
    ) -> CameraResult<()> {
        (**self).stream(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval_uses_slower_of_rate_and_exposure() {
        let mut config = CameraConfig {
            width: 64,
            height: 48,
            exposure: Duration::from_millis(10),
            frame_rate: 20.0,
        };
        assert_eq!(config.frame_interval(), Duration::from_millis(50));

        config.exposure = Duration::from_millis(200);
        assert_eq!(config.frame_interval(), Duration::from_millis(200));
    }
}
