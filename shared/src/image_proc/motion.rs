//! Frame-to-frame motion detection.

use image::{imageops::FilterType, GrayImage, RgbImage};

/// Working width; frames are downsampled before differencing.
const ANALYSIS_WIDTH: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    /// Grey-level difference above which a pixel counts as changed
    pub pixel_threshold: u8,
    /// Fraction of changed pixels that counts as motion
    pub ratio_threshold: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 25,
            ratio_threshold: 0.02,
        }
    }
}

/// Compares each frame with the previous one.
pub struct MotionDetector {
    config: MotionConfig,
    previous: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    fn prepare(frame: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(frame);
        if gray.width() <= ANALYSIS_WIDTH {
            return gray;
        }
        let height = (gray.height() as u64 * ANALYSIS_WIDTH as u64 / gray.width() as u64).max(1) as u32;
        image::imageops::resize(&gray, ANALYSIS_WIDTH, height, FilterType::Triangle)
    }

    /// Fraction of changed pixels since the last frame, `None` on the first
    /// frame or after a size change.
    pub fn changed_ratio(&mut self, frame: &RgbImage) -> Option<f64> {
        let current = Self::prepare(frame);
        let previous = self.previous.replace(current);
        let (previous, current) = (previous?, self.previous.as_ref()?);
        if previous.dimensions() != current.dimensions() {
            return None;
        }

        let changed = previous
            .pixels()
            .zip(current.pixels())
            .filter(|(a, b)| a.0[0].abs_diff(b.0[0]) > self.config.pixel_threshold)
            .count();
        Some(changed as f64 / current.len() as f64)
    }

    /// Motion ratio when it exceeds the configured threshold.
    pub fn detect(&mut self, frame: &RgbImage) -> Option<f64> {
        self.changed_ratio(frame)
            .filter(|&ratio| ratio > self.config.ratio_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_static_scene_has_no_motion() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let frame = crate::image_proc::test_images::textured(320, 240, 8);
        assert_eq!(detector.detect(&frame), None);
        assert_eq!(detector.detect(&frame), None);
        assert_eq!(detector.changed_ratio(&frame), Some(0.0));
    }

    #[test]
    fn test_moving_block_is_detected() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let mut frame = RgbImage::from_pixel(320, 240, Rgb([30, 30, 30]));
        detector.detect(&frame);
        for y in 60..180 {
            for x in 100..220 {
                frame.put_pixel(x, y, Rgb([220, 220, 220]));
            }
        }
        let ratio = detector.detect(&frame).unwrap();
        assert!(ratio > 0.15 && ratio < 0.25);
    }
}
