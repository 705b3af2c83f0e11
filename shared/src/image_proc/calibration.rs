//! Pixel size calibration from a dot grid target.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::cell_count::dark_components;
use super::ImageProcError;

/// Minimum number of dots for a usable measurement.
const MIN_DOTS: usize = 4;

/// Highest accepted coefficient of variation of the dot spacing.
const MAX_SPACING_CV: f64 = 0.2;

/// Persisted calibration result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelCalibration {
    /// µm per pixel
    pub pixel_size_um: f64,
    /// Measured centre-to-centre spacing of the grid in pixels
    pub spacing_px: f64,
    pub dots: usize,
}

/// Measure the pixel size from an image of a dot grid with `pitch_um` spacing.
pub fn calibrate_pixel_size(
    image: &RgbImage,
    pitch_um: f64,
) -> Result<PixelCalibration, ImageProcError> {
    let gray = image::imageops::grayscale(image);
    let components = dark_components(&gray, 1.0);
    if components.len() < MIN_DOTS {
        return Err(ImageProcError::PatternNotDetected(format!(
            "found {} dots, need at least {MIN_DOTS}",
            components.len()
        )));
    }

    // Dots clipped by the frame edge are smaller and their centroids are biased
    let mut areas: Vec<f64> = components.iter().map(|c| c.2).collect();
    areas.sort_by(|a, b| a.total_cmp(b));
    let median_area = areas[areas.len() / 2];
    let centers: Vec<(f64, f64)> = components
        .iter()
        .filter(|c| c.2 >= 0.7 * median_area && c.2 <= 1.5 * median_area)
        .map(|&(sx, sy, area)| (sx / area, sy / area))
        .collect();
    if centers.len() < MIN_DOTS {
        return Err(ImageProcError::PatternNotDetected(format!(
            "only {} complete dots",
            centers.len()
        )));
    }

    let nearest: Vec<f64> = centers
        .iter()
        .enumerate()
        .map(|(i, a)| {
            centers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, b)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt())
                .fold(f64::INFINITY, f64::min)
        })
        .collect();

    let mean = nearest.iter().sum::<f64>() / nearest.len() as f64;
    let variance = nearest.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / nearest.len() as f64;
    let cv = variance.sqrt() / mean;
    if !mean.is_finite() || mean <= 0.0 || cv > MAX_SPACING_CV {
        return Err(ImageProcError::PatternNotDetected(format!(
            "irregular dot spacing (mean {mean:.1} px, cv {cv:.2})"
        )));
    }

    let calibration = PixelCalibration {
        pixel_size_um: pitch_um / mean,
        spacing_px: mean,
        dots: centers.len(),
    };
    info!(
        "Calibrated {:.4} µm/px from {} dots at {:.2} px spacing",
        calibration.pixel_size_um, calibration.dots, calibration.spacing_px
    );
    Ok(calibration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    fn grid(pitch: i32, radius: i32) -> RgbImage {
        let mut img = RgbImage::from_pixel(240, 200, Rgb([220, 220, 220]));
        let mut y = pitch / 2;
        while y < 200 {
            let mut x = pitch / 2;
            while x < 240 {
                draw_filled_circle_mut(&mut img, (x, y), radius, Rgb([40, 40, 40]));
                x += pitch;
            }
            y += pitch;
        }
        img
    }

    #[test]
    fn test_measures_grid_spacing() {
        let img = grid(30, 5);
        // 10 µm pitch over 30 px
        let cal = calibrate_pixel_size(&img, 10.0).unwrap();
        assert_relative_eq!(cal.spacing_px, 30.0, epsilon = 0.5);
        assert_relative_eq!(cal.pixel_size_um, 10.0 / 30.0, epsilon = 0.01);
    }

    #[test]
    fn test_blank_image_fails() {
        let img = RgbImage::from_pixel(100, 100, Rgb([200, 200, 200]));
        assert!(matches!(
            calibrate_pixel_size(&img, 10.0),
            Err(ImageProcError::PatternNotDetected(_))
        ));
    }

    #[test]
    fn test_irregular_blobs_fail() {
        let mut img = RgbImage::from_pixel(240, 200, Rgb([220, 220, 220]));
        for &(x, y) in &[(20, 20), (40, 22), (200, 30), (120, 150), (30, 180)] {
            draw_filled_circle_mut(&mut img, (x, y), 5, Rgb([40, 40, 40]));
        }
        assert!(calibrate_pixel_size(&img, 10.0).is_err());
    }
}
