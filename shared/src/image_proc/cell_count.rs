//! Cell detection for brightfield images.
//!
//! Cells are darker than the background: the frame is smoothed, split with
//! an Otsu threshold and the dark connected components become cells. Each
//! cell is reported as the circle with the same area.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::debug;

use super::DEFAULT_PIXEL_SIZE_UM;

/// Frames with a smaller grey-level range are treated as empty.
const MIN_CONTRAST: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCountParams {
    /// µm per pixel
    pub pixel_size_um: f64,
    pub min_radius_px: f64,
    pub max_radius_px: f64,
    pub blur_sigma: f32,
}

impl Default for CellCountParams {
    fn default() -> Self {
        Self {
            pixel_size_um: DEFAULT_PIXEL_SIZE_UM,
            min_radius_px: 10.0,
            max_radius_px: 100.0,
            blur_sigma: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedCell {
    pub x: f64,
    pub y: f64,
    pub radius_px: f64,
}

pub struct CellCountResult {
    pub annotated: RgbImage,
    pub cells: Vec<DetectedCell>,
    /// Mean cell diameter in µm, 0 when nothing was found
    pub avg_diameter_um: f64,
}

impl CellCountResult {
    pub fn count(&self) -> usize {
        self.cells.len()
    }
}

/// Dark blobs of `gray` as `(sum_x, sum_y, area)` per component label.
pub(crate) fn dark_components(gray: &GrayImage, blur_sigma: f32) -> Vec<(f64, f64, f64)> {
    let smoothed = if blur_sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(gray, blur_sigma)
    } else {
        gray.clone()
    };
    let (lo, hi) = smoothed
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if hi.saturating_sub(lo) < MIN_CONTRAST {
        return Vec::new();
    }
    let level = otsu_level(&smoothed);
    let mask = GrayImage::from_fn(smoothed.width(), smoothed.height(), |x, y| {
        if smoothed.get_pixel(x, y).0[0] <= level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let mut stats: Vec<(f64, f64, f64)> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if stats.len() < label {
            stats.resize(label, (0.0, 0.0, 0.0));
        }
        let entry = &mut stats[label - 1];
        entry.0 += x as f64;
        entry.1 += y as f64;
        entry.2 += 1.0;
    }
    stats.retain(|s| s.2 > 0.0);
    stats
}

/// Detect and annotate cells in `image`.
pub fn count_cells(image: &RgbImage, params: &CellCountParams) -> CellCountResult {
    let gray = image::imageops::grayscale(image);
    let components = dark_components(&gray, params.blur_sigma);

    let cells: Vec<DetectedCell> = components
        .into_iter()
        .filter_map(|(sx, sy, area)| {
            let radius_px = (area / std::f64::consts::PI).sqrt();
            (params.min_radius_px..=params.max_radius_px)
                .contains(&radius_px)
                .then(|| DetectedCell {
                    x: sx / area,
                    y: sy / area,
                    radius_px,
                })
        })
        .collect();
    debug!("Detected {} cells", cells.len());

    let mut annotated = image.clone();
    for cell in &cells {
        let center = (cell.x.round() as i32, cell.y.round() as i32);
        let r = cell.radius_px.round() as i32;
        draw_hollow_circle_mut(&mut annotated, center, r, Rgb([0, 255, 0]));
        draw_hollow_circle_mut(&mut annotated, center, r + 1, Rgb([0, 255, 0]));
        draw_filled_circle_mut(&mut annotated, center, 2, Rgb([255, 0, 0]));
    }

    let avg_diameter_um = if cells.is_empty() {
        0.0
    } else {
        cells
            .iter()
            .map(|c| 2.0 * c.radius_px * params.pixel_size_um)
            .sum::<f64>()
            / cells.len() as f64
    };

    CellCountResult {
        annotated,
        cells,
        avg_diameter_um,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn disc_image(centers: &[(i32, i32, i32)]) -> RgbImage {
        let mut img = RgbImage::from_pixel(320, 240, Rgb([230, 230, 230]));
        for &(x, y, r) in centers {
            draw_filled_circle_mut(&mut img, (x, y), r, Rgb([60, 60, 60]));
        }
        img
    }

    #[test]
    fn test_counts_discs() {
        let img = disc_image(&[(60, 60, 20), (200, 80, 20), (120, 180, 20)]);
        let result = count_cells(&img, &CellCountParams::default());
        assert_eq!(result.count(), 3);
        // 40 px diameter at 0.09 µm/px
        assert_relative_eq!(result.avg_diameter_um, 3.6, epsilon = 0.2);
    }

    #[test]
    fn test_radius_window_excludes_specks() {
        let img = disc_image(&[(60, 60, 20), (200, 80, 4)]);
        let result = count_cells(&img, &CellCountParams::default());
        assert_eq!(result.count(), 1);
    }

    #[test]
    fn test_empty_field() {
        let img = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        let result = count_cells(&img, &CellCountParams::default());
        assert_eq!(result.count(), 0);
        assert_eq!(result.avg_diameter_um, 0.0);
    }

    #[test]
    fn test_annotation_marks_cells() {
        let img = disc_image(&[(100, 100, 25)]);
        let result = count_cells(&img, &CellCountParams::default());
        assert_eq!(result.count(), 1);
        assert_eq!(*result.annotated.get_pixel(100, 100), Rgb([255, 0, 0]));
    }
}
