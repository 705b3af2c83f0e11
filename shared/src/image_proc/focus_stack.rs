//! Extended depth of field by focus stacking.
//!
//! Frames captured at different Z positions are aligned to the middle
//! frame, a local focus measure is computed per pixel, and each output
//! pixel is taken from the frame where that measure peaks. The index of
//! the winning frame becomes the depth map.

use image::{GrayImage, Luma, RgbImage};
use ndarray::Array2;
use rayon::prelude::*;
use tracing::debug;

use super::phase_correlation::phase_correlate;
use super::{check_same_size, laplacian, rgb_to_gray_array, ImageProcError};

/// Half-width of the box filter applied to the focus measure.
const FOCUS_WINDOW_RADIUS: usize = 4;

/// Pixels whose best focus measure sits below this percentile of all
/// best measures have no texture; they take the reference frame.
const FLAT_PERCENTILE: f64 = 0.10;

/// Alignments whose correlation peak is below this are ignored.
const MIN_ALIGNMENT_PEAK: f64 = 0.03;

pub struct FocusStackResult {
    pub image: RgbImage,
    /// 0 = first frame of the stack, 255 = last
    pub depth_map: GrayImage,
}

/// Translate `image` by `(dx, dy)`, replicating edge pixels.
fn shift_image(image: &RgbImage, dx: i64, dy: i64) -> RgbImage {
    if dx == 0 && dy == 0 {
        return image.clone();
    }
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let sx = (x as i64 - dx).clamp(0, width as i64 - 1) as u32;
        let sy = (y as i64 - dy).clamp(0, height as i64 - 1) as u32;
        *image.get_pixel(sx, sy)
    })
}

/// Mean over a `(2r+1)^2` window, computed from an integral image.
fn box_mean(values: &Array2<f32>, radius: usize) -> Array2<f32> {
    let (height, width) = values.dim();
    let mut integral = Array2::<f64>::zeros((height + 1, width + 1));
    for y in 0..height {
        let mut row_sum = 0.0;
        for x in 0..width {
            row_sum += values[[y, x]] as f64;
            integral[[y + 1, x + 1]] = integral[[y, x + 1]] + row_sum;
        }
    }

    Array2::from_shape_fn((height, width), |(y, x)| {
        let y0 = y.saturating_sub(radius);
        let x0 = x.saturating_sub(radius);
        let y1 = (y + radius + 1).min(height);
        let x1 = (x + radius + 1).min(width);
        let sum = integral[[y1, x1]] - integral[[y0, x1]] - integral[[y1, x0]] + integral[[y0, x0]];
        (sum / ((y1 - y0) * (x1 - x0)) as f64) as f32
    })
}

fn focus_measure(image: &RgbImage) -> Array2<f32> {
    let lap = laplacian(&rgb_to_gray_array(image)).mapv(f32::abs);
    box_mean(&lap, FOCUS_WINDOW_RADIUS)
}

/// Align each frame to the middle of the stack.
fn align_to_reference(images: &[RgbImage]) -> Result<Vec<RgbImage>, ImageProcError> {
    let reference_index = images.len() / 2;
    let reference = rgb_to_gray_array(&images[reference_index]);

    images
        .par_iter()
        .enumerate()
        .map(|(i, img)| {
            if i == reference_index {
                return Ok(img.clone());
            }
            let shift = phase_correlate(&reference, &rgb_to_gray_array(img))?;
            if shift.peak < MIN_ALIGNMENT_PEAK {
                debug!("Frame {i}: weak alignment peak {:.3}, not shifting", shift.peak);
                return Ok(img.clone());
            }
            debug!("Frame {i}: shift ({}, {})", shift.dx, shift.dy);
            Ok(shift_image(img, -shift.dx, -shift.dy))
        })
        .collect()
}

/// Merge a Z stack into one all-in-focus image plus a depth map.
pub fn focus_stack(images: &[RgbImage]) -> Result<FocusStackResult, ImageProcError> {
    if images.len() < 2 {
        return Err(ImageProcError::NotEnoughImages {
            needed: 2,
            got: images.len(),
        });
    }
    let (width, height) = check_same_size(images)?;
    let aligned = align_to_reference(images)?;
    let measures: Vec<Array2<f32>> = aligned.par_iter().map(focus_measure).collect();

    let (w, h) = (width as usize, height as usize);
    let mut best_index = Array2::<usize>::zeros((h, w));
    let mut best_value = Array2::<f32>::zeros((h, w));
    for (i, measure) in measures.iter().enumerate() {
        for ((idx, best), &value) in best_index
            .iter_mut()
            .zip(best_value.iter_mut())
            .zip(measure.iter())
        {
            if i == 0 || value > *best {
                *best = value;
                *idx = i;
            }
        }
    }

    let mut sorted: Vec<f32> = best_value.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let flat_threshold = sorted[((sorted.len() - 1) as f64 * FLAT_PERCENTILE) as usize];
    let reference_index = images.len() / 2;

    let last = (images.len() - 1) as f32;
    let mut image = RgbImage::new(width, height);
    let mut depth_map = GrayImage::new(width, height);
    for y in 0..h {
        for x in 0..w {
            let source = if best_value[[y, x]] <= flat_threshold {
                reference_index
            } else {
                best_index[[y, x]]
            };
            image.put_pixel(x as u32, y as u32, *aligned[source].get_pixel(x as u32, y as u32));
            let depth = (255.0 * source as f32 / last).round() as u8;
            depth_map.put_pixel(x as u32, y as u32, Luma([depth]));
        }
    }

    Ok(FocusStackResult { image, depth_map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::sharpness;
    use crate::image_proc::test_images::textured;

    #[test]
    fn test_rejects_single_image() {
        let img = RgbImage::new(8, 8);
        assert!(matches!(
            focus_stack(&[img]),
            Err(ImageProcError::NotEnoughImages { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_rejects_mixed_sizes() {
        let a = RgbImage::new(8, 8);
        let b = RgbImage::new(9, 8);
        assert!(matches!(
            focus_stack(&[a, b]),
            Err(ImageProcError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_picks_sharp_halves() {
        let sharp = textured(96, 64, 9);
        let blurred = imageproc::filter::gaussian_blur_f32(&sharp, 3.0);

        // Left half sharp in frame 0, right half sharp in frame 1
        let split = |left: &RgbImage, right: &RgbImage| {
            RgbImage::from_fn(96, 64, |x, y| {
                if x < 48 {
                    *left.get_pixel(x, y)
                } else {
                    *right.get_pixel(x, y)
                }
            })
        };
        let frame0 = split(&sharp, &blurred);
        let frame1 = split(&blurred, &sharp);

        let result = focus_stack(&[frame0.clone(), frame1.clone()]).unwrap();
        let merged = sharpness(&result.image);
        assert!(merged > sharpness(&frame0));
        assert!(merged > sharpness(&frame1));

        // Left half mostly came from frame 0, right half from frame 1
        let mean_depth = |x0: u32, x1: u32| {
            let mut sum = 0u64;
            for y in 0..64 {
                for x in x0..x1 {
                    sum += result.depth_map.get_pixel(x, y).0[0] as u64;
                }
            }
            sum as f64 / ((x1 - x0) * 64) as f64
        };
        assert!(mean_depth(4, 44) < mean_depth(52, 92));
    }

    #[test]
    fn test_box_mean_of_constant() {
        let ones = Array2::from_elem((7, 9), 1.0f32);
        let mean = box_mean(&ones, 2);
        assert!(mean.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }
}
