//! Focus measures.

use image::RgbImage;
use ndarray::{s, Array2};

use super::rgb_to_gray_array;

/// 4-neighbour Laplacian. Border pixels are zero.
pub fn laplacian(gray: &Array2<f32>) -> Array2<f32> {
    let (height, width) = gray.dim();
    let mut out = Array2::<f32>::zeros((height, width));
    if height < 3 || width < 3 {
        return out;
    }

    let center = gray.slice(s![1..-1, 1..-1]);
    let up = gray.slice(s![..-2, 1..-1]);
    let down = gray.slice(s![2.., 1..-1]);
    let left = gray.slice(s![1..-1, ..-2]);
    let right = gray.slice(s![1..-1, 2..]);

    let interior = &up + &down + &left + &right - &center * 4.0;
    out.slice_mut(s![1..-1, 1..-1]).assign(&interior);
    out
}

/// Variance of the Laplacian over the interior pixels.
///
/// Larger values mean more high-frequency content, i.e. a sharper image.
pub fn variance_of_laplacian(gray: &Array2<f32>) -> f64 {
    let (height, width) = gray.dim();
    if height < 3 || width < 3 {
        return 0.0;
    }
    let lap = laplacian(gray);
    let interior = lap.slice(s![1..-1, 1..-1]);
    let n = interior.len() as f64;
    let mean = interior.iter().map(|&v| v as f64).sum::<f64>() / n;
    interior
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

/// Sharpness metric of an RGB frame.
pub fn sharpness(image: &RgbImage) -> f64 {
    variance_of_laplacian(&rgb_to_gray_array(image))
}
