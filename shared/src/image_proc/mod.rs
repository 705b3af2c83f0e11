//! Image processing for the microscope jobs.
//!
//! Colour frames travel as [`image::RgbImage`]; analysis runs on `f32`
//! luminance arrays (`Array2<f32>`, row-major `[y, x]`).

pub mod calibration;
pub mod cell_count;
pub mod focus_stack;
pub mod motion;
pub mod perspective;
pub mod phase_correlation;
pub mod sharpness;
pub mod stitch;

use image::{GrayImage, RgbImage};
use ndarray::Array2;

pub use sharpness::{laplacian, sharpness, variance_of_laplacian};

/// Pixel size assumed before a calibration has been run, in µm per pixel.
pub const DEFAULT_PIXEL_SIZE_UM: f64 = 0.09;

#[derive(Debug, thiserror::Error)]
pub enum ImageProcError {
    #[error("Need at least {needed} images, got {got}")]
    NotEnoughImages { needed: usize, got: usize },

    #[error("Image size mismatch: expected {expected:?}, got {got:?}")]
    SizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("Calibration pattern not detected: {0}")]
    PatternNotDetected(String),

    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Rec. 601 luminance of an RGB frame.
pub fn rgb_to_gray_array(image: &RgbImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        let [r, g, b] = image.get_pixel(x as u32, y as u32).0;
        0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
    })
}

/// Clamp a float array into an 8-bit grayscale image.
pub fn array_to_gray_image(array: &Array2<f32>) -> GrayImage {
    let (height, width) = array.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        image::Luma([array[[y as usize, x as usize]].clamp(0.0, 255.0) as u8])
    })
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageProcError> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder.encode_image(image)?;
    Ok(jpeg_bytes)
}

/// Encode a grayscale image (depth maps) as JPEG.
pub fn encode_gray_jpeg(image: &GrayImage, quality: u8) -> Result<Vec<u8>, ImageProcError> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder.encode_image(image)?;
    Ok(jpeg_bytes)
}

pub(crate) fn check_same_size(images: &[RgbImage]) -> Result<(u32, u32), ImageProcError> {
    let expected = images
        .first()
        .map(|img| img.dimensions())
        .ok_or(ImageProcError::NotEnoughImages { needed: 1, got: 0 })?;
    for img in images {
        if img.dimensions() != expected {
            return Err(ImageProcError::SizeMismatch {
                expected,
                got: img.dimensions(),
            });
        }
    }
    Ok(expected)
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random blob texture used across the image processing tests.
    pub fn textured(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = RgbImage::from_pixel(width, height, Rgb([200, 200, 200]));
        let blobs = (width * height / 300).max(4);
        for _ in 0..blobs {
            let cx = rng.random_range(0..width) as i64;
            let cy = rng.random_range(0..height) as i64;
            let r: i64 = rng.random_range(2..7);
            let shade: u8 = rng.random_range(20..120);
            for dy in -r..=r {
                for dx in -r..=r {
                    let (x, y) = (cx + dx, cy + dy);
                    if dx * dx + dy * dy <= r * r
                        && x >= 0
                        && y >= 0
                        && x < width as i64
                        && y < height as i64
                    {
                        img.put_pixel(x as u32, y as u32, Rgb([shade, shade, shade]));
                    }
                }
            }
        }
        img
    }

    /// Crop `(x, y, w, h)` out of `img`.
    pub fn crop(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
        image::imageops::crop_imm(img, x, y, w, h).to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_jpeg_magic() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&img, 80).unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_gray_conversion() {
        let img = RgbImage::from_pixel(3, 2, image::Rgb([255, 255, 255]));
        let gray = rgb_to_gray_array(&img);
        assert_eq!(gray.dim(), (2, 3));
        assert!((gray[[1, 2]] - 255.0).abs() < 0.01);
    }

    #[test]
    fn test_size_check() {
        let a = RgbImage::new(4, 4);
        let b = RgbImage::new(4, 5);
        assert!(check_same_size(&[a.clone(), a.clone()]).is_ok());
        assert!(matches!(
            check_same_size(&[a, b]),
            Err(ImageProcError::SizeMismatch { .. })
        ));
    }
}
