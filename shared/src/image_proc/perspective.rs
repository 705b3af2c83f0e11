//! Perspective correction for the auxiliary camera.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use serde::{Deserialize, Serialize};

use super::ImageProcError;

/// Homography mapping input pixels to output pixels, plus output size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveTransform {
    pub perspective_matrix: [[f64; 3]; 3],
    /// `[width, height]`
    pub output_size: [u32; 2],
}

/// On-disk layout written by the fusion calibration tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedPerspectiveFile {
    pub fused_perspective_transform: PerspectiveTransform,
}

impl PerspectiveTransform {
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            perspective_matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            output_size: [width, height],
        }
    }

    fn projection(&self) -> Result<Projection, ImageProcError> {
        let m = &self.perspective_matrix;
        if m.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ImageProcError::InvalidTransform(
                "matrix has non-finite entries".into(),
            ));
        }
        // Relative to the entry scale so unnormalized homographies pass
        let scale = m.iter().flatten().fold(0.0f64, |acc, v| acc.max(v.abs()));
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if scale == 0.0 || (det / scale.powi(3)).abs() < 1e-9 {
            return Err(ImageProcError::InvalidTransform(format!(
                "matrix is singular (det = {det:e})"
            )));
        }
        let flat = [
            m[0][0] as f32,
            m[0][1] as f32,
            m[0][2] as f32,
            m[1][0] as f32,
            m[1][1] as f32,
            m[1][2] as f32,
            m[2][0] as f32,
            m[2][1] as f32,
            m[2][2] as f32,
        ];
        Projection::from_matrix(flat)
            .ok_or_else(|| ImageProcError::InvalidTransform("matrix is not invertible".into()))
    }

    pub fn validate(&self) -> Result<(), ImageProcError> {
        if self.output_size[0] == 0 || self.output_size[1] == 0 {
            return Err(ImageProcError::InvalidTransform(format!(
                "output size {:?} is empty",
                self.output_size
            )));
        }
        self.projection().map(|_| ())
    }

    /// Warp `image` into a new frame of `output_size`; uncovered pixels are black.
    pub fn warp(&self, image: &RgbImage) -> Result<RgbImage, ImageProcError> {
        self.validate()?;
        let projection = self.projection()?;
        let mut out = RgbImage::new(self.output_size[0], self.output_size[1]);
        warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_preserves_pixels() {
        let img = crate::image_proc::test_images::textured(40, 30, 3);
        let out = PerspectiveTransform::identity(40, 30).warp(&img).unwrap();
        assert_eq!(out.dimensions(), (40, 30));
        assert_eq!(out.get_pixel(20, 15), img.get_pixel(20, 15));
    }

    #[test]
    fn test_translation_and_output_size() {
        let mut img = RgbImage::new(20, 20);
        img.put_pixel(5, 5, Rgb([255, 255, 255]));
        let transform = PerspectiveTransform {
            perspective_matrix: [[1.0, 0.0, 3.0], [0.0, 1.0, 2.0], [0.0, 0.0, 1.0]],
            output_size: [30, 25],
        };
        let out = transform.warp(&img).unwrap();
        assert_eq!(out.dimensions(), (30, 25));
        assert_eq!(*out.get_pixel(8, 7), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let transform = PerspectiveTransform {
            perspective_matrix: [[0.0; 3]; 3],
            output_size: [10, 10],
        };
        assert!(transform.validate().is_err());

        let rank_two = PerspectiveTransform {
            perspective_matrix: [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]],
            output_size: [10, 10],
        };
        assert!(matches!(
            rank_two.validate(),
            Err(ImageProcError::InvalidTransform(_))
        ));
    }

    #[test]
    fn test_non_finite_matrix_rejected() {
        let mut transform = PerspectiveTransform::identity(10, 10);
        transform.perspective_matrix[1][2] = f64::NAN;
        assert!(transform.validate().is_err());
        assert!(transform.warp(&RgbImage::new(10, 10)).is_err());
    }

    #[test]
    fn test_scaled_homography_accepted() {
        let transform = PerspectiveTransform {
            perspective_matrix: [[500.0, 0.0, 10.0], [0.0, 500.0, 5.0], [0.0, 0.0, 500.0]],
            output_size: [10, 10],
        };
        assert!(transform.validate().is_ok());
    }

    #[test]
    fn test_parses_fused_file() {
        let json = r#"{"fused_perspective_transform": {
            "perspective_matrix": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            "output_size": [640, 480]}}"#;
        let file: FusedPerspectiveFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.fused_perspective_transform.output_size, [640, 480]);
    }
}
