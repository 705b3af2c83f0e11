//! Translation estimation by phase correlation.

use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use super::ImageProcError;

/// Integer translation between two images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shift {
    /// Content of the second image is displaced by `(dx, dy)` relative to the first
    pub dx: i64,
    pub dy: i64,
    /// Height of the correlation peak, 0-1. Low values mean no reliable match.
    pub peak: f64,
}

/// In-place 2D FFT over a row-major `height x width` buffer.
fn fft2d(data: &mut [Complex<f32>], width: usize, height: usize, inverse: bool) {
    let mut planner = FftPlanner::<f32>::new();
    let (row_fft, col_fft) = if inverse {
        (planner.plan_fft_inverse(width), planner.plan_fft_inverse(height))
    } else {
        (planner.plan_fft_forward(width), planner.plan_fft_forward(height))
    };

    // Rows are contiguous; a buffer that is a multiple of the length runs one FFT per chunk
    row_fft.process(data);

    let mut columns = vec![Complex::new(0.0, 0.0); width * height];
    for y in 0..height {
        for x in 0..width {
            columns[x * height + y] = data[y * width + x];
        }
    }
    col_fft.process(&mut columns);
    for x in 0..width {
        for y in 0..height {
            data[y * width + x] = columns[x * height + y];
        }
    }
}

/// Hann window weight for index `i` of `n`.
fn hann(i: usize, n: usize) -> f32 {
    if n <= 1 {
        return 1.0;
    }
    0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos()
}

fn windowed_spectrum(image: &Array2<f32>) -> Vec<Complex<f32>> {
    let (height, width) = image.dim();
    let mean = image.mean().unwrap_or(0.0);
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        let wy = hann(y, height);
        for x in 0..width {
            let v = (image[[y, x]] - mean) * wy * hann(x, width);
            data.push(Complex::new(v, 0.0));
        }
    }
    fft2d(&mut data, width, height, false);
    data
}

/// Estimate the translation that maps `reference` onto `moved`.
///
/// If `moved(x, y) = reference(x - dx, y - dy)` the result is `(dx, dy)`.
/// Shifts are reported in `[-n/2, n/2)` along each axis.
pub fn phase_correlate(reference: &Array2<f32>, moved: &Array2<f32>) -> Result<Shift, ImageProcError> {
    let (height, width) = reference.dim();
    if moved.dim() != reference.dim() {
        return Err(ImageProcError::SizeMismatch {
            expected: (width as u32, height as u32),
            got: (moved.dim().1 as u32, moved.dim().0 as u32),
        });
    }

    let a = windowed_spectrum(reference);
    let b = windowed_spectrum(moved);

    // Normalized cross-power spectrum; the peak of its inverse sits at the shift
    let mut cross: Vec<Complex<f32>> = a
        .iter()
        .zip(b.iter())
        .map(|(fa, fb)| {
            let product = fb * fa.conj();
            let magnitude = product.norm();
            if magnitude > 1e-12 {
                product / magnitude
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();
    fft2d(&mut cross, width, height, true);

    let n = (width * height) as f32;
    let (best_index, best_value) = cross
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.re / n))
        .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    let py = best_index / width;
    let px = best_index % width;
    let wrap = |p: usize, n: usize| -> i64 {
        if p >= n.div_ceil(2) {
            p as i64 - n as i64
        } else {
            p as i64
        }
    };

    Ok(Shift {
        dx: wrap(px, width),
        dy: wrap(py, height),
        peak: best_value as f64,
    })
}
