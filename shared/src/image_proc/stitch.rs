//! Mosaic stitching of a regular tile grid.

use image::RgbImage;
use ndarray::{s, Array2};
use std::ops::Range;
use tracing::{debug, warn};

use super::phase_correlation::phase_correlate;
use super::{check_same_size, rgb_to_gray_array, ImageProcError};

/// Correlation peaks below this are treated as no match.
const MIN_PEAK: f64 = 0.05;

/// Largest correction of the stage offset accepted, in pixels.
const MAX_DEVIATION_PX: f64 = 8.0;

/// Overlaps narrower than this are not registered.
const MIN_OVERLAP_PX: usize = 8;

/// Index ranges of the shared strip along one axis, in tile `a` and tile
/// `b`, when `b` sits `offset` pixels after `a`.
fn overlap_ranges(offset: i64, size: usize) -> Option<(Range<usize>, Range<usize>)> {
    let shift = offset.unsigned_abs() as usize;
    if shift >= size || size - shift < MIN_OVERLAP_PX {
        return None;
    }
    let len = size - shift;
    Some(if offset >= 0 {
        (shift..size, 0..len)
    } else {
        (0..len, shift..size)
    })
}

/// Where tile `b` sits relative to tile `a`.
///
/// Only the strips the stage offset says are shared get correlated; the
/// measured residual corrects `expected` by at most a few pixels.
fn pairwise_offset(
    a: &Array2<f32>,
    b: &Array2<f32>,
    expected: (f64, f64),
) -> Result<(f64, f64), ImageProcError> {
    let (height, width) = a.dim();
    let (ex, ey) = (expected.0.round() as i64, expected.1.round() as i64);
    let (Some((ax, bx)), Some((ay, by))) = (overlap_ranges(ex, width), overlap_ranges(ey, height))
    else {
        debug!("Tiles barely overlap at ({ex}, {ey}), using stage offset");
        return Ok(expected);
    };

    let strip_a = a.slice(s![ay, ax]).to_owned();
    let strip_b = b.slice(s![by, bx]).to_owned();
    let (strip_h, strip_w) = strip_a.dim();
    let shift = phase_correlate(&strip_a, &strip_b)?;
    if shift.peak < MIN_PEAK {
        debug!("Weak correlation peak {:.3}, using stage offset", shift.peak);
        return Ok(expected);
    }

    // strip_b(u) = strip_a(u + r) for a residual r, so the shift is -r
    let (rx, ry) = (-shift.dx as f64, -shift.dy as f64);
    let limit_x = MAX_DEVIATION_PX.min(strip_w as f64 / 4.0);
    let limit_y = MAX_DEVIATION_PX.min(strip_h as f64 / 4.0);
    if rx.abs() > limit_x || ry.abs() > limit_y {
        warn!(
            "Measured tile offset ({}, {}) disagrees with stage ({:.1}, {:.1}), using stage",
            ex as f64 + rx,
            ey as f64 + ry,
            expected.0,
            expected.1
        );
        return Ok(expected);
    }
    Ok((ex as f64 + rx, ey as f64 + ry))
}

/// Stitch `cols x rows` tiles given in row-major order.
///
/// `step_px` is the stage displacement between neighbouring tiles in
/// pixels; it seeds and sanity-checks the measured offsets. Overlaps are
/// averaged and the result is cropped to the area covered by every row
/// and column.
pub fn stitch_grid(
    tiles: &[RgbImage],
    cols: usize,
    rows: usize,
    step_px: (f64, f64),
) -> Result<RgbImage, ImageProcError> {
    let needed = cols * rows;
    if needed == 0 || tiles.len() != needed {
        return Err(ImageProcError::NotEnoughImages {
            needed,
            got: tiles.len(),
        });
    }
    let (width, height) = check_same_size(tiles)?;
    let gray: Vec<Array2<f32>> = tiles.iter().map(rgb_to_gray_array).collect();
    let index = |c: usize, r: usize| r * cols + c;

    let mut positions = vec![(0.0f64, 0.0f64); needed];
    for r in 0..rows {
        for c in 0..cols {
            let (origin, offset) = if c > 0 {
                let prev = index(c - 1, r);
                (prev, pairwise_offset(&gray[prev], &gray[index(c, r)], (step_px.0, 0.0))?)
            } else if r > 0 {
                let above = index(c, r - 1);
                (above, pairwise_offset(&gray[above], &gray[index(c, r)], (0.0, step_px.1))?)
            } else {
                continue;
            };
            positions[index(c, r)] = (
                positions[origin].0 + offset.0,
                positions[origin].1 + offset.1,
            );
        }
    }

    let min_x = positions.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let min_y = positions.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let placed: Vec<(i64, i64)> = positions
        .iter()
        .map(|p| ((p.0 - min_x).round() as i64, (p.1 - min_y).round() as i64))
        .collect();

    let canvas_w = placed.iter().map(|p| p.0).max().unwrap_or(0) + width as i64;
    let canvas_h = placed.iter().map(|p| p.1).max().unwrap_or(0) + height as i64;
    let mut sums = vec![[0u32; 3]; (canvas_w * canvas_h) as usize];
    let mut counts = vec![0u32; (canvas_w * canvas_h) as usize];

    for (tile, &(ox, oy)) in tiles.iter().zip(&placed) {
        for (x, y, pixel) in tile.enumerate_pixels() {
            let i = ((oy + y as i64) * canvas_w + ox + x as i64) as usize;
            for (sum, &v) in sums[i].iter_mut().zip(pixel.0.iter()) {
                *sum += v as u32;
            }
            counts[i] += 1;
        }
    }

    // Inner rectangle covered by every edge tile
    let x0 = (0..rows).map(|r| placed[index(0, r)].0).max().unwrap_or(0);
    let x1 = (0..rows)
        .map(|r| placed[index(cols - 1, r)].0 + width as i64)
        .min()
        .unwrap_or(canvas_w);
    let y0 = (0..cols).map(|c| placed[index(c, 0)].1).max().unwrap_or(0);
    let y1 = (0..cols)
        .map(|c| placed[index(c, rows - 1)].1 + height as i64)
        .min()
        .unwrap_or(canvas_h);
    let (x0, x1, y0, y1) = if x1 > x0 && y1 > y0 {
        (x0, x1, y0, y1)
    } else {
        (0, canvas_w, 0, canvas_h)
    };

    Ok(RgbImage::from_fn((x1 - x0) as u32, (y1 - y0) as u32, |x, y| {
        let i = ((y0 + y as i64) * canvas_w + x0 + x as i64) as usize;
        let n = counts[i].max(1);
        image::Rgb(sums[i].map(|s| (s / n) as u8))
    }))
}
