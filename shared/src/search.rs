//! One-dimensional maximum search over noisy, expensive objectives.
//!
//! The objective is typically "move hardware, grab a frame, measure
//! sharpness", so each evaluation may fail and the searches propagate the
//! first error.

/// Golden ratio conjugate used to place interior points.
pub const GOLDEN_RATIO: f64 = 0.618;

/// Best point found by a search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub position: f64,
    pub value: f64,
    pub evaluations: usize,
}

/// Golden-section search for the maximum of a unimodal `f` on `[lo, hi]`.
///
/// Stops when the bracket is narrower than `tolerance` or after
/// `max_iterations` bracket reductions.
pub fn golden_section_max<F, E>(
    mut f: F,
    lo: f64,
    hi: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Result<SearchResult, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let (mut a, mut b) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let mut c = b - GOLDEN_RATIO * (b - a);
    let mut d = a + GOLDEN_RATIO * (b - a);
    let mut fc = f(c)?;
    let mut fd = f(d)?;
    let mut evaluations = 2;

    for _ in 0..max_iterations {
        if (b - a).abs() < tolerance {
            break;
        }
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - GOLDEN_RATIO * (b - a);
            fc = f(c)?;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + GOLDEN_RATIO * (b - a);
            fd = f(d)?;
        }
        evaluations += 1;
    }

    let (position, value) = if fc > fd { (c, fc) } else { (d, fd) };
    Ok(SearchResult {
        position,
        value,
        evaluations,
    })
}

/// Evaluate `f` at `samples` evenly spaced points on `[lo, hi]`, then refine
/// around the best sample with a golden-section search.
///
/// `on_sample` is called after every coarse evaluation with
/// `(index, position, value)`.
pub fn coarse_then_golden<F, E, P>(
    mut f: F,
    lo: f64,
    hi: f64,
    samples: usize,
    tolerance: f64,
    max_iterations: usize,
    mut on_sample: P,
) -> Result<SearchResult, E>
where
    F: FnMut(f64) -> Result<f64, E>,
    P: FnMut(usize, f64, f64),
{
    let samples = samples.max(2);
    let step = (hi - lo) / (samples - 1) as f64;

    let mut best = (lo, f64::NEG_INFINITY);
    for i in 0..samples {
        let x = lo + step * i as f64;
        let value = f(x)?;
        on_sample(i, x, value);
        if value > best.1 {
            best = (x, value);
        }
    }

    let refine_lo = (best.0 - step).max(lo.min(hi));
    let refine_hi = (best.0 + step).min(hi.max(lo));
    let refined = golden_section_max(&mut f, refine_lo, refine_hi, tolerance, max_iterations)?;

    if refined.value >= best.1 {
        Ok(SearchResult {
            evaluations: refined.evaluations + samples,
            ..refined
        })
    } else {
        Ok(SearchResult {
            position: best.0,
            value: best.1,
            evaluations: refined.evaluations + samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::convert::Infallible;

    #[test]
    fn test_golden_finds_parabola_peak() {
        let result = golden_section_max::<_, Infallible>(
            |x| Ok(-(x - 3.2).powi(2)),
            0.0,
            10.0,
            0.01,
            50,
        )
        .unwrap();
        assert_abs_diff_eq!(result.position, 3.2, epsilon = 0.02);
    }

    #[test]
    fn test_golden_iteration_cap() {
        let result =
            golden_section_max::<_, Infallible>(|x| Ok(-(x - 0.5).abs()), -100.0, 100.0, 1e-9, 20)
                .unwrap();
        assert_eq!(result.evaluations, 22);
    }

    #[test]
    fn test_error_propagates() {
        let mut calls = 0;
        let result = golden_section_max(
            |_| {
                calls += 1;
                if calls > 3 {
                    Err("device lost")
                } else {
                    Ok(1.0)
                }
            },
            0.0,
            1.0,
            1e-6,
            20,
        );
        assert_eq!(result, Err("device lost"));
    }

    #[test]
    fn test_coarse_then_golden_unimodal() {
        let mut seen = Vec::new();
        let curve = |x: f64| Ok::<_, Infallible>(1000.0 * (-(x - 37.0).powi(2) / 200.0).exp());
        let result = coarse_then_golden(curve, 0.0, 100.0, 11, 0.5, 20, |i, x, _| {
            seen.push((i, x))
        })
        .unwrap();
        assert_eq!(seen.len(), 11);
        assert_abs_diff_eq!(seen[10].1, 100.0);
        assert_abs_diff_eq!(result.position, 37.0, epsilon = 1.0);
    }
}
