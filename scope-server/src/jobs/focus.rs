//! Z-axis jobs: focus stacking and fast autofocus.

use shared::image_proc::focus_stack::focus_stack;
use shared::image_proc::{encode_gray_jpeg, sharpness};
use shared::search::golden_section_max;
use shared_wasm::{Axis, SettingsPatch};
use tokio::runtime::Handle;

use super::{settled_frame, JobContext, JobError, JobOutput};
use crate::motion::round_mm;

/// `levels` Z positions spaced by `step_mm`, centred on `center`.
pub fn stack_positions(center: f64, levels: usize, step_mm: f64) -> Vec<f64> {
    let half = (levels as f64 - 1.0) / 2.0;
    (0..levels)
        .map(|i| center + (i as f64 - half) * step_mm)
        .collect()
}

/// Search window around `z` clipped to `[min, max]`.
pub fn focus_window(z: f64, range: f64, min: f64, max: f64) -> (f64, f64) {
    ((z - range).max(min), (z + range).min(max))
}

pub async fn stack(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let state = &ctx.state;
    let config = ctx.config();
    let z_step_mm = state.settings.snapshot().await.z_step_um / 1000.0;
    let z0 = state.motion.position(Axis::Z).current_mm;
    let positions = stack_positions(z0, config.stack_levels.max(2), z_step_mm);
    for &z in &positions {
        state.motion.validate_target(Axis::Z, z)?;
    }

    let total = positions.len() as u32;
    let mut images = Vec::with_capacity(positions.len());
    let captured: Result<(), JobError> = async {
        for (i, &z) in positions.iter().enumerate() {
            state.motion.move_and_wait(Axis::Z, z, config.move_timeout).await?;
            let frame = settled_frame(&state.main, config.frame_timeout).await?;
            images.push(frame.0.clone());
            ctx.progress(
                i as u32 + 1,
                total,
                format!("Captured level {}/{total} at Z = {z:.3} mm", i + 1),
            );
        }
        Ok(())
    }
    .await;

    if let Err(e) = state.motion.move_and_wait(Axis::Z, z0, config.move_timeout).await {
        tracing::warn!("Failed to return to the focus stack start position: {e}");
    }
    captured?;

    let quality = config.jpeg_quality;
    let (composite, depth_map_jpeg) = tokio::task::spawn_blocking(move || -> Result<_, JobError> {
        let result = focus_stack(&images)?;
        let depth_jpeg = encode_gray_jpeg(&result.depth_map, quality)?;
        Ok((result.image, depth_jpeg))
    })
    .await??;

    Ok(JobOutput::Stacked {
        image: ctx.save_image(composite).await?,
        depth_map_jpeg,
    })
}

/// Golden-section search for the sharpest Z around the current position,
/// then move there.
pub async fn fast_focus(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let state = ctx.state.clone();
    let config = ctx.config().clone();
    let travel = state.motion.config().travel[Axis::Z.index()];
    let z0 = state.motion.position(Axis::Z).current_mm;
    let (lo, hi) = focus_window(z0, config.focus_range_mm, travel.min_mm, travel.max_mm);
    tracing::info!("Fast focus searching Z {lo:.3} to {hi:.3} mm");

    let reporter = ctx.reporter();
    let total = (config.focus_iterations + 2) as u32;
    let handle = Handle::current();
    let search_state = state.clone();
    let search_config = config.clone();
    let best = tokio::task::spawn_blocking(move || {
        let mut evaluations = 0u32;
        golden_section_max(
            |z| -> Result<f64, JobError> {
                let frame = handle.block_on(async {
                    search_state
                        .motion
                        .move_and_wait(Axis::Z, z, search_config.move_timeout)
                        .await?;
                    Ok::<_, JobError>(
                        settled_frame(&search_state.main, search_config.frame_timeout).await?,
                    )
                })?;
                let metric = sharpness(&frame.0);
                evaluations += 1;
                reporter.progress(evaluations.min(total), total);
                tracing::debug!("Z {z:.4} mm sharpness {metric:.2}");
                Ok(metric)
            },
            lo,
            hi,
            search_config.focus_tolerance_mm,
            search_config.focus_iterations,
        )
    })
    .await??;

    let z = round_mm(best.position);
    state.motion.move_and_wait(Axis::Z, z, config.move_timeout).await?;
    state.settings.apply(SettingsPatch::target(Axis::Z, z)).await;
    tracing::info!(
        "Focused at Z = {z:.3} mm (sharpness {:.2}, {} evaluations)",
        best.value,
        best.evaluations
    );
    Ok(JobOutput::Focused { z_mm: z })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_stack_positions_centred() {
        let positions = stack_positions(0.5, 5, 0.01);
        assert_eq!(positions.len(), 5);
        assert_relative_eq!(positions[0], 0.48);
        assert_relative_eq!(positions[2], 0.5);
        assert_relative_eq!(positions[4], 0.52);
    }

    #[test]
    fn test_focus_window_clamped_to_travel() {
        assert_eq!(focus_window(0.0, 0.15, -5.0, 5.0), (-0.15, 0.15));
        let (lo, hi) = focus_window(4.9, 0.15, -5.0, 5.0);
        assert_relative_eq!(lo, 4.75);
        assert_relative_eq!(hi, 5.0);
    }
}
