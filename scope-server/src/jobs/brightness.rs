//! LED auto-brightness.
//!
//! Sweeps the channel's LED level, then refines around the best sample,
//! maximizing the variance-of-Laplacian sharpness of the main camera
//! image. Too little light drowns detail in noise, too much saturates it.

use shared::image_proc::sharpness;
use shared::search::coarse_then_golden;
use shared_wasm::event::AutoBrightnessProgress;
use shared_wasm::{LedChannel, ScopeEvent, SettingsPatch};
use tokio::runtime::Handle;

use super::{settled_frame, JobContext, JobError, JobOutput};

pub const MIN_LEVEL: f64 = 0.0;
pub const MAX_LEVEL: f64 = 100.0;

/// Upper bound on objective evaluations for the progress total.
pub fn expected_evaluations(samples: usize, iterations: usize) -> usize {
    samples.max(2) + iterations + 2
}

pub async fn run(ctx: &JobContext, channel: LedChannel) -> Result<JobOutput, JobError> {
    let state = ctx.state.clone();
    let config = ctx.config().clone();
    let original = state.settings.snapshot().await.led_level(channel);
    let total = expected_evaluations(config.brightness_samples, config.brightness_iterations) as u32;

    let reporter = ctx.reporter();
    let handle = Handle::current();
    let search_state = state.clone();
    let search = tokio::task::spawn_blocking(move || {
        let mut evaluations = 0u32;
        coarse_then_golden(
            |level| -> Result<f64, JobError> {
                let frame = handle.block_on(async {
                    search_state.set_led(channel, level).await?;
                    Ok::<_, JobError>(
                        settled_frame(&search_state.main, config.frame_timeout).await?,
                    )
                })?;
                let metric = sharpness(&frame.0);
                evaluations = (evaluations + 1).min(total);
                reporter.progress(evaluations, total);
                search_state
                    .events
                    .publish(ScopeEvent::AutoBrightnessProgress(AutoBrightnessProgress {
                        led_type: channel,
                        current: evaluations,
                        total,
                        level,
                        metric,
                    }));
                Ok(metric)
            },
            MIN_LEVEL,
            MAX_LEVEL,
            config.brightness_samples,
            config.brightness_tolerance,
            config.brightness_iterations,
            |_, _, _| {},
        )
    })
    .await?;

    let best = match search {
        Ok(best) => best,
        Err(e) => {
            if let Err(restore) = state.set_led(channel, original).await {
                tracing::warn!("Failed to restore {channel} LED to {original}%: {restore}");
            }
            return Err(e);
        }
    };

    let level = (best.position * 10.0).round() / 10.0;
    state.set_led(channel, level).await?;
    state.settings.apply(SettingsPatch::led(channel, level)).await;
    tracing::info!(
        "{channel} LED set to {level:.1}% (sharpness {:.2}, {} evaluations)",
        best.value,
        best.evaluations
    );
    Ok(JobOutput::Brightness {
        channel,
        level,
        metric: best.value,
    })
}
