//! Jobs that only analyse the latest main-camera frame.

use shared::image_proc::calibration::calibrate_pixel_size;
use shared::image_proc::cell_count::{count_cells as detect_cells, CellCountParams};

use super::{JobContext, JobError, JobOutput};

pub async fn count_cells(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let state = &ctx.state;
    let frame = state.main.current_frame(ctx.config().frame_timeout).await?;
    let params = CellCountParams {
        pixel_size_um: state.pixel_size_um(),
        ..Default::default()
    };

    let result = tokio::task::spawn_blocking(move || detect_cells(&frame.0, &params)).await?;
    ctx.progress(1, 1, format!("Found {} cells", result.count()));

    let count = result.count();
    let avg_diameter_um = result.avg_diameter_um;
    let image = ctx.save_image(result.annotated).await?;
    Ok(JobOutput::Cells {
        image,
        count,
        avg_diameter_um,
    })
}

/// Measure the pixel size from the dot grid under the objective, persist it
/// and use it from now on.
pub async fn calibrate(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let state = &ctx.state;
    let frame = state.main.current_frame(ctx.config().frame_timeout).await?;
    let pitch_um = ctx.config().calibration_pitch_um;

    let calibration =
        tokio::task::spawn_blocking(move || calibrate_pixel_size(&frame.0, pitch_um)).await??;
    tracing::info!(
        "Calibrated {:.4} um/px from {} dots, spacing {:.2} px",
        calibration.pixel_size_um,
        calibration.dots,
        calibration.spacing_px
    );

    if let Some(storage) = state.storage.clone() {
        tokio::task::spawn_blocking(move || storage.save_calibration(&calibration)).await??;
    }
    state.set_pixel_size_um(calibration.pixel_size_um);
    ctx.progress(1, 1, "Calibration saved");

    Ok(JobOutput::Calibrated {
        pixel_size_um: calibration.pixel_size_um,
    })
}
