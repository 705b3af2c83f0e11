//! Panorama stitching over a grid of stage positions.

use shared::image_proc::stitch::stitch_grid;
use shared_wasm::Axis;

use super::{settled_frame, JobContext, JobError, SavedImage};
use crate::state::AppState;

/// Stage offset between neighbouring tiles for a `width x height` frame.
///
/// Returns `(step_px, step_mm)`; both are (x, y).
pub fn tile_step(
    width: u32,
    height: u32,
    overlap: f64,
    pixel_size_um: f64,
) -> ((f64, f64), (f64, f64)) {
    let keep = (1.0 - overlap).clamp(0.05, 1.0);
    let step_px = (
        (width as f64 * keep).round(),
        (height as f64 * keep).round(),
    );
    let mm_per_px = pixel_size_um / 1000.0;
    (step_px, (step_px.0 * mm_per_px, step_px.1 * mm_per_px))
}

/// Tile positions in row-major order, centred on `center`.
pub fn grid_positions(
    center: (f64, f64),
    cols: usize,
    rows: usize,
    step_mm: (f64, f64),
) -> Vec<(f64, f64)> {
    let half_cols = (cols as f64 - 1.0) / 2.0;
    let half_rows = (rows as f64 - 1.0) / 2.0;
    (0..rows)
        .flat_map(|row| {
            (0..cols).map(move |col| {
                (
                    center.0 + (col as f64 - half_cols) * step_mm.0,
                    center.1 + (row as f64 - half_rows) * step_mm.1,
                )
            })
        })
        .collect()
}

async fn move_xy(state: &AppState, (x, y): (f64, f64)) -> Result<(), JobError> {
    let timeout = state.job_config.move_timeout;
    state.motion.move_to(Axis::X, x)?;
    state.motion.move_to(Axis::Y, y)?;
    state.motion.wait_idle(Axis::X, timeout).await?;
    state.motion.wait_idle(Axis::Y, timeout).await?;
    Ok(())
}

pub async fn run(ctx: &JobContext) -> Result<SavedImage, JobError> {
    let state = &ctx.state;
    let config = ctx.config();
    let (cols, rows) = config.stitch_grid;

    let first = state.main.current_frame(config.frame_timeout).await?;
    let (width, height) = first.0.dimensions();
    let (step_px, step_mm) = tile_step(width, height, config.stitch_overlap, state.pixel_size_um());

    let [x0, y0, _] = state.motion.positions_mm();
    let positions = grid_positions((x0, y0), cols, rows, step_mm);
    for &(x, y) in &positions {
        state.motion.validate_target(Axis::X, x)?;
        state.motion.validate_target(Axis::Y, y)?;
    }

    let total = positions.len() as u32;
    let mut tiles = Vec::with_capacity(positions.len());
    let captured: Result<(), JobError> = async {
        for (i, &position) in positions.iter().enumerate() {
            move_xy(state, position).await?;
            let frame = settled_frame(&state.main, config.frame_timeout).await?;
            tiles.push(frame.0.clone());
            ctx.progress(
                i as u32 + 1,
                total,
                format!("Captured tile {}/{total}", i + 1),
            );
        }
        Ok(())
    }
    .await;

    if let Err(e) = move_xy(state, (x0, y0)).await {
        tracing::warn!("Failed to return to the stitch start position: {e}");
    }
    captured?;

    tracing::info!(
        "Stitching {cols}x{rows} tiles, step {:.0}x{:.0} px",
        step_px.0,
        step_px.1
    );
    let mosaic = tokio::task::spawn_blocking(move || stitch_grid(&tiles, cols, rows, step_px)).await??;
    ctx.save_image(mosaic).await
}
