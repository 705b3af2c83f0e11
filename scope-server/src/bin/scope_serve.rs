use anyhow::Context;
use clap::Parser;
use scope_server::capture::PipelineOptions;
use scope_server::connectivity::{RestartStrategy, UpdateConfig};
use scope_server::jobs::JobConfig;
use scope_server::motion::MotionConfig;
use scope_server::rig::{RigConfig, SimulatedRig};
use scope_server::server::{run_server, CommonServerArgs};
use scope_server::state::{load_motor_positions, AppState, StateConfig};
use scope_server::ws_log_stream::{init_tracing, spawn_log_forwarder};
use shared::config_storage::ConfigStorage;
use shared::image_proc::motion::MotionConfig as MotionDetectionConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Parse a `WIDTHxHEIGHT` resolution.
fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let width = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let height = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    if width == 0 || height == 0 {
        return Err("resolution must be non-zero".to_string());
    }
    Ok((width, height))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Microscope control server running against simulated devices")]
struct Args {
    #[command(flatten)]
    common: CommonServerArgs,

    #[arg(
        long,
        help = "Configuration directory",
        long_help = "Directory holding settings.json, motor_positions.json, \
            perspective_transform.json and calibration.json. Default: ~/.scope_config."
    )]
    config_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Do not read or write persistent configuration",
        conflicts_with = "config_dir"
    )]
    no_persist: bool,

    #[arg(
        long,
        default_value = "captures",
        help = "Directory for photos, recordings and job results"
    )]
    media_dir: PathBuf,

    #[arg(long, default_value = "640x480", value_parser = parse_resolution,
        help = "Main camera resolution")]
    resolution: (u32, u32),

    #[arg(long, default_value = "320x240", value_parser = parse_resolution,
        help = "Auxiliary camera resolution")]
    cam1_resolution: (u32, u32),

    #[arg(long, default_value = "15.0", help = "Simulated camera frame rate")]
    frame_rate: f64,

    #[arg(
        long,
        default_value = "200",
        help = "Pause between motor steps in microseconds",
        long_help = "Pause between consecutive motor steps in microseconds. Sets the stage \
            speed: 200 us per step at 1024 steps/mm is about 4.9 mm/s."
    )]
    step_interval_us: u64,

    #[arg(long, help = "Disable motion detection on the auxiliary camera")]
    no_motion_detection: bool,

    #[arg(
        long,
        help = "Git checkout to update from",
        long_help = "Enables check_update and system_update. Points at the git checkout \
            the server runs from."
    )]
    update_repo: Option<PathBuf>,

    #[arg(
        long,
        default_value = "",
        help = "Commits API URL used by check_update; the branch name is appended"
    )]
    update_api_url: String,

    #[arg(long, default_value = "main", help = "Branch pulled by system_update")]
    update_branch: String,

    #[arg(long, default_value = "5", help = "Seconds before restarting after an update")]
    restart_delay: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_broadcaster = init_tracing();
    let args = Args::parse();

    let storage = if args.no_persist {
        info!("Persistence disabled");
        None
    } else {
        let storage = match &args.config_dir {
            Some(dir) => ConfigStorage::with_path(dir.clone()),
            None => ConfigStorage::new().context("Cannot locate the configuration directory")?,
        };
        std::fs::create_dir_all(storage.root_path())
            .with_context(|| format!("Cannot create {}", storage.root_path().display()))?;
        info!("Configuration directory: {}", storage.root_path().display());
        Some(storage)
    };

    let (main_width, main_height) = args.resolution;
    let (aux_width, aux_height) = args.cam1_resolution;
    let step_interval = Duration::from_micros(args.step_interval_us);
    let rig_config = RigConfig {
        main_width,
        main_height,
        aux_width,
        aux_height,
        frame_rate: args.frame_rate,
        ..Default::default()
    };
    info!(
        "Simulated rig: main {main_width}x{main_height}, cam1 {aux_width}x{aux_height} at {:.1} fps",
        args.frame_rate
    );
    let rig = SimulatedRig::new(&rig_config, load_motor_positions(storage.as_ref()));

    let pipeline = |motion_detection| PipelineOptions {
        encoding_threads: args.common.encoding_threads,
        motion_detection,
        ..Default::default()
    };
    let config = StateConfig {
        storage,
        media_dir: args.media_dir.clone(),
        motion: MotionConfig {
            step_interval,
            ..Default::default()
        },
        main_pipeline: pipeline(None),
        aux_pipeline: pipeline((!args.no_motion_detection).then(MotionDetectionConfig::default)),
        jobs: JobConfig::default(),
        update: args.update_repo.clone().map(|repo_dir| UpdateConfig {
            repo_dir,
            api_url: args.update_api_url.clone(),
            default_branch: args.update_branch.clone(),
            restart_delay: Duration::from_secs(args.restart_delay),
            restart: RestartStrategy::Exit,
            ..Default::default()
        }),
        frame_timeout: Duration::from_secs(5),
    };

    let state = AppState::start(rig.devices, config, log_broadcaster.clone()).await?;
    let _forwarder = spawn_log_forwarder(log_broadcaster, state.events.clone());

    let result = run_server(state.clone(), &args.common).await;
    state.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("640x480"), Ok((640, 480)));
        assert_eq!(parse_resolution("1280X720"), Ok((1280, 720)));
        assert!(parse_resolution("640").is_err());
        assert!(parse_resolution("0x480").is_err());
    }
}
