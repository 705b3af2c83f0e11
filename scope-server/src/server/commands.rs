//! Control channel command handlers.
//!
//! Replies go to the issuing client through its [`Responder`]; state
//! changes are broadcast to everyone through the [`EventBroadcaster`].
//! Commands without a dedicated response event report failures as a
//! `command_error`.
//!
//! [`EventBroadcaster`]: crate::events::EventBroadcaster

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use shared_wasm::command::{
    FocusJogRequest, JogRequest, RecordingRequest, SaveConfigRequest, StreamRequest,
    SystemUpdateRequest, WifiConnectRequest,
};
use shared_wasm::event::{
    ArtifactResponse, DeleteVideoResponse, RestartRequired, StatusMessage, StreamStatsReport,
    UpdateCheckResult, UpdateResult, WifiConnectResult, WifiScanResult,
};
use shared_wasm::settings::validate_step_um;
use shared_wasm::{
    Axis, Cam1Mode, CameraId, CommandError, FieldSetResult, LedChannel, Magnification,
    SavedSettings, ScopeCommand, ScopeEvent, SettingsPatch,
};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::CameraControl;
use crate::events::Responder;
use crate::jobs::{start_job, JobRequest};
use crate::motion::round_mm;
use crate::recording::{RecordingError, RecordingSession};
use crate::state::AppState;

/// Build a `CommandError` from a command name and a displayable error.
fn cmd_err(command: &str, err: impl std::fmt::Display) -> CommandError {
    CommandError {
        command: command.into(),
        message: err.to_string(),
    }
}

/// Per-connection bookkeeping.
#[derive(Debug, Default)]
pub struct ClientSession {
    /// Cameras this client receives `video_frame` pushes from
    pushed: [bool; 2],
    /// Recording this client started and has not stopped
    recording: Option<RecordingSession>,
    /// Client asked to close the connection
    pub closed: bool,
}

impl ClientSession {
    /// Whether a broadcast event is delivered to this client.
    pub fn wants(&self, event: &ScopeEvent) -> bool {
        event
            .pushed_frame_camera()
            .map_or(true, |camera| self.pushed[camera_index(camera)])
    }

    /// Undo this client's push opt-ins and finish the recording it left
    /// running.
    pub async fn release(&mut self, state: &AppState) {
        for camera in CameraId::ALL {
            if std::mem::take(&mut self.pushed[camera_index(camera)]) {
                state.pipeline(camera).remove_push_subscriber();
            }
        }

        if let Some(recording) = self.recording.take() {
            let camera = recording.camera_id;
            match state.recordings.stop_session(&recording).await {
                Ok(finished) => tracing::info!(
                    "Client left, saved {camera} recording as {}",
                    finished.filename
                ),
                Err(RecordingError::NotRecording(_)) => {}
                Err(e) => tracing::warn!("Client left, {camera} recording failed: {e}"),
            }
        }
    }
}

fn camera_index(camera: CameraId) -> usize {
    match camera {
        CameraId::Main => 0,
        CameraId::Aux => 1,
    }
}

/// A settable scalar field with its `_set` reply event.
#[derive(Debug, Clone, Copy)]
enum Field {
    Exposure,
    Gain,
    Led(LedChannel),
    RBal,
    BBal,
    RecordingDelay,
}

impl Field {
    fn reply(self, result: FieldSetResult) -> ScopeEvent {
        match self {
            Field::Exposure => ScopeEvent::ExposureSet(result),
            Field::Gain => ScopeEvent::GainSet(result),
            Field::Led(LedChannel::Reflected) => ScopeEvent::LedSet(result),
            Field::Led(LedChannel::Transmitted) => ScopeEvent::Led2Set(result),
            Field::RBal => ScopeEvent::RBalSet(result),
            Field::BBal => ScopeEvent::BBalSet(result),
            Field::RecordingDelay => ScopeEvent::RecordingDelaySet(result),
        }
    }

    fn validate(self, value: f64) -> Result<(), String> {
        let valid = value.is_finite()
            && match self {
                Field::Exposure => value > 0.0 && value <= 10_000.0,
                Field::Gain | Field::RBal | Field::BBal => value >= 0.0,
                Field::Led(_) => (0.0..=100.0).contains(&value),
                Field::RecordingDelay => value >= 0.0,
            };
        if valid {
            Ok(())
        } else {
            Err(format!("Invalid value {value}"))
        }
    }

    fn patch(self, value: f64) -> SettingsPatch {
        let mut patch = SettingsPatch::default();
        match self {
            Field::Exposure => patch.exposure_value = Some(value),
            Field::Gain => patch.gain_value = Some(value),
            Field::Led(channel) => return SettingsPatch::led(channel, value),
            Field::RBal => patch.r_value = Some(value),
            Field::BBal => patch.b_value = Some(value),
            Field::RecordingDelay => patch.recording_interval = Some(value),
        }
        patch
    }
}

/// Update the setting, then push it to the device. A device failure is
/// reported without reverting the stored value.
async fn handle_set_field(state: &AppState, responder: &Responder, field: Field, value: f64) {
    if let Err(e) = field.validate(value) {
        responder.send(field.reply(FieldSetResult::error(e)));
        return;
    }
    let settings = state.settings.apply(field.patch(value)).await;

    let applied = match field {
        Field::Exposure => state
            .main
            .apply(CameraControl::Exposure(Duration::from_secs_f64(value / 1000.0)))
            .await
            .map_err(|e| e.to_string()),
        Field::Gain => state
            .main
            .apply(CameraControl::Gain(value))
            .await
            .map_err(|e| e.to_string()),
        Field::RBal | Field::BBal => state
            .main
            .apply(CameraControl::WhiteBalance {
                r_gain: settings.r_gain,
                b_gain: settings.b_gain,
            })
            .await
            .map_err(|e| e.to_string()),
        Field::Led(channel) => state.set_led(channel, value).await.map_err(|e| e.to_string()),
        Field::RecordingDelay => Ok(()),
    };

    let reply = match applied {
        Ok(()) => FieldSetResult::success(value),
        Err(e) => {
            tracing::warn!("Failed to apply {field:?} = {value}: {e}");
            FieldSetResult::error(e)
        }
    };
    responder.send(field.reply(reply));
}

fn position_reply(axis: Axis, result: FieldSetResult) -> ScopeEvent {
    match axis {
        Axis::X => ScopeEvent::XPosSet(result),
        Axis::Y => ScopeEvent::YPosSet(result),
        Axis::Z => ScopeEvent::ZPosSet(result),
    }
}

async fn handle_set_position(state: &AppState, responder: &Responder, axis: Axis, target_mm: f64) {
    let reply = match state.motion.move_to(axis, target_mm) {
        Ok(target) => {
            let target = round_mm(target);
            state
                .settings
                .apply(SettingsPatch::target(axis, target))
                .await;
            FieldSetResult::success(target)
        }
        Err(e) => FieldSetResult::error(e),
    };
    responder.send(position_reply(axis, reply));
}

async fn handle_jog(state: &AppState, axis: Axis, delta_um: f64) -> Result<(), CommandError> {
    let command = format!("move_{}", axis.as_str());
    validate_step_um(axis, delta_um.abs()).map_err(|e| cmd_err(&command, e))?;
    let target = state
        .motion
        .move_relative(axis, delta_um)
        .map_err(|e| cmd_err(&command, e))?;
    state
        .settings
        .apply(SettingsPatch::target(axis, round_mm(target)))
        .await;
    Ok(())
}

async fn handle_set_magnification(state: &AppState, responder: &Responder, value: f64) {
    let magnification = if value.fract() == 0.0 && value >= 0.0 && value <= u32::MAX as f64 {
        Magnification::try_from(value as u32)
    } else {
        Err(format!("unsupported magnification {value}"))
    };
    let reply = match magnification {
        Ok(magnification) => {
            state
                .settings
                .apply(SettingsPatch {
                    magnification: Some(magnification),
                    ..Default::default()
                })
                .await;
            FieldSetResult::success(magnification.value())
        }
        Err(e) => FieldSetResult::error(e),
    };
    responder.send(ScopeEvent::MagnificationSet(reply));
}

async fn handle_save_config(
    state: &AppState,
    responder: &Responder,
    request: Option<SaveConfigRequest>,
) {
    let request = request.unwrap_or_default();
    let steps = [
        (Axis::X, request.x_step_um),
        (Axis::Y, request.y_step_um),
        (Axis::Z, request.z_step_um),
    ];
    let mut patch = SettingsPatch::default();
    for (axis, step) in steps {
        let Some(step) = step else { continue };
        if let Err(e) = validate_step_um(axis, step) {
            responder.send(ScopeEvent::ConfigSaved(StatusMessage::error(e)));
            return;
        }
        match axis {
            Axis::X => patch.x_step_um = Some(step),
            Axis::Y => patch.y_step_um = Some(step),
            Axis::Z => patch.z_step_um = Some(step),
        }
    }
    let settings = state.settings.apply(patch).await;

    let Some(storage) = state.storage.clone() else {
        responder.send(ScopeEvent::ConfigSaved(StatusMessage::error(
            "No configuration directory",
        )));
        return;
    };
    let saved = SavedSettings::from(&settings);
    let result = tokio::task::spawn_blocking(move || storage.save_settings(&saved)).await;
    let reply = match result {
        Ok(Ok(path)) => {
            tracing::info!("Settings saved to {}", path.display());
            StatusMessage::success("Configuration saved")
        }
        Ok(Err(e)) => StatusMessage::error(format!("Failed to save configuration: {e}")),
        Err(e) => StatusMessage::error(format!("Failed to save configuration: {e}")),
    };
    responder.send(ScopeEvent::ConfigSaved(reply));
}

async fn handle_capture(state: &AppState, responder: &Responder, camera: CameraId) {
    let response = match state
        .pipeline(camera)
        .capture_still(&state.media, state.frame_timeout)
        .await
    {
        Ok(still) => ArtifactResponse::ok(still.filename, BASE64.encode(&still.jpeg)),
        Err(e) => {
            tracing::warn!("Capture on {camera} failed: {e}");
            ArtifactResponse::failed(e)
        }
    };
    responder.send(match camera {
        CameraId::Main => ScopeEvent::CaptureResponse(response),
        CameraId::Aux => ScopeEvent::CaptureCam1Response(response),
    });
}

async fn handle_start_recording(
    state: &AppState,
    responder: &Responder,
    session: &mut ClientSession,
    camera: CameraId,
    request: Option<RecordingRequest>,
) {
    let interval = match request {
        Some(request) => request.interval,
        None => state.settings.snapshot().await.recording_interval_s,
    };
    match state.recordings.start(state.pipeline(camera), interval).await {
        Ok(recording) => session.recording = Some(recording),
        Err(e) => {
            tracing::warn!("Cannot start recording on {camera}: {e}");
            responder.send(crate::recording::status_event(
                camera,
                shared_wasm::event::RecordingStatus {
                    recording: false,
                    message: e.to_string(),
                    interval,
                },
            ));
        }
    }
}

async fn handle_stop_recording(
    state: &AppState,
    responder: &Responder,
    session: &mut ClientSession,
    camera: CameraId,
) {
    if session
        .recording
        .as_ref()
        .is_some_and(|recording| recording.camera_id == camera)
    {
        session.recording = None;
    }
    let response = match state.recordings.stop(camera).await {
        Ok(finished) => ArtifactResponse::ok(finished.filename, BASE64.encode(&finished.data)),
        Err(e) => ArtifactResponse::failed(e),
    };
    responder.send(match camera {
        CameraId::Main => ScopeEvent::RecordingResponse(response),
        CameraId::Aux => ScopeEvent::RecordingCam1Response(response),
    });
}

fn handle_delete_video(state: &AppState, responder: &Responder, filename: String) {
    let error = state.media.delete(&filename).err().map(|e| e.to_string());
    responder.send(ScopeEvent::DeleteVideoResponse(DeleteVideoResponse {
        success: error.is_none(),
        filename,
        error,
    }));
}

fn handle_set_cam1_mode(state: &AppState, responder: &Responder, mode: Cam1Mode) {
    let reply = if mode == Cam1Mode::Perspective && !state.aux.has_perspective() {
        FieldSetResult::error("No perspective transform is configured")
    } else {
        state
            .aux
            .set_perspective_enabled(mode == Cam1Mode::Perspective);
        FieldSetResult::success(serde_json::to_value(mode).unwrap_or_default())
    };
    responder.send(ScopeEvent::Cam1ModeSet(reply));
}

fn stream_stats(state: &AppState) -> ScopeEvent {
    ScopeEvent::StreamStats(StreamStatsReport {
        streams: CameraId::ALL
            .iter()
            .map(|&camera| state.pipeline(camera).stats())
            .collect(),
    })
}

fn handle_stream(
    state: &AppState,
    responder: &Responder,
    session: &mut ClientSession,
    StreamRequest { camera }: StreamRequest,
    start: bool,
) {
    let pipeline = state.pipeline(camera);
    let pushed = &mut session.pushed[camera_index(camera)];
    if start {
        pipeline.start_stream();
        if !*pushed {
            pipeline.add_push_subscriber();
            *pushed = true;
        }
    } else {
        if std::mem::take(pushed) {
            pipeline.remove_push_subscriber();
        }
        // Other viewers keep the stream; recordings and jobs hold it themselves
        if !pipeline.has_consumers() {
            pipeline.stop_stream();
        }
    }
    responder.send(stream_stats(state));
}

fn spawn_wifi_connect(state: &Arc<AppState>, responder: &Responder, request: WifiConnectRequest) {
    let wifi = state.wifi.clone();
    let events = state.events.clone();
    let responder = responder.clone();
    tokio::spawn(async move {
        let WifiConnectRequest { ssid, password } = request;
        let result = match wifi.connect(&ssid, password).await {
            Ok(status) => {
                events.publish(ScopeEvent::WifiStatus(status));
                WifiConnectResult {
                    success: true,
                    message: Some(format!("Connected to {ssid}")),
                    ssid,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("WiFi connection to {ssid} failed: {e}");
                WifiConnectResult {
                    success: false,
                    message: None,
                    ssid,
                    error: Some(e.to_string()),
                }
            }
        };
        responder.send(ScopeEvent::WifiConnectResult(result));
    });
}

async fn handle_scan_wifi(state: &AppState, responder: &Responder) {
    let result = match state.wifi.scan().await {
        Ok(networks) => WifiScanResult {
            success: true,
            networks,
            error: None,
        },
        Err(e) => WifiScanResult {
            success: false,
            networks: Vec::new(),
            error: Some(e.to_string()),
        },
    };
    responder.send(ScopeEvent::WifiScanResult(result));
}

const UPDATES_DISABLED: &str = "Updates are not configured on this server";

fn spawn_check_update(state: &Arc<AppState>, responder: &Responder) {
    let Some(updater) = state.updater.clone() else {
        responder.send(ScopeEvent::UpdateCheckResult(UpdateCheckResult {
            error: Some(UPDATES_DISABLED.to_string()),
            ..Default::default()
        }));
        return;
    };
    let responder = responder.clone();
    tokio::spawn(async move {
        let result = updater.check().await.unwrap_or_else(|e| {
            tracing::warn!("Update check failed: {e}");
            UpdateCheckResult {
                error: Some(e.to_string()),
                ..Default::default()
            }
        });
        responder.send(ScopeEvent::UpdateCheckResult(result));
    });
}

fn spawn_system_update(
    state: &Arc<AppState>,
    responder: &Responder,
    request: Option<SystemUpdateRequest>,
) {
    let Some(updater) = state.updater.clone() else {
        responder.send(ScopeEvent::UpdateResult(UpdateResult {
            success: false,
            message: None,
            error: Some(UPDATES_DISABLED.to_string()),
        }));
        return;
    };
    let SystemUpdateRequest { source, branch } = request.unwrap_or_default();
    let events = state.events.clone();
    let responder = responder.clone();
    tokio::spawn(async move {
        let status_events = events.clone();
        let applied = updater
            .apply(source, branch, move |status| {
                status_events.publish(ScopeEvent::UpdateStatus(status))
            })
            .await;
        match applied {
            Ok(changed) => {
                responder.send(ScopeEvent::UpdateResult(UpdateResult {
                    success: true,
                    message: Some(if changed {
                        "Update installed".to_string()
                    } else {
                        "Already up to date".to_string()
                    }),
                    error: None,
                }));
                if changed {
                    let restart_delay = updater.schedule_restart();
                    events.publish(ScopeEvent::SystemRestartRequired(RestartRequired {
                        restart_delay,
                    }));
                }
            }
            Err(e) => {
                tracing::error!("System update failed: {e}");
                events.publish(ScopeEvent::UpdateStatus(StatusMessage::error(&e)));
                responder.send(ScopeEvent::UpdateResult(UpdateResult {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                }));
            }
        }
    });
}

/// Dispatch one command from a control channel client.
pub async fn dispatch_command(
    state: &Arc<AppState>,
    responder: &Responder,
    session: &mut ClientSession,
    cmd: ScopeCommand,
) -> Result<(), CommandError> {
    match cmd {
        ScopeCommand::GetSettings => responder.send(state.settings.snapshot_event().await),
        ScopeCommand::SetExposure(v) => {
            handle_set_field(state, responder, Field::Exposure, v.value).await
        }
        ScopeCommand::SetGain(v) => handle_set_field(state, responder, Field::Gain, v.value).await,
        ScopeCommand::SetLed(v) => {
            handle_set_field(state, responder, Field::Led(LedChannel::Reflected), v.value).await
        }
        ScopeCommand::SetLed2(v) => {
            handle_set_field(state, responder, Field::Led(LedChannel::Transmitted), v.value).await
        }
        ScopeCommand::SetRBal(v) => handle_set_field(state, responder, Field::RBal, v.value).await,
        ScopeCommand::SetBBal(v) => handle_set_field(state, responder, Field::BBal, v.value).await,
        ScopeCommand::SetRecordingDelay(v) => {
            handle_set_field(state, responder, Field::RecordingDelay, v.value).await
        }
        ScopeCommand::SetXPos(v) => handle_set_position(state, responder, Axis::X, v.value).await,
        ScopeCommand::SetYPos(v) => handle_set_position(state, responder, Axis::Y, v.value).await,
        ScopeCommand::SetZPos(v) => handle_set_position(state, responder, Axis::Z, v.value).await,
        ScopeCommand::SetMagnification(v) => {
            handle_set_magnification(state, responder, v.value).await
        }
        ScopeCommand::ToggleShowXyz(flag) => {
            state
                .settings
                .apply(SettingsPatch {
                    show_xyz: Some(flag.value),
                    ..Default::default()
                })
                .await;
            responder.send(ScopeEvent::ShowXyzSet(FieldSetResult::success(flag.value)));
        }
        ScopeCommand::SaveConfig(request) => handle_save_config(state, responder, request).await,

        ScopeCommand::MoveX(JogRequest { step_size_um }) => {
            handle_jog(state, Axis::X, step_size_um).await?
        }
        ScopeCommand::MoveY(JogRequest { step_size_um }) => {
            handle_jog(state, Axis::Y, step_size_um).await?
        }
        ScopeCommand::MoveZ(FocusJogRequest { steps }) => handle_jog(state, Axis::Z, steps).await?,
        ScopeCommand::StopMove => state.motion.stop(None).await,

        ScopeCommand::Capture => handle_capture(state, responder, CameraId::Main).await,
        ScopeCommand::CaptureCam1 => handle_capture(state, responder, CameraId::Aux).await,
        ScopeCommand::StartRecording(request) => {
            handle_start_recording(state, responder, session, CameraId::Main, request).await
        }
        ScopeCommand::StartRecordingCam1(request) => {
            handle_start_recording(state, responder, session, CameraId::Aux, request).await
        }
        ScopeCommand::StopRecording => {
            handle_stop_recording(state, responder, session, CameraId::Main).await
        }
        ScopeCommand::StopRecordingCam1 => {
            handle_stop_recording(state, responder, session, CameraId::Aux).await
        }
        ScopeCommand::DeleteVideo(request) => {
            handle_delete_video(state, responder, request.filename)
        }
        ScopeCommand::SetCam1Mode(request) => handle_set_cam1_mode(state, responder, request.mode),
        ScopeCommand::StartStream(request) => {
            handle_stream(state, responder, session, request, true)
        }
        ScopeCommand::StopStream(request) => {
            handle_stream(state, responder, session, request, false)
        }
        ScopeCommand::GetStreamStats => responder.send(stream_stats(state)),

        ScopeCommand::FastFocus => {
            start_job(state, responder, JobRequest::FastFocus);
        }
        ScopeCommand::StitchImages => {
            start_job(state, responder, JobRequest::Stitch);
        }
        ScopeCommand::FocusStack => {
            start_job(state, responder, JobRequest::FocusStack);
        }
        ScopeCommand::CellCount => {
            start_job(state, responder, JobRequest::CellCount);
        }
        ScopeCommand::CalibrateSystem => {
            start_job(state, responder, JobRequest::Calibration);
        }
        ScopeCommand::AutoBrightness(request) => {
            start_job(state, responder, JobRequest::AutoBrightness(request.led_type));
        }
        ScopeCommand::GetJobs => responder.send(ScopeEvent::JobsStatus(state.jobs.snapshot())),

        ScopeCommand::ScanWifi => handle_scan_wifi(state, responder).await,
        ScopeCommand::ConnectWifi(request) => spawn_wifi_connect(state, responder, request),
        ScopeCommand::GetWifiStatus => {
            let status = state
                .wifi
                .status()
                .await
                .map_err(|e| cmd_err("get_wifi_status", e))?;
            responder.send(ScopeEvent::WifiStatus(status));
        }
        ScopeCommand::CheckUpdate => spawn_check_update(state, responder),
        ScopeCommand::SystemUpdate(request) => spawn_system_update(state, responder, request),

        ScopeCommand::Close => {
            session.closed = true;
            responder.send(ScopeEvent::Closed(StatusMessage::success("Connection closed")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_validation() {
        assert!(Field::Exposure.validate(12.0).is_ok());
        assert!(Field::Exposure.validate(0.0).is_err());
        assert!(Field::Exposure.validate(f64::NAN).is_err());
        assert!(Field::Led(LedChannel::Reflected).validate(100.0).is_ok());
        assert!(Field::Led(LedChannel::Transmitted).validate(100.5).is_err());
        assert!(Field::RecordingDelay.validate(-1.0).is_err());
    }

    #[test]
    fn test_led_patch_targets_channel() {
        let patch = Field::Led(LedChannel::Transmitted).patch(30.0);
        assert_eq!(patch.led2_value, Some(30.0));
        assert_eq!(patch.led_value, None);
    }

    #[test]
    fn test_cmd_err() {
        let err = cmd_err("move_x", "X step of 10 um is below the minimum of 50 um");
        assert_eq!(err.command, "move_x");
        assert!(err.message.contains("below the minimum"));
    }
}
