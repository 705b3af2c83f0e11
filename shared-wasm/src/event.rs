//! Server-to-client events sent over the `/ws` WebSocket.
//!
//! Uses the same tagged layout as [`ScopeCommand`](crate::ScopeCommand):
//! `{"type": "motor_positions", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::log::LogLevel;
use crate::settings::SettingsPatch;
use crate::types::{CameraId, JobKind, JobState, LedChannel};
use crate::wifi::{WifiNetwork, WifiStatus};

/// Result of a single-field setter (`exposure_set`, `x_pos_set`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FieldSetResult {
    Success { value: serde_json::Value },
    Error { message: String },
}

impl FieldSetResult {
    pub fn success(value: impl Into<serde_json::Value>) -> Self {
        FieldSetResult::Success {
            value: value.into(),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        FieldSetResult::Error {
            message: message.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FieldSetResult::Success { .. })
    }
}

/// Periodic stage telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorPositions {
    /// Current positions in mm, rounded to 3 decimals
    pub x_pos: f64,
    pub y_pos: f64,
    pub z_pos: f64,
    /// True while any axis is moving
    pub motor_status: bool,
    /// Debug position estimates derived from the axis sensors
    pub x_vol: f64,
    pub y_vol: f64,
    pub z_vol: f64,
}

/// Target reconciliation after a move has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPositions {
    pub x_target: f64,
    pub y_target: f64,
    pub z_target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveStatus {
    pub status: bool,
    pub message: String,
}

/// Generic `{status, message}` notice used by job start, config save, close
/// and update progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: String,
    pub message: String,
}

impl StatusMessage {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn started(message: impl Into<String>) -> Self {
        Self::new("started", message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new("success", message)
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::new("error", message.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub recording: bool,
    pub message: String,
    pub interval: f64,
}

/// Response carrying a base64 artifact (photo, video, stitched/stacked image).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Base64 encoded file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Base64 JPEG depth map (focus stacking only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depthmap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactResponse {
    pub fn ok(filename: impl Into<String>, data: String) -> Self {
        Self {
            success: true,
            filename: Some(filename.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellCountResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Mean cell diameter in micrometres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_diameter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationResponse {
    pub success: bool,
    /// Micrometres per pixel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoBrightnessProgress {
    pub led_type: LedChannel,
    pub current: u32,
    pub total: u32,
    pub level: f64,
    pub metric: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoBrightnessResponse {
    pub success: bool,
    pub led_type: LedChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusComplete {
    pub status: String,
    /// Final Z position in mm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WifiScanResult {
    pub success: bool,
    pub networks: Vec<WifiNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConnectResult {
    pub success: bool,
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub update_available: bool,
    /// Summary of the latest revision (commit subject)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRequired {
    /// Seconds until the service restarts
    pub restart_delay: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrame {
    /// Base64 JPEG
    pub frame: String,
    pub frame_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionDetected {
    pub camera: CameraId,
    /// Fraction of pixels that changed, 0-1
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVideoResponse {
    pub success: bool,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Inbound statistics for one camera pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub camera: Option<CameraId>,
    pub name: String,
    pub streaming: bool,
    pub width: u32,
    pub height: u32,
    pub avg_fps: f32,
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub subscribers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatsReport {
    pub streams: Vec<StreamStats>,
}

/// One row of the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<LedChannel>,
    pub state: JobState,
    pub current: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsStatus {
    pub jobs: Vec<JobRecord>,
}

/// Error from a command that has no dedicated response event, or that
/// could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    /// Which command failed (wire name)
    pub command: String,
    /// Human-readable error message
    pub message: String,
}

/// Every event the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ScopeEvent {
    SettingsUpdate(SettingsPatch),
    ExposureSet(FieldSetResult),
    GainSet(FieldSetResult),
    LedSet(FieldSetResult),
    Led2Set(FieldSetResult),
    RBalSet(FieldSetResult),
    BBalSet(FieldSetResult),
    RecordingDelaySet(FieldSetResult),
    XPosSet(FieldSetResult),
    YPosSet(FieldSetResult),
    ZPosSet(FieldSetResult),
    MagnificationSet(FieldSetResult),
    ShowXyzSet(FieldSetResult),
    Cam1ModeSet(FieldSetResult),
    ConfigSaved(StatusMessage),

    MotorPositions(MotorPositions),
    TargetPositionsUpdate(TargetPositions),
    MoveStatus(MoveStatus),

    CaptureResponse(ArtifactResponse),
    CaptureCam1Response(ArtifactResponse),
    RecordingStatus(RecordingStatus),
    RecordingResponse(ArtifactResponse),
    RecordingCam1Status(RecordingStatus),
    RecordingCam1Response(ArtifactResponse),
    DeleteVideoResponse(DeleteVideoResponse),
    VideoFrame(VideoFrame),
    VideoFrameCam1(VideoFrame),
    MotionDetected(MotionDetected),
    StreamStats(StreamStatsReport),

    StitchStatus(StatusMessage),
    StitchProgress(Progress),
    StitchResponse(ArtifactResponse),
    FocusStackStatus(StatusMessage),
    FocusStackProgress(Progress),
    FocusStackResponse(ArtifactResponse),
    CellCountStatus(StatusMessage),
    CellCountResponse(CellCountResponse),
    CalibrationStatus(StatusMessage),
    CalibrationResponse(CalibrationResponse),
    AutoBrightnessStatus(StatusMessage),
    AutoBrightnessProgress(AutoBrightnessProgress),
    AutoBrightnessResponse(AutoBrightnessResponse),
    FocusComplete(FocusComplete),
    JobsStatus(JobsStatus),

    WifiStatus(WifiStatus),
    WifiScanResult(WifiScanResult),
    WifiConnectResult(WifiConnectResult),
    UpdateCheckResult(UpdateCheckResult),
    UpdateStatus(StatusMessage),
    UpdateResult(UpdateResult),
    SystemRestartRequired(RestartRequired),

    LogMessage(LogMessage),
    Closed(StatusMessage),
    CommandError(CommandError),
}

impl ScopeEvent {
    /// Wire name of the event.
    pub fn name(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Camera of a `video_frame` push, which only opted-in clients receive.
    pub fn pushed_frame_camera(&self) -> Option<CameraId> {
        match self {
            ScopeEvent::VideoFrame(_) => Some(CameraId::Main),
            ScopeEvent::VideoFrameCam1(_) => Some(CameraId::Aux),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_set_wire_format() {
        let ev = ScopeEvent::ExposureSet(FieldSetResult::error("camera offline"));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "exposure_set",
                "data": {"status": "error", "message": "camera offline"}
            })
        );

        let ev = ScopeEvent::XPosSet(FieldSetResult::success(1.5));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "x_pos_set");
        assert_eq!(json["data"]["status"], "success");
        assert_eq!(json["data"]["value"], 1.5);
    }

    #[test]
    fn test_cam1_event_names() {
        let ev = ScopeEvent::RecordingCam1Status(RecordingStatus {
            recording: true,
            message: "Recording".into(),
            interval: 0.0,
        });
        assert_eq!(ev.name(), "recording_cam1_status");
        assert_eq!(
            ScopeEvent::VideoFrameCam1(VideoFrame {
                frame: String::new(),
                frame_number: 0
            })
            .name(),
            "video_frame_cam1"
        );
    }

    #[test]
    fn test_pushed_frame_camera() {
        let frame = VideoFrame {
            frame: String::new(),
            frame_number: 1,
        };
        assert_eq!(
            ScopeEvent::VideoFrame(frame.clone()).pushed_frame_camera(),
            Some(CameraId::Main)
        );
        assert_eq!(
            ScopeEvent::VideoFrameCam1(frame).pushed_frame_camera(),
            Some(CameraId::Aux)
        );
        assert_eq!(
            ScopeEvent::Closed(StatusMessage::success("bye")).pushed_frame_camera(),
            None
        );
    }

    #[test]
    fn test_artifact_failure_omits_payload() {
        let json = serde_json::to_value(ArtifactResponse::failed("No video file found")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": false, "error": "No video file found"})
        );
    }

    #[test]
    fn test_event_roundtrip_settings_update() {
        let ev = ScopeEvent::SettingsUpdate(SettingsPatch {
            exposure_value: Some(12.0),
            ..Default::default()
        });
        let text = serde_json::to_string(&ev).unwrap();
        let back: ScopeEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(ev, back);
    }
}
