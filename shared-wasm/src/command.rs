//! Client-to-server commands sent over the `/ws` WebSocket.
//!
//! Sent as JSON text frames: `{"type": "set_exposure", "data": {"value": 12}}`.
//! Commands without a payload omit `data`.

use serde::{Deserialize, Serialize};

use crate::types::{lenient_bool, lenient_f64, Cam1Mode, CameraId, LedChannel};

/// Payload carrying a single numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRequest {
    #[serde(deserialize_with = "lenient_f64")]
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlagRequest {
    #[serde(deserialize_with = "lenient_bool")]
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordingRequest {
    /// Seconds between frames; 0 records continuously
    #[serde(default, deserialize_with = "lenient_f64")]
    pub interval: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JogRequest {
    /// Signed jog distance in micrometres
    #[serde(deserialize_with = "lenient_f64")]
    pub step_size_um: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusJogRequest {
    /// Signed Z jog in micrometres
    #[serde(deserialize_with = "lenient_f64")]
    pub steps: f64,
}

/// Step sizes persisted together with the camera settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SaveConfigRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_step_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_step_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_step_um: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoBrightnessRequest {
    pub led_type: LedChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cam1ModeRequest {
    pub mode: Cam1Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConnectRequest {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemUpdateRequest {
    /// Remote name or URL to pull from; server default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVideoRequest {
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub camera: CameraId,
}

/// Every command the server understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ScopeCommand {
    GetSettings,
    SetExposure(ValueRequest),
    SetGain(ValueRequest),
    /// Reflected LED level (percent)
    SetLed(ValueRequest),
    /// Transmitted LED level (percent)
    SetLed2(ValueRequest),
    SetRBal(ValueRequest),
    SetBBal(ValueRequest),
    SetRecordingDelay(ValueRequest),
    SetXPos(ValueRequest),
    SetYPos(ValueRequest),
    SetZPos(ValueRequest),
    SetMagnification(ValueRequest),
    ToggleShowXyz(FlagRequest),
    SaveConfig(Option<SaveConfigRequest>),

    MoveX(JogRequest),
    MoveY(JogRequest),
    MoveZ(FocusJogRequest),
    StopMove,

    Capture,
    CaptureCam1,
    StartRecording(Option<RecordingRequest>),
    StopRecording,
    StartRecordingCam1(Option<RecordingRequest>),
    StopRecordingCam1,
    DeleteVideo(DeleteVideoRequest),
    SetCam1Mode(Cam1ModeRequest),
    StartStream(StreamRequest),
    StopStream(StreamRequest),
    GetStreamStats,

    FastFocus,
    StitchImages,
    FocusStack,
    CellCount,
    CalibrateSystem,
    AutoBrightness(AutoBrightnessRequest),
    GetJobs,

    ScanWifi,
    ConnectWifi(WifiConnectRequest),
    GetWifiStatus,
    CheckUpdate,
    SystemUpdate(Option<SystemUpdateRequest>),

    Close,
}

impl ScopeCommand {
    /// Wire name of the command, used in error reports.
    pub fn name(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}
