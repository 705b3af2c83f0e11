//! Instrument configuration shared by the server and its clients.

use serde::{Deserialize, Serialize};

use crate::types::{Axis, LedChannel, Magnification};

/// Minimum X/Y jog step in micrometres.
pub const MIN_XY_STEP_UM: f64 = 50.0;
/// Minimum Z jog step in micrometres.
pub const MIN_Z_STEP_UM: f64 = 1.0;

/// Current instrument configuration.
///
/// Field names on the wire follow the browser client (`exposure_value`,
/// `x_pos`, ...). Targets are in millimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    #[serde(rename = "exposure_value")]
    pub exposure_ms: f64,
    #[serde(rename = "gain_value")]
    pub gain: f64,
    /// LED levels in percent, indexed by [`LedChannel::index`]
    pub led_levels: [f64; 2],
    #[serde(rename = "r_value")]
    pub r_gain: f64,
    #[serde(rename = "b_value")]
    pub b_gain: f64,
    #[serde(rename = "x_pos")]
    pub x_target: f64,
    #[serde(rename = "y_pos")]
    pub y_target: f64,
    #[serde(rename = "z_pos")]
    pub z_target: f64,
    pub x_step_um: f64,
    pub y_step_um: f64,
    pub z_step_um: f64,
    #[serde(rename = "recording_interval")]
    pub recording_interval_s: f64,
    pub magnification: Magnification,
    #[serde(rename = "show_xyz")]
    pub show_debug_estimates: bool,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            gain: 1.0,
            led_levels: [50.0, 0.0],
            r_gain: 1.0,
            b_gain: 1.0,
            x_target: 0.0,
            y_target: 0.0,
            z_target: 0.0,
            x_step_um: 100.0,
            y_step_um: 100.0,
            z_step_um: 10.0,
            recording_interval_s: 0.0,
            magnification: Magnification::X20,
            show_debug_estimates: false,
        }
    }
}

impl InstrumentSettings {
    pub fn target(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x_target,
            Axis::Y => self.y_target,
            Axis::Z => self.z_target,
        }
    }

    pub fn set_target(&mut self, axis: Axis, mm: f64) {
        match axis {
            Axis::X => self.x_target = mm,
            Axis::Y => self.y_target = mm,
            Axis::Z => self.z_target = mm,
        }
    }

    pub fn step_um(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x_step_um,
            Axis::Y => self.y_step_um,
            Axis::Z => self.z_step_um,
        }
    }

    pub fn led_level(&self, channel: LedChannel) -> f64 {
        self.led_levels[channel.index()]
    }

    /// Full snapshot as a patch with every field present.
    pub fn to_patch(&self) -> SettingsPatch {
        SettingsPatch {
            exposure_value: Some(self.exposure_ms),
            gain_value: Some(self.gain),
            led_value: Some(self.led_levels[0]),
            led2_value: Some(self.led_levels[1]),
            r_value: Some(self.r_gain),
            b_value: Some(self.b_gain),
            x_pos: Some(self.x_target),
            y_pos: Some(self.y_target),
            z_pos: Some(self.z_target),
            x_step_um: Some(self.x_step_um),
            y_step_um: Some(self.y_step_um),
            z_step_um: Some(self.z_step_um),
            recording_interval: Some(self.recording_interval_s),
            magnification: Some(self.magnification),
            show_xyz: Some(self.show_debug_estimates),
        }
    }

    /// Apply every present field of `patch`.
    ///
    /// Applying the same patch twice leaves the settings unchanged the
    /// second time.
    pub fn apply_patch(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.exposure_value {
            self.exposure_ms = v;
        }
        if let Some(v) = patch.gain_value {
            self.gain = v;
        }
        if let Some(v) = patch.led_value {
            self.led_levels[0] = v;
        }
        if let Some(v) = patch.led2_value {
            self.led_levels[1] = v;
        }
        if let Some(v) = patch.r_value {
            self.r_gain = v;
        }
        if let Some(v) = patch.b_value {
            self.b_gain = v;
        }
        if let Some(v) = patch.x_pos {
            self.x_target = v;
        }
        if let Some(v) = patch.y_pos {
            self.y_target = v;
        }
        if let Some(v) = patch.z_pos {
            self.z_target = v;
        }
        if let Some(v) = patch.x_step_um {
            self.x_step_um = v;
        }
        if let Some(v) = patch.y_step_um {
            self.y_step_um = v;
        }
        if let Some(v) = patch.z_step_um {
            self.z_step_um = v;
        }
        if let Some(v) = patch.recording_interval {
            self.recording_interval_s = v;
        }
        if let Some(v) = patch.magnification {
            self.magnification = v;
        }
        if let Some(v) = patch.show_xyz {
            self.show_debug_estimates = v;
        }
    }
}

/// Check a jog step against the per-axis minimum.
pub fn validate_step_um(axis: Axis, step_um: f64) -> Result<(), String> {
    let min = match axis {
        Axis::X | Axis::Y => MIN_XY_STEP_UM,
        Axis::Z => MIN_Z_STEP_UM,
    };
    if !step_um.is_finite() || step_um < min {
        return Err(format!(
            "{axis} step of {step_um} um is below the minimum of {min} um"
        ));
    }
    Ok(())
}

/// Incremental settings update. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led2_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_pos: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_pos: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_pos: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_step_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_step_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_step_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnification: Option<Magnification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_xyz: Option<bool>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }

    pub fn target(axis: Axis, mm: f64) -> Self {
        let mut patch = Self::default();
        match axis {
            Axis::X => patch.x_pos = Some(mm),
            Axis::Y => patch.y_pos = Some(mm),
            Axis::Z => patch.z_pos = Some(mm),
        }
        patch
    }

    pub fn led(channel: LedChannel, level: f64) -> Self {
        let mut patch = Self::default();
        match channel {
            LedChannel::Reflected => patch.led_value = Some(level),
            LedChannel::Transmitted => patch.led2_value = Some(level),
        }
        patch
    }
}

/// The subset of settings persisted by `save_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSettings {
    pub exposure_value: f64,
    pub gain_value: f64,
    pub led_value: f64,
    #[serde(default)]
    pub led2_value: f64,
    pub r_value: f64,
    pub b_value: f64,
    #[serde(default = "default_xy_step")]
    pub x_step_um: f64,
    #[serde(default = "default_xy_step")]
    pub y_step_um: f64,
    #[serde(default = "default_z_step")]
    pub z_step_um: f64,
}

fn default_xy_step() -> f64 {
    100.0
}

fn default_z_step() -> f64 {
    10.0
}

impl From<&InstrumentSettings> for SavedSettings {
    fn from(s: &InstrumentSettings) -> Self {
        Self {
            exposure_value: s.exposure_ms,
            gain_value: s.gain,
            led_value: s.led_levels[0],
            led2_value: s.led_levels[1],
            r_value: s.r_gain,
            b_value: s.b_gain,
            x_step_um: s.x_step_um,
            y_step_um: s.y_step_um,
            z_step_um: s.z_step_um,
        }
    }
}

impl SavedSettings {
    /// Overlay the persisted fields onto `settings`.
    pub fn apply_to(&self, settings: &mut InstrumentSettings) {
        settings.exposure_ms = self.exposure_value;
        settings.gain = self.gain_value;
        settings.led_levels = [self.led_value, self.led2_value];
        settings.r_gain = self.r_value;
        settings.b_gain = self.b_value;
        settings.x_step_um = self.x_step_um;
        settings.y_step_um = self.y_step_um;
        settings.z_step_um = self.z_step_um;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_roundtrip_is_idempotent() {
        let mut settings = InstrumentSettings::default();
        let patch = SettingsPatch {
            exposure_value: Some(12.0),
            ..Default::default()
        };
        settings.apply_patch(&patch);
        let once = settings.clone();
        settings.apply_patch(&patch);
        assert_eq!(once, settings);
        assert_eq!(settings.exposure_ms, 12.0);
    }

    #[test]
    fn test_snapshot_patch_reproduces_settings() {
        let mut original = InstrumentSettings::default();
        original.gain = 4.0;
        original.led_levels = [10.0, 20.0];
        original.magnification = Magnification::X40;

        let mut other = InstrumentSettings::default();
        other.apply_patch(&original.to_patch());
        assert_eq!(original, other);
    }

    #[test]
    fn test_partial_patch_serializes_only_present_fields() {
        let patch = SettingsPatch {
            exposure_value: Some(12.0),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({"exposure_value": 12.0}));
    }

    #[test]
    fn test_step_minimums() {
        assert!(validate_step_um(Axis::X, 49.0).is_err());
        assert!(validate_step_um(Axis::Y, 50.0).is_ok());
        assert!(validate_step_um(Axis::Z, 1.0).is_ok());
        assert!(validate_step_um(Axis::Z, 0.5).is_err());
        assert!(validate_step_um(Axis::X, f64::NAN).is_err());
    }

    #[test]
    fn test_saved_settings_tolerates_legacy_file() {
        let legacy = r#"{"exposure_value": 5.0, "gain_value": 2.0, "led_value": 30,
                         "r_value": 1.2, "b_value": 0.8}"#;
        let saved: SavedSettings = serde_json::from_str(legacy).unwrap();
        let mut settings = InstrumentSettings::default();
        saved.apply_to(&mut settings);
        assert_eq!(settings.exposure_ms, 5.0);
        assert_eq!(settings.led_levels, [30.0, 0.0]);
        assert_eq!(settings.x_step_um, 100.0);
    }
}
