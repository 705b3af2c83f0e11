//! Core identifiers shared by commands, events and the server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Motor steps per millimetre of stage travel.
pub const STEPS_PER_MM: f64 = 1024.0;

/// Motorized degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into per-axis arrays (X=0, Y=1, Z=2).
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Camera pipeline identifier.
///
/// `Main` is the microscope camera, `Aux` the auxiliary overview camera
/// (called `cam1` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraId {
    #[serde(alias = "cam0")]
    Main,
    #[serde(rename = "cam1", alias = "aux")]
    Aux,
}

impl CameraId {
    pub const ALL: [CameraId; 2] = [CameraId::Main, CameraId::Aux];

    /// The camera that is not `self`.
    pub fn other(self) -> CameraId {
        match self {
            CameraId::Main => CameraId::Aux,
            CameraId::Aux => CameraId::Main,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CameraId::Main => "main",
            CameraId::Aux => "cam1",
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "cam0" => Ok(CameraId::Main),
            "aux" | "cam1" => Ok(CameraId::Aux),
            other => Err(format!("unknown camera '{other}'")),
        }
    }
}

/// Illumination channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedChannel {
    /// Epi-illumination from above the sample
    Reflected,
    /// Bright-field illumination through the sample
    Transmitted,
}

impl LedChannel {
    pub const ALL: [LedChannel; 2] = [LedChannel::Reflected, LedChannel::Transmitted];

    pub fn index(self) -> usize {
        match self {
            LedChannel::Reflected => 0,
            LedChannel::Transmitted => 1,
        }
    }
}

impl fmt::Display for LedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedChannel::Reflected => write!(f, "reflected"),
            LedChannel::Transmitted => write!(f, "transmitted"),
        }
    }
}

/// Post-processing mode for the auxiliary camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cam1Mode {
    #[default]
    Normal,
    Perspective,
}

/// Objective magnification. Only the fitted objectives are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Magnification {
    #[default]
    X20,
    X40,
}

impl Magnification {
    pub fn value(self) -> u32 {
        match self {
            Magnification::X20 => 20,
            Magnification::X40 => 40,
        }
    }
}

impl TryFrom<u32> for Magnification {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(Magnification::X20),
            40 => Ok(Magnification::X40),
            other => Err(format!("unsupported magnification {other}x (expected 20 or 40)")),
        }
    }
}

impl From<Magnification> for u32 {
    fn from(m: Magnification) -> u32 {
        m.value()
    }
}

/// Image-processing job families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Stitch,
    FocusStack,
    CellCount,
    AutoBrightness,
    Calibration,
    FastFocus,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Stitch => "stitch",
            JobKind::FocusStack => "focus_stack",
            JobKind::CellCount => "cell_count",
            JobKind::AutoBrightness => "auto_brightness",
            JobKind::Calibration => "calibration",
            JobKind::FastFocus => "fast_focus",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Deserialize an `f64` that may arrive as a JSON number or a numeric string.
///
/// Browser range inputs report their value as a string.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(v) => Ok(v),
        NumOrStr::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("'{s}' is not a number"))),
    }
}

/// Like [`lenient_f64`] but for booleans sent as `"true"`/`"false"`.
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStr {
        Bool(bool),
        Str(String),
    }

    match BoolOrStr::deserialize(deserializer)? {
        BoolOrStr::Bool(b) => Ok(b),
        BoolOrStr::Str(s) => match s.trim() {
            "true" | "1" | "on" => Ok(true),
            "false" | "0" | "off" => Ok(false),
            other => Err(serde::de::Error::custom(format!("'{other}' is not a boolean"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Value {
        #[serde(deserialize_with = "lenient_f64")]
        value: f64,
    }

    #[test]
    fn test_lenient_f64_accepts_numbers_and_strings() {
        let v: Value = serde_json::from_str(r#"{"value": 12}"#).unwrap();
        assert_eq!(v.value, 12.0);
        let v: Value = serde_json::from_str(r#"{"value": "3.5"}"#).unwrap();
        assert_eq!(v.value, 3.5);
        assert!(serde_json::from_str::<Value>(r#"{"value": "abc"}"#).is_err());
    }

    #[test]
    fn test_magnification_rejects_unknown() {
        let m: Magnification = serde_json::from_str("40").unwrap();
        assert_eq!(m, Magnification::X40);
        assert!(serde_json::from_str::<Magnification>("10").is_err());
        assert_eq!(serde_json::to_string(&Magnification::X20).unwrap(), "20");
    }

    #[test]
    fn test_camera_id_aliases() {
        let c: CameraId = serde_json::from_str(r#""cam1""#).unwrap();
        assert_eq!(c, CameraId::Aux);
        assert_eq!(c.other(), CameraId::Main);
        assert_eq!("cam0".parse::<CameraId>().unwrap(), CameraId::Main);
    }
}
