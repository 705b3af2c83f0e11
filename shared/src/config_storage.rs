//! Persistent instrument configuration.
//!
//! Everything the server remembers across restarts lives as JSON files in
//! one directory, `~/.scope_config/` by default:
//!
//! - `settings.json` - exposure, gain, LED, white balance and step sizes
//! - `motor_positions.json` - last known stage position in motor steps
//! - `perspective_transform.json` - auxiliary camera perspective correction
//! - `calibration.json` - measured pixel size

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_wasm::{Axis, SavedSettings};

use crate::image_proc::calibration::PixelCalibration;
use crate::image_proc::perspective::{FusedPerspectiveFile, PerspectiveTransform};

/// Stage position in motor steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMotorPositions {
    pub x_pos: i64,
    pub y_pos: i64,
    pub z_pos: i64,
}

impl StoredMotorPositions {
    pub fn from_steps(steps: [i64; 3]) -> Self {
        Self {
            x_pos: steps[0],
            y_pos: steps[1],
            z_pos: steps[2],
        }
    }

    pub fn get(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.x_pos,
            Axis::Y => self.y_pos,
            Axis::Z => self.z_pos,
        }
    }
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Configuration storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.scope_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".scope_config"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn file(&self, name: &str) -> PathBuf {
        self.root_path.join(name)
    }

    fn get<T: DeserializeOwned>(&self, name: &str) -> Option<std::io::Result<T>> {
        let path = self.file(name);
        if !path.exists() {
            return None;
        }
        Some(load_json(&path))
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.file(name);
        save_json(value, &path)?;
        Ok(path)
    }

    fn delete(&self, name: &str) -> std::io::Result<bool> {
        let path = self.file(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    // =========================================================================
    // Instrument settings
    // =========================================================================

    /// Returns None if nothing was saved yet, Some(Err) if the file is unreadable.
    pub fn get_settings(&self) -> Option<std::io::Result<SavedSettings>> {
        self.get("settings.json")
    }

    pub fn save_settings(&self, settings: &SavedSettings) -> std::io::Result<PathBuf> {
        self.save("settings.json", settings)
    }

    // =========================================================================
    // Motor positions
    // =========================================================================

    pub fn get_motor_positions(&self) -> Option<std::io::Result<StoredMotorPositions>> {
        self.get("motor_positions.json")
    }

    pub fn save_motor_positions(&self, positions: &StoredMotorPositions) -> std::io::Result<PathBuf> {
        self.save("motor_positions.json", positions)
    }

    // =========================================================================
    // Perspective transform
    // =========================================================================

    /// Perspective correction for the auxiliary camera.
    ///
    /// The file uses the calibration tool's layout with the transform nested
    /// under `fused_perspective_transform`.
    pub fn get_perspective_transform(&self) -> Option<std::io::Result<PerspectiveTransform>> {
        self.get::<FusedPerspectiveFile>("perspective_transform.json")
            .map(|r| r.map(|f| f.fused_perspective_transform))
    }

    pub fn save_perspective_transform(
        &self,
        transform: &PerspectiveTransform,
    ) -> std::io::Result<PathBuf> {
        self.save(
            "perspective_transform.json",
            &FusedPerspectiveFile {
                fused_perspective_transform: transform.clone(),
            },
        )
    }

    pub fn delete_perspective_transform(&self) -> std::io::Result<bool> {
        self.delete("perspective_transform.json")
    }

    // =========================================================================
    // Pixel size calibration
    // =========================================================================

    pub fn get_calibration(&self) -> Option<std::io::Result<PixelCalibration>> {
        self.get("calibration.json")
    }

    pub fn save_calibration(&self, calibration: &PixelCalibration) -> std::io::Result<PathBuf> {
        self.save("calibration.json", calibration)
    }

    pub fn delete_calibration(&self) -> std::io::Result<bool> {
        self.delete("calibration.json")
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".scope_config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_storage() -> (tempfile::TempDir, ConfigStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("config"));
        (dir, storage)
    }

    #[test]
    fn test_missing_files_are_none() {
        let (_dir, storage) = create_test_storage();
        assert!(storage.get_settings().is_none());
        assert!(storage.get_motor_positions().is_none());
        assert!(storage.get_perspective_transform().is_none());
        assert!(storage.get_calibration().is_none());
    }

    #[test]
    fn test_save_and_load_motor_positions() {
        let (_dir, storage) = create_test_storage();
        let positions = StoredMotorPositions::from_steps([1024, -50, 7]);
        let path = storage.save_motor_positions(&positions).unwrap();
        assert!(path.ends_with("motor_positions.json"));

        let loaded = storage
            .get_motor_positions()
            .expect("Positions should exist")
            .expect("Positions should load");
        assert_eq!(loaded, positions);
        assert_eq!(loaded.get(Axis::Y), -50);
    }

    #[test]
    fn test_save_and_load_settings() {
        let (_dir, storage) = create_test_storage();
        let mut settings = shared_wasm::InstrumentSettings::default();
        settings.exposure_ms = 25.0;
        storage.save_settings(&SavedSettings::from(&settings)).unwrap();

        let loaded = storage.get_settings().unwrap().unwrap();
        assert_relative_eq!(loaded.exposure_value, 25.0);
    }

    #[test]
    fn test_perspective_file_layout() {
        let (_dir, storage) = create_test_storage();
        let transform = PerspectiveTransform::identity(640, 480);
        let path = storage.save_perspective_transform(&transform).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(
            raw["fused_perspective_transform"]["output_size"],
            serde_json::json!([640, 480])
        );
        assert_eq!(storage.get_perspective_transform().unwrap().unwrap(), transform);

        assert!(storage.delete_perspective_transform().unwrap());
        assert!(!storage.delete_perspective_transform().unwrap());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let (_dir, storage) = create_test_storage();
        std::fs::create_dir_all(storage.root_path()).unwrap();
        std::fs::write(storage.root_path().join("calibration.json"), "{not json").unwrap();

        let err = storage.get_calibration().unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
