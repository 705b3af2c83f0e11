//! Saved artifacts (photos, videos, job results).
//!
//! Files live flat in one directory, named after their capture time
//! (`%Y%m%d-%H%M%S.<ext>`), and are served read-only under `/media`.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Invalid filename '{0}'")]
    InvalidFilename(String),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    dir: PathBuf,
}

impl MediaStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Unused timestamped name with `extension`. Names taken within the
    /// same second get a `-1`, `-2`, ... suffix.
    pub fn timestamped_name(&self, extension: &str) -> String {
        self.timestamped_name_at(Local::now(), extension)
    }

    pub fn timestamped_name_at(&self, time: DateTime<Local>, extension: &str) -> String {
        let stem = time.format("%Y%m%d-%H%M%S").to_string();
        let mut name = format!("{stem}.{extension}");
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{stem}-{n}.{extension}");
            n += 1;
        }
        name
    }

    /// Write `bytes` under a fresh timestamped name and return the name.
    pub fn save(&self, extension: &str, bytes: &[u8]) -> io::Result<String> {
        let name = self.timestamped_name(extension);
        std::fs::write(self.dir.join(&name), bytes)?;
        tracing::info!("Saved {} ({} bytes)", name, bytes.len());
        Ok(name)
    }

    /// Path of a stored file. Only bare file names are accepted.
    pub fn path_of(&self, filename: &str) -> Result<PathBuf, MediaError> {
        let valid = !filename.is_empty()
            && !filename.contains(['/', '\\', '\0'])
            && filename != "."
            && filename != ".."
            && Path::new(filename).file_name() == Some(filename.as_ref());
        if !valid {
            return Err(MediaError::InvalidFilename(filename.to_string()));
        }
        Ok(self.dir.join(filename))
    }

    pub fn delete(&self, filename: &str) -> Result<(), MediaError> {
        let path = self.path_of(filename)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Deleted {filename}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(MediaError::NotFound(filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_uses_timestamp_and_avoids_collisions() {
        let tmp = TempDir::new().unwrap();
        let store = MediaStore::new(tmp.path()).unwrap();

        let first = store.save("jpeg", b"one").unwrap();
        let second = store.save("jpeg", b"two").unwrap();
        assert_ne!(first, second);
        assert!(first.ends_with(".jpeg"));
        // YYYYmmdd-HHMMSS
        assert_eq!(first.split('.').next().unwrap().len(), 15);
        assert_eq!(std::fs::read(tmp.path().join(&second)).unwrap(), b"two");
    }

    #[test]
    fn test_delete_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = MediaStore::new(tmp.path().join("media")).unwrap();
        for name in ["../settings.json", "..", "", "a/b.avi", "..\\x.avi"] {
            assert!(matches!(
                store.delete(name),
                Err(MediaError::InvalidFilename(_))
            ));
        }
    }

    #[test]
    fn test_delete_removes_file() {
        let tmp = TempDir::new().unwrap();
        let store = MediaStore::new(tmp.path()).unwrap();
        let name = store.save("avi", b"RIFF").unwrap();

        store.delete(&name).unwrap();
        assert!(!tmp.path().join(&name).exists());
        assert!(matches!(store.delete(&name), Err(MediaError::NotFound(_))));
    }
}
