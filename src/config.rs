//! Persistent settings.
//!
//! Storage path: `~/.config/ddiscan/config.json` (platform equivalent via
//! [`directories::ProjectDirs`]).
//!
//! ```json
//! {
//!   "range": { "xMax": 3000.0, "yMax": 700.0 },
//!   "grantedDevices": ["/dev/ttyUSB0"]
//! }
//! ```

use ddiscan_core::{DeviceId, RangeConfig};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot encode settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "ddiscan", "ddiscan")
}

/// Location of the settings file, falling back to the working directory
/// when the platform has no notion of a config directory.
pub fn default_config_path() -> PathBuf {
    get_project_dirs()
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub range: RangeConfig,
    pub granted_devices: Vec<DeviceId>,
}

/// Cached settings backed by a JSON file.
///
/// Reads happen once, at construction. Every [`Persistence::update`] writes
/// the whole file.
#[derive(Debug)]
pub struct Persistence {
    /// `None` keeps everything in memory
    path: Option<PathBuf>,
    settings: Mutex<Settings>,
}

impl Persistence {
    pub fn open(path: PathBuf) -> Self {
        let settings = load(&path);
        Persistence {
            path: Some(path),
            settings: Mutex::new(settings),
        }
    }

    pub fn open_default() -> Self {
        Self::open(default_config_path())
    }

    /// Settings that are never written anywhere
    pub fn in_memory(settings: Settings) -> Self {
        Persistence {
            path: None,
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    /// Modify the settings and write them out.
    ///
    /// The in-memory copy is changed even when writing fails.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.settings.lock().unwrap();
        f(&mut settings);
        match &self.path {
            Some(path) => store(path, &settings),
            None => Ok(()),
        }
    }
}

fn load(path: &Path) -> Settings {
    if !path.exists() {
        debug!("No settings at {}, using defaults", path.display());
        return Settings::default();
    }

    match fs::File::open(path) {
        Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to open {}: {}, using defaults", path.display(), e);
            Settings::default()
        }
    }
}

fn store(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_owned(),
        source,
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(io_error)?;
        }
    }

    let file = fs::File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, settings)?;
    writer.write_all(b"\n").map_err(io_error)?;
    writer.flush().map_err(io_error)?;

    debug!("Stored settings -> {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> PathBuf {
        dir.path().join("nested").join(CONFIG_FILE)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let persistence = Persistence::open(config_in(&temp));
        let settings = persistence.settings();
        assert_eq!(settings.range, RangeConfig::new(3000.0, 700.0));
        assert!(settings.granted_devices.is_empty());
    }

    #[test]
    fn test_update_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = config_in(&temp);

        let persistence = Persistence::open(path.clone());
        persistence
            .update(|s| {
                s.range.set_range(1500.0, 400.0);
                s.granted_devices.push(DeviceId::new("/dev/ttyUSB0"));
            })
            .unwrap();
        assert!(path.exists());

        let reopened = Persistence::open(path);
        let settings = reopened.settings();
        assert_eq!(settings.range, RangeConfig::new(1500.0, 400.0));
        assert_eq!(settings.granted_devices, vec![DeviceId::new("/dev/ttyUSB0")]);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        let persistence = Persistence::open(path);
        assert_eq!(persistence.settings(), Settings::default());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"grantedDevices":["COM3"]}"#).unwrap();

        let settings = Persistence::open(path).settings();
        assert_eq!(settings.range, RangeConfig::default());
        assert_eq!(settings.granted_devices, vec![DeviceId::new("COM3")]);
    }

    #[test]
    fn test_in_memory_never_writes() {
        let persistence = Persistence::in_memory(Settings::default());
        persistence.update(|s| s.range.set_range(1.0, 2.0)).unwrap();
        assert!(persistence.path().is_none());
        assert_eq!(persistence.settings().range, RangeConfig::new(1.0, 2.0));
    }
}
