// SPDX-License-Identifier: MIT
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{ProjectDirs, UserDirs};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RECORDINGS_DIR_NAME: &str = "RadarRecordings";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Runtime settings. Every field has a default, so a settings file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub recordings_dir: PathBuf,
    pub capture_interval_ms: u64,
    pub replay_speed: f64,
    /// Seconds between status lines while recording; 0 disables them.
    pub status_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            capture_interval_ms: 1000,
            replay_speed: 1.0,
            status_interval_secs: 5,
        }
    }
}

fn default_recordings_dir() -> PathBuf {
    UserDirs::new().map_or_else(
        || PathBuf::from(RECORDINGS_DIR_NAME),
        |dirs| dirs.home_dir().join(RECORDINGS_DIR_NAME),
    )
}

/// Location of the settings file used when none is given explicitly.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "trackrec").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl Settings {
    /// Loads settings from `path`, or from the default location if it exists,
    /// or falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read, or any
    /// file that is read does not parse or validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reads a settings file without validating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("settings loaded from {}", path.display());
        Ok(settings)
    }

    /// # Errors
    ///
    /// Rejects a zero capture interval and a replay speed that is not a
    /// finite positive number.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "captureIntervalMs must be greater than zero".into(),
            ));
        }
        if !self.replay_speed.is_finite() || self.replay_speed <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "replaySpeed must be a positive number, got {}",
                self.replay_speed
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    #[must_use]
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("settings.json");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.capture_interval(), Duration::from_secs(1));
        assert!((settings.replay_speed - 1.0).abs() < f64::EPSILON);
        assert_eq!(settings.status_interval(), Some(Duration::from_secs(5)));
        assert!(settings.recordings_dir.ends_with(RECORDINGS_DIR_NAME));
        settings.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{ "recordingsDir": "/data/sessions", "captureIntervalMs": 250 }"#,
        );

        let settings = Settings::load(Some(path.as_path())).unwrap();
        assert_eq!(settings.recordings_dir, PathBuf::from("/data/sessions"));
        assert_eq!(settings.capture_interval(), Duration::from_millis(250));
        assert_eq!(settings.status_interval_secs, 5);
    }

    #[test]
    fn zero_status_interval_disables_status_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{ "statusIntervalSecs": 0 }"#);
        assert_eq!(Settings::load(Some(path.as_path())).unwrap().status_interval(), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let path = write(dir.path(), r#"{ "captureIntervalMs": 0 }"#);
        assert!(matches!(
            Settings::load(Some(path.as_path())),
            Err(ConfigError::Invalid(_))
        ));

        let path = write(dir.path(), r#"{ "replaySpeed": -1.0 }"#);
        assert!(matches!(
            Settings::load(Some(path.as_path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unreadable_or_malformed_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Settings::load(Some(dir.path().join("missing.json").as_path())),
            Err(ConfigError::Read { .. })
        ));

        let path = write(dir.path(), "{ not json");
        assert!(matches!(
            Settings::load(Some(path.as_path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let json = serde_json::to_string(&Settings::default()).unwrap();
        assert!(json.contains("\"captureIntervalMs\":1000"));
        assert!(json.contains("\"statusIntervalSecs\":5"));
    }
}
