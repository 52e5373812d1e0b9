//! JSON configuration file for the `camcal` tool.

use crate::measure::MeasureConfig;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn default_join_timeout_ms() -> u64 {
    1000
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("calibration.xml")
}

fn default_measurement_path() -> PathBuf {
    PathBuf::from("measurements.xml")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamcalConfig {
    #[serde(default)]
    pub camera_index: usize,
    #[serde(default)]
    pub calibration: SessionConfig,
    #[serde(default)]
    pub measurement: MeasureConfig,
    /// Where calibrations are saved and loaded by default.
    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
    #[serde(default = "default_measurement_path")]
    pub measurement_path: PathBuf,
    /// Longest wait for a cancelled worker.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for CamcalConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            calibration: SessionConfig::default(),
            measurement: MeasureConfig::default(),
            calibration_path: default_calibration_path(),
            measurement_path: default_measurement_path(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl CamcalConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigIoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
