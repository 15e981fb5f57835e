//! Acquisition settings that are not part of a plan.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the controller keeps gather files, and how long to wait on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    /// Controller-side file the encoded settings are written to
    pub settings_path: String,
    /// Controller-side file the buffer is uploaded to
    pub output_path: String,
    /// Delay between two status polls, in milliseconds
    pub poll_interval_ms: u64,
    /// How long to collect leftover session output after a program run, in milliseconds
    pub drain_timeout_ms: u64,
    /// Timeout for uploading and downloading the buffer, in seconds
    pub upload_timeout_secs: f64,
    /// How long a program run may take to start capturing, in milliseconds (unbounded if unset)
    pub start_timeout_ms: Option<u64>,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            settings_path: "/var/ftp/gather/GatherSetting.txt".to_string(),
            output_path: "/var/ftp/gather/GatherFile.txt".to_string(),
            poll_interval_ms: 100,
            drain_timeout_ms: 100,
            upload_timeout_secs: 60.0,
            start_timeout_ms: None,
        }
    }
}

impl GatherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.upload_timeout_secs).unwrap_or(Duration::ZERO)
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_ms.map(Duration::from_millis)
    }

    /// Check values that serde accepts but the acquisition cannot use.
    pub fn validate(&self) -> Result<(), String> {
        if !self.upload_timeout_secs.is_finite() || self.upload_timeout_secs <= 0.0 {
            return Err(format!(
                "upload_timeout_secs must be a positive number of seconds, got {}",
                self.upload_timeout_secs
            ));
        }
        Ok(())
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }
}
