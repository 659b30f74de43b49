//! Configuration types and loading
//!
//! Settings for the session and the HID link, stored as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::hid::HidLinkConfig;
use crate::link::BdAddr;
use crate::session::SessionConfig;

/// Config file name inside a config directory
pub const CONFIG_FILE: &str = "config.json";

/// Application directory under the user's config dir
pub const APP_DIR: &str = "wiimote-session";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration name/description
    #[serde(default)]
    pub name: String,

    /// Device address, "00:00:00:00:00:00" for any
    #[serde(default)]
    pub address: BdAddr,

    /// Stream accelerometer reports
    #[serde(default = "default_true")]
    pub accelerometer: bool,

    /// Reader poll interval in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u32,

    /// Calibration query timeout in milliseconds
    #[serde(default = "default_calibration_timeout")]
    pub calibration_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_read_timeout() -> u32 {
    10
}

fn default_calibration_timeout() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Default Configuration".to_string(),
            address: BdAddr::ANY,
            accelerometer: default_true(),
            read_timeout_ms: default_read_timeout(),
            calibration_timeout_ms: default_calibration_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from a directory containing `config.json`.
    ///
    /// A missing file yields the defaults.
    pub fn load_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.is_dir() {
            return Self::load(path);
        }

        let main_config = path.join(CONFIG_FILE);
        if main_config.exists() {
            return Self::load(&main_config);
        }

        Ok(Config::default())
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// `<config dir>/wiimote-session`, or the working directory
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            address: self.address,
            accelerometer: self.accelerometer,
        }
    }

    pub fn link_config(&self) -> HidLinkConfig {
        HidLinkConfig {
            read_timeout_ms: self.read_timeout_ms.min(i32::MAX as u32) as i32,
            calibration_timeout: Duration::from_millis(self.calibration_timeout_ms),
        }
    }
}
