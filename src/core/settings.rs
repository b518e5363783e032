//! Station settings
//!
//! Reads and manages station settings from `config.toml` in the config
//! directory. Every value is optional; the effective value falls back to
//! [`crate::config::defaults`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::orchestrator::OrchestratorConfig;
use crate::config::defaults;
use crate::error::SettingsError;
use crate::infra::dirs::StationDirs;
use crate::infra::filesystem;
use crate::infra::reconnect::ReconnectPolicy;
use crate::infra::upload::UploaderConfig;

/// Station settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Station identity
    #[serde(default)]
    pub station: StationSettings,

    /// File locations
    #[serde(default)]
    pub paths: PathSettings,

    /// Flashing utility
    #[serde(default)]
    pub uploader: UploaderSettings,

    /// Serial port handling
    #[serde(default)]
    pub serial: SerialSettings,

    /// Host monitoring
    #[serde(default)]
    pub monitor: MonitorSettings,
}

/// Station identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationSettings {
    /// Recorded as `programmed_by` in the ledger
    pub station_id: Option<String>,

    /// Operator name, appended to the station id
    pub operator: Option<String>,
}

/// File locations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathSettings {
    /// Ledger file
    pub ledger: Option<PathBuf>,

    /// Profile directory
    pub profiles: Option<PathBuf>,

    /// Artifacts root
    pub artifacts: Option<PathBuf>,
}

/// Flashing utility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploaderSettings {
    /// Program name or path
    pub program: Option<String>,

    /// Upload argument template
    pub args: Option<String>,

    /// Identity probe arguments; empty disables the probe
    pub identity_args: Option<String>,

    /// Identity regex
    pub identity_pattern: Option<String>,

    /// Upload timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Line ending appended to commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// `\r\n`
    Crlf,
    /// `\n`
    Lf,
    /// `\r`
    Cr,
}

impl LineEnding {
    /// Bytes on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crlf => "\r\n",
            Self::Lf => "\n",
            Self::Cr => "\r",
        }
    }
}

/// Serial port handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: Option<u32>,

    /// Command line ending
    pub line_ending: Option<LineEnding>,

    /// Wait for the port after a reset, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Settle window before binding, in milliseconds
    pub settle_ms: Option<u64>,

    /// Open attempts after binding
    pub open_attempts: Option<u32>,

    /// Delay between open attempts, in milliseconds
    pub open_delay_ms: Option<u64>,
}

/// Host monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    /// Poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,

    /// USB vendor id of supported ports; 0 accepts any vendor
    pub vendor_id: Option<u16>,

    /// Upload-mode volume label
    pub volume_label: Option<String>,

    /// Wait for an upload-mode device, in milliseconds
    pub device_timeout_ms: Option<u64>,
}

impl Settings {
    /// Load settings from the config directory
    pub fn load(dirs: &StationDirs) -> Result<Self, SettingsError> {
        Self::load_from_path(&dirs.settings_path())
    }

    /// Load settings from a specific path
    ///
    /// A missing file yields the defaults; an invalid one is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a specific path, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        let write_error = |error: String| SettingsError::Write {
            path: path.to_path_buf(),
            error,
        };
        if let Some(parent) = path.parent() {
            filesystem::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| write_error(e.to_string()))?;
        filesystem::write_atomic(path, &content).map_err(|e| write_error(e.to_string()))
    }

    /// Reject values that would disable a bounded wait
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("uploader.timeout_secs", self.uploader.timeout_secs),
            ("serial.timeout_ms", self.serial.timeout_ms),
            ("monitor.poll_interval_ms", self.monitor.poll_interval_ms),
            ("monitor.device_timeout_ms", self.monitor.device_timeout_ms),
            ("serial.baud_rate", self.serial.baud_rate.map(u64::from)),
            ("serial.open_attempts", self.serial.open_attempts.map(u64::from)),
        ];
        for (key, value) in positive {
            if value == Some(0) {
                return Err(SettingsError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(pattern) = &self.uploader.identity_pattern {
            regex::Regex::new(pattern).map_err(|e| SettingsError::InvalidValue {
                key: "uploader.identity_pattern".to_string(),
                message: e.to_string(),
            })?;
        }
        if let Some(program) = &self.uploader.program {
            if program.trim().is_empty() {
                return Err(SettingsError::InvalidValue {
                    key: "uploader.program".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Identity written to `programmed_by`
    #[must_use]
    pub fn station_id(&self) -> String {
        let station = self
            .station
            .station_id
            .as_deref()
            .unwrap_or(defaults::STATION_ID);
        match &self.station.operator {
            Some(operator) => format!("{station}/{operator}"),
            None => station.to_string(),
        }
    }

    /// Effective ledger path
    #[must_use]
    pub fn ledger_path(&self, dirs: &StationDirs) -> PathBuf {
        self.paths.ledger.clone().unwrap_or_else(|| dirs.ledger_path())
    }

    /// Effective profile directory
    #[must_use]
    pub fn profiles_dir(&self, dirs: &StationDirs) -> PathBuf {
        self.paths
            .profiles
            .clone()
            .unwrap_or_else(|| dirs.profiles_dir())
    }

    /// Effective artifacts root
    #[must_use]
    pub fn artifacts_dir(&self, dirs: &StationDirs) -> PathBuf {
        self.paths
            .artifacts
            .clone()
            .unwrap_or_else(|| dirs.artifacts_dir())
    }

    /// Effective flashing utility configuration
    #[must_use]
    pub fn uploader_config(&self) -> UploaderConfig {
        let u = &self.uploader;
        UploaderConfig {
            program: u
                .program
                .clone()
                .unwrap_or_else(|| defaults::UPLOAD_PROGRAM.to_string()),
            args: u
                .args
                .clone()
                .unwrap_or_else(|| defaults::UPLOAD_ARGS.to_string()),
            identity_args: u
                .identity_args
                .clone()
                .unwrap_or_else(|| defaults::IDENTITY_ARGS.to_string()),
            identity_pattern: u
                .identity_pattern
                .clone()
                .unwrap_or_else(|| defaults::IDENTITY_PATTERN.to_string()),
            timeout: Duration::from_secs(u.timeout_secs.unwrap_or(defaults::UPLOAD_TIMEOUT_SECS)),
        }
    }

    /// Effective baud rate
    #[must_use]
    pub fn baud_rate(&self) -> u32 {
        self.serial.baud_rate.unwrap_or(defaults::BAUD_RATE)
    }

    /// Effective line ending
    #[must_use]
    pub fn line_ending(&self) -> &'static str {
        self.serial
            .line_ending
            .map_or(defaults::LINE_ENDING, LineEnding::as_str)
    }

    /// Effective reconnection windows
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            timeout: Duration::from_millis(
                self.serial.timeout_ms.unwrap_or(defaults::SERIAL_TIMEOUT_MS),
            ),
            settle: Duration::from_millis(
                self.serial.settle_ms.unwrap_or(defaults::SETTLE_WINDOW_MS),
            ),
        }
    }

    /// Effective poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.monitor
                .poll_interval_ms
                .unwrap_or(defaults::POLL_INTERVAL_MS),
        )
    }

    /// Vendor filter for ports; `None` accepts any vendor
    #[must_use]
    pub fn vendor_id(&self) -> Option<u16> {
        match self.monitor.vendor_id {
            Some(0) => None,
            Some(vid) => Some(vid),
            None => Some(defaults::USB_VENDOR_ID),
        }
    }

    /// Effective upload-mode volume label
    #[must_use]
    pub fn volume_label(&self) -> &str {
        self.monitor
            .volume_label
            .as_deref()
            .unwrap_or(defaults::VOLUME_LABEL)
    }

    /// Orchestrator configuration from these settings
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            station_id: self.station_id(),
            device_timeout: Duration::from_millis(
                self.monitor
                    .device_timeout_ms
                    .unwrap_or(defaults::DEVICE_TIMEOUT_MS),
            ),
            reconnect: self.reconnect_policy(),
            open_attempts: self
                .serial
                .open_attempts
                .unwrap_or(defaults::PORT_OPEN_ATTEMPTS),
            open_delay: Duration::from_millis(
                self.serial
                    .open_delay_ms
                    .unwrap_or(defaults::PORT_OPEN_DELAY_MS),
            ),
        }
    }
}
