//! Platform-specific directory management
//!
//! Provides the station's config and data directories. Follows the XDG Base
//! Directory Specification on Linux and standard locations on macOS.
//!
//! Environment variables can override default directories:
//! - `PROVISIONER_CONFIG_DIR` - Override config directory
//! - `PROVISIONER_DATA_DIR` - Override data directory

use std::env;
use std::path::PathBuf;

/// Environment variable names for directory overrides
pub const ENV_CONFIG_DIR: &str = "PROVISIONER_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "PROVISIONER_DATA_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "provisioner";

/// Subdirectory names
const PROFILES_SUBDIR: &str = "profiles";
const ARTIFACTS_SUBDIR: &str = "artifacts";

/// Platform-specific directory provider for the station
#[derive(Debug, Clone)]
pub struct StationDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl StationDirs {
    /// Create a new `StationDirs` instance
    ///
    /// Checks environment variables first, then falls back to platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_dir: Self::resolve_config_dir(),
            data_dir: Self::resolve_data_dir(),
        }
    }

    /// Get the config directory path
    ///
    /// - Linux: `$XDG_CONFIG_HOME/provisioner` or `~/.config/provisioner`
    /// - macOS: `~/Library/Application Support/provisioner`
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Get the data directory path
    ///
    /// Holds the ledger and session artifacts.
    /// - Linux: `$XDG_DATA_HOME/provisioner` or `~/.local/share/provisioner`
    /// - macOS: `~/Library/Application Support/provisioner`
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Default profile directory, under the config directory
    #[must_use]
    pub fn profiles_dir(&self) -> PathBuf {
        self.config_dir.join(PROFILES_SUBDIR)
    }

    /// Default artifacts root, under the data directory
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join(ARTIFACTS_SUBDIR)
    }

    /// Default ledger path, under the data directory
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(crate::config::defaults::LEDGER_FILE)
    }

    /// Station settings file path
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    fn resolve_config_dir() -> PathBuf {
        if let Ok(path) = env::var(ENV_CONFIG_DIR) {
            return PathBuf::from(path);
        }

        Self::platform_config_dir()
    }

    fn resolve_data_dir() -> PathBuf {
        if let Ok(path) = env::var(ENV_DATA_DIR) {
            return PathBuf::from(path);
        }

        Self::platform_data_dir()
    }

    fn platform_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config").join(APP_NAME))
                    .unwrap_or_else(|| PathBuf::from(".").join(".config").join(APP_NAME))
            })
    }

    fn platform_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".local").join("share").join(APP_NAME))
                    .unwrap_or_else(|| {
                        PathBuf::from(".")
                            .join(".local")
                            .join("share")
                            .join(APP_NAME)
                    })
            })
    }
}

impl Default for StationDirs {
    fn default() -> Self {
        Self::new()
    }
}
