//! Per-serial artifact directories
//!
//! Every unit gets `<root>/<serial>/` with fixed subdirectories. Sessions
//! leave their transcript under `logs/` and a JSON summary under `results/`;
//! the remaining directories are for test fixtures that attach their own
//! files.

use std::path::{Path, PathBuf};

use crate::core::ledger::sanitize_serial;
use crate::core::session::SessionReport;
use crate::error::FilesystemError;

use super::filesystem;

/// Subdirectories created for every serial
pub const SUBDIRS: &[&str] = &["logs", "results", "calibration", "measurements", "tests"];

/// Output directory tree rooted at the configured artifacts root
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// Files written for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    /// Transcript
    pub log: PathBuf,
    /// JSON summary
    pub summary: PathBuf,
}

impl ArtifactStore {
    /// Store under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `serial`
    pub fn serial_dir(&self, serial: &str) -> PathBuf {
        self.root.join(sanitize_serial(serial))
    }

    /// Create the directory tree of `serial`
    pub fn prepare(&self, serial: &str) -> Result<PathBuf, FilesystemError> {
        let dir = self.serial_dir(serial);
        for sub in SUBDIRS {
            filesystem::create_dir_all(&dir.join(sub))?;
        }
        Ok(dir)
    }

    /// Write the transcript and summary of a finished session
    pub fn write_session(
        &self,
        report: &SessionReport,
        transcript: &str,
    ) -> Result<SessionFiles, FilesystemError> {
        let serial = report.serial_number.as_deref().unwrap_or("unassigned");
        let dir = self.prepare(serial)?;
        let stamp = report.started_at.format("%Y%m%d_%H%M%S%3f");

        let log = dir.join("logs").join(format!("session_{stamp}.log"));
        filesystem::write_file(&log, transcript)?;

        let summary = dir.join("results").join(format!("session_{stamp}.json"));
        let json =
            serde_json::to_string_pretty(report).map_err(|e| FilesystemError::WriteFile {
                path: summary.clone(),
                error: e.to_string(),
            })?;
        filesystem::write_atomic(&summary, &json)?;

        tracing::debug!("Session artifacts written to {}", dir.display());
        Ok(SessionFiles { log, summary })
    }
}
