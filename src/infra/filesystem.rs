//! Filesystem operations
//!
//! Handles file and directory operations, atomic replacement and
//! `create_new` lock files.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Write content to a file
pub fn write_file(path: &Path, content: &str) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Replace `path` with `content` without ever exposing a partial file
///
/// The content goes to a temporary file in the same directory, is synced,
/// and is then renamed over the destination.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), FilesystemError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    create_dir_all(&parent)?;

    let replace_err = |e: &dyn std::fmt::Display| FilesystemError::Replace {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    let mut temp = NamedTempFile::new_in(&parent).map_err(|e| replace_err(&e))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| replace_err(&e))?;
    temp.as_file().sync_all().map_err(|e| replace_err(&e))?;
    temp.persist(path).map_err(|e| replace_err(&e.error))?;
    Ok(())
}

/// Exclusive lock file, removed on drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create the lock file, failing immediately if it already exists
    pub fn acquire(path: &Path, owner: &str) -> Result<Self, FilesystemError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    FilesystemError::LockHeld {
                        path: path.to_path_buf(),
                    }
                } else {
                    FilesystemError::Lock {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    }
                }
            })?;
        // Owner line is informational; a failed write still leaves a valid lock.
        let _ = writeln!(file, "{owner}");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a lock file left behind by a crashed process
    pub fn break_stale(path: &Path) -> Result<bool, FilesystemError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FilesystemError::Lock {
                path: path.to_path_buf(),
                error: e.to_string(),
            }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}
