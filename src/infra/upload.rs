//! Firmware upload through the external flashing utility
//!
//! The utility is treated as a transaction: it either exits 0 within the
//! upload timeout or the upload failed, and provisioning never starts.
//! Before uploading, the executor can probe the device for an existing
//! firmware identity so that programmed units are not overwritten by
//! accident.

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::monitor::DeviceRef;
use crate::config::defaults;
use crate::error::{SessionFailure, SettingsError};

/// Environment variable carrying the artifact path to the utility
pub const ENV_ARTIFACT: &str = "PROVISIONER_ARTIFACT";

/// Environment variable carrying the target device to the utility
pub const ENV_DEVICE: &str = "PROVISIONER_DEVICE";

/// How long output readers may lag behind the utility's exit
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Firmware artifact format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// ELF image
    Elf,
    /// Intel HEX
    Hex,
    /// UF2 container
    Uf2,
}

/// Validated firmware artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    /// Path to the artifact
    pub path: PathBuf,
    /// Format from the extension
    pub format: ArtifactFormat,
    /// Size in bytes
    pub size: u64,
    /// Hex SHA-256 of the content
    pub sha256: String,
}

fn artifact_failure(reason: String) -> SessionFailure {
    SessionFailure::UploadFailed {
        reason,
        exit_code: None,
        output: String::new(),
    }
}

/// Check that an artifact exists, has an accepted format and plausible size
pub fn inspect_artifact(path: &Path) -> Result<ArtifactInfo, SessionFailure> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let format = match extension.as_str() {
        "elf" => ArtifactFormat::Elf,
        "hex" => ArtifactFormat::Hex,
        "uf2" => ArtifactFormat::Uf2,
        _ => {
            return Err(artifact_failure(format!(
                "unsupported artifact '{}' (accepted: {})",
                path.display(),
                defaults::ARTIFACT_EXTENSIONS.join(", ")
            )))
        }
    };

    let content = std::fs::read(path).map_err(|e| {
        artifact_failure(format!("cannot read artifact '{}': {e}", path.display()))
    })?;
    let size = content.len() as u64;
    if !(defaults::MIN_ARTIFACT_SIZE..=defaults::MAX_ARTIFACT_SIZE).contains(&size) {
        return Err(artifact_failure(format!(
            "artifact '{}' is {size} bytes (expected {}..={} bytes)",
            path.display(),
            defaults::MIN_ARTIFACT_SIZE,
            defaults::MAX_ARTIFACT_SIZE
        )));
    }

    Ok(ArtifactInfo {
        path: path.to_path_buf(),
        format,
        size,
        sha256: hex::encode(Sha256::digest(&content)),
    })
}

/// Flashing utility invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderConfig {
    /// Program name or path
    pub program: String,
    /// Upload argument template
    pub args: String,
    /// Identity probe arguments; empty disables the probe
    pub identity_args: String,
    /// Identity regex; group 1 is the identity
    pub identity_pattern: String,
    /// Upper bound for one invocation
    pub timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            program: defaults::UPLOAD_PROGRAM.to_string(),
            args: defaults::UPLOAD_ARGS.to_string(),
            identity_args: defaults::IDENTITY_ARGS.to_string(),
            identity_pattern: defaults::IDENTITY_PATTERN.to_string(),
            timeout: Duration::from_secs(defaults::UPLOAD_TIMEOUT_SECS),
        }
    }
}

/// Captured output of one utility run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock duration
    pub elapsed_ms: u64,
}

impl ToolOutput {
    /// Whether the utility exited 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr together
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Runs the flashing utility
#[derive(Debug, Clone)]
pub struct UploadExecutor {
    config: UploaderConfig,
    identity: Regex,
}

impl UploadExecutor {
    /// Executor for the given utility configuration
    pub fn new(config: UploaderConfig) -> Result<Self, SettingsError> {
        let identity =
            Regex::new(&config.identity_pattern).map_err(|e| SettingsError::InvalidValue {
                key: "uploader.identity_pattern".to_string(),
                message: e.to_string(),
            })?;
        if config.timeout.is_zero() {
            return Err(SettingsError::InvalidValue {
                key: "uploader.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(Self { config, identity })
    }

    /// Configuration in use
    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Upload `artifact`; any outcome other than exit 0 is `UploadFailed`
    pub async fn upload(
        &self,
        artifact: &ArtifactInfo,
        device: Option<&DeviceRef>,
    ) -> Result<ToolOutput, SessionFailure> {
        let args = build_args(&self.config.args, Some(&artifact.path), device);
        tracing::info!(
            "Uploading {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.size,
            &artifact.sha256[..12.min(artifact.sha256.len())]
        );

        let output = self.run(&args, Some(&artifact.path), device).await?;
        if output.success() {
            tracing::info!("Upload finished in {} ms", output.elapsed_ms);
            Ok(output)
        } else {
            tracing::warn!("Flashing utility exited with {:?}", output.exit_code);
            Err(SessionFailure::UploadFailed {
                reason: "flashing utility reported an error".to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }

    /// Identity already present on the device, if any
    ///
    /// Probe failures are not fatal: a device that cannot be probed is
    /// treated as blank.
    pub async fn probe_identity(&self, device: Option<&DeviceRef>) -> Option<String> {
        if self.config.identity_args.trim().is_empty() {
            return None;
        }
        let args = build_args(&self.config.identity_args, None, device);
        match self.run(&args, None, device).await {
            Ok(output) => {
                let text = format!("{}\n{}", output.stdout, output.stderr);
                let identity = self
                    .identity
                    .captures(&text)
                    .and_then(|c| c.get(1).or_else(|| c.get(0)))
                    .map(|m| m.as_str().to_string());
                if let Some(id) = &identity {
                    tracing::info!("Device reports existing identity {}", id);
                }
                identity
            }
            Err(e) => {
                tracing::warn!("Identity probe failed, assuming blank device: {}", e);
                None
            }
        }
    }

    async fn run(
        &self,
        args: &[String],
        artifact: Option<&Path>,
        device: Option<&DeviceRef>,
    ) -> Result<ToolOutput, SessionFailure> {
        let program = which::which(&self.config.program).map_err(|e| {
            artifact_failure(format!(
                "flashing utility '{}' not found: {e}",
                self.config.program
            ))
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(artifact) = artifact {
            cmd.env(ENV_ARTIFACT, artifact);
        }
        if let Some(device) = device {
            cmd.env(ENV_DEVICE, &device.path);
        }
        tracing::debug!("Running {} {}", program.display(), args.join(" "));

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            artifact_failure(format!("failed to start '{}': {e}", program.display()))
        })?;
        let stdout = Captured::default();
        let stderr = Captured::default();
        let readers = [
            stdout.spawn_reader(child.stdout.take()),
            stderr.spawn_reader(child.stderr.take()),
        ];

        let status = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                drain(readers).await;
                return Err(artifact_failure(format!(
                    "failed to wait for '{}': {e}",
                    program.display()
                )));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Could not kill timed-out flashing utility: {}", e);
                }
                drain(readers).await;
                let partial = ToolOutput {
                    exit_code: None,
                    stdout: stdout.text(),
                    stderr: stderr.text(),
                    elapsed_ms: millis(started.elapsed()),
                };
                return Err(SessionFailure::UploadFailed {
                    reason: format!(
                        "flashing utility timed out after {} s",
                        self.config.timeout.as_secs_f64()
                    ),
                    exit_code: None,
                    output: partial.combined(),
                });
            }
        };
        drain(readers).await;

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout: stdout.text(),
            stderr: stderr.text(),
            elapsed_ms: millis(started.elapsed()),
        })
    }
}

/// Pipe output collected as it arrives, so a killed utility keeps what it
/// printed
#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn spawn_reader<R>(&self, pipe: Option<R>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 4096];
            while let Ok(n) = pipe.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                sink.buffer().extend_from_slice(&chunk[..n]);
            }
        })
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer()).into_owned()
    }
}

/// Wait briefly for the readers; a pipe inherited by a grandchild may
/// never close
async fn drain(readers: [JoinHandle<()>; 2]) {
    for mut reader in readers {
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Expand an argument template
///
/// Arguments are split on whitespace before substitution, so paths with
/// spaces stay single arguments. A lone `{device}` is dropped when there is
/// no device.
fn build_args(template: &str, artifact: Option<&Path>, device: Option<&DeviceRef>) -> Vec<String> {
    template
        .split_whitespace()
        .filter_map(|arg| {
            if arg == "{device}" && device.is_none() {
                return None;
            }
            let mut arg = arg.to_string();
            if let Some(artifact) = artifact {
                arg = arg.replace("{artifact}", &artifact.to_string_lossy());
            }
            if let Some(device) = device {
                arg = arg.replace("{device}", &device.path.to_string_lossy());
            }
            Some(arg)
        })
        .collect()
}
