//! Error types for the provisioning station
//!
//! Domain-specific error types using thiserror.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::verification::FieldResult;

/// Profile loading and validation errors
#[derive(Error, Debug)]
pub enum ProfileError {
    /// No profile with this product id in the profile directory
    #[error("Profile '{product_id}' not found in {}", dir.display())]
    NotFound { product_id: String, dir: PathBuf },

    /// Failed to read profile file
    #[error("Failed to read profile '{path}': {error}")]
    Read { path: PathBuf, error: String },

    /// Invalid TOML or unknown step/matcher/parser kind
    #[error("Failed to parse profile '{path}': {error}")]
    Parse { path: String, error: String },

    /// Profile declares no provisioning steps
    #[error("Profile '{product_id}' declares no provisioning steps")]
    NoSteps { product_id: String },

    /// Two steps share an id
    #[error("Duplicate step id '{step}'")]
    DuplicateStep { step: String },

    /// Two verification fields share a name
    #[error("Duplicate verification field '{field}'")]
    DuplicateField { field: String },

    /// Template refers to a variable nobody provides
    #[error("{context} refers to unknown variable '{{{variable}}}'")]
    UnknownVariable { context: String, variable: String },

    /// Regex does not compile
    #[error("{context} has invalid pattern '{pattern}': {error}")]
    InvalidPattern {
        context: String,
        pattern: String,
        error: String,
    },

    /// Attempt count outside the allowed window
    #[error("Step '{step}' has {attempts} attempts (allowed: 1..={max})")]
    AttemptsOutOfRange { step: String, attempts: u32, max: u32 },

    /// Zero timeout
    #[error("{context} must have a non-zero timeout")]
    ZeroTimeout { context: String },

    /// Reboot step is not the final step
    #[error("Reboot step '{step}' must be the last step")]
    RebootNotLast { step: String },

    /// Numeric range is inverted or empty
    #[error("Field '{field}' has an invalid range: {message}")]
    InvalidRange { field: String, message: String },

    /// Matcher is missing its value
    #[error("{context}: {message}")]
    InvalidMatcher { context: String, message: String },
}

/// Traceability ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Ledger file does not exist
    #[error("Ledger not found at '{}'. Run 'provisioner ledger init' first.", path.display())]
    NotFound { path: PathBuf },

    /// Ledger file already exists
    #[error("Ledger already exists at '{}'", path.display())]
    AlreadyExists { path: PathBuf },

    /// Failed to parse ledger document
    #[error("Failed to parse ledger '{}': {error}", path.display())]
    Parse { path: PathBuf, error: String },

    /// Failed to serialize ledger document
    #[error("Failed to serialize ledger: {0}")]
    Serialize(String),

    /// Filesystem failure while reading or replacing the ledger
    #[error("Ledger storage error: {0}")]
    Storage(#[from] FilesystemError),

    /// Serial number not present in the ledger
    #[error("Serial number '{serial}' is not in the ledger")]
    UnknownSerial { serial: String },

    /// Serial number already present
    #[error("Serial number '{serial}' is already in the ledger")]
    DuplicateSerial { serial: String },

    /// Serial number is empty or contains unusable characters
    #[error("Invalid serial number '{serial}'")]
    InvalidSerial { serial: String },

    /// Roster file could not be read
    #[error("Invalid roster at line {line}: {message}")]
    Roster { line: u64, message: String },

    /// Serial is claimed by another session
    #[error("Serial number '{serial}' is locked by another session")]
    Conflict { serial: String },

    /// Another writer holds the ledger write guard
    #[error("Ledger write guard '{}' is held by another process", path.display())]
    WriteGuardBusy { path: PathBuf },

    /// No record is waiting to be programmed
    #[error("No unprogrammed device remains in the ledger")]
    NoAvailableDevice,
}

/// Serial link errors
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    /// Port could not be opened
    #[error("Failed to open serial port '{port}': {error}")]
    Open { port: String, error: String },

    /// Read or write failed
    #[error("Serial I/O error on '{port}': {error}")]
    Io { port: String, error: String },
}

/// Host enumeration errors
#[derive(Error, Debug)]
pub enum EnumerationError {
    /// Serial port enumeration failed
    #[error("Failed to enumerate serial ports: {0}")]
    Ports(String),

    /// Storage enumeration failed
    #[error("Failed to enumerate storage devices: {0}")]
    Storage(String),
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to atomically replace a file
    #[error("Failed to replace '{path}': {error}")]
    Replace { path: PathBuf, error: String },

    /// Lock file already exists
    #[error("Lock '{path}' is already held")]
    LockHeld { path: PathBuf },

    /// Failed to create or remove a lock file
    #[error("Lock error for '{path}': {error}")]
    Lock { path: PathBuf, error: String },
}

/// Station settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Failed to read settings file
    #[error("Failed to read config file '{}': {error}", path.display())]
    Read { path: PathBuf, error: String },

    /// Failed to parse settings file
    #[error("Failed to parse config file '{}': {error}", path.display())]
    Parse { path: PathBuf, error: String },

    /// Failed to write settings file
    #[error("Failed to write config file '{}': {error}", path.display())]
    Write { path: PathBuf, error: String },

    /// A value is out of range or malformed
    #[error("Invalid setting '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Terminal session failures
///
/// Every variant carries the last evidence observed so the operator can
/// diagnose without re-running the session.
#[derive(Error, Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    /// No upload-mode device showed up
    #[error("No device in upload mode appeared within {waited_ms} ms")]
    DeviceNotFound { waited_ms: u64 },

    /// Flashing utility failed, timed out or was never started
    #[error("Firmware upload failed: {reason}{}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    UploadFailed {
        reason: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Device or ledger already carries firmware identity
    #[error("Device already programmed ({evidence}). Re-run with --force/--reprogram after confirming")]
    AlreadyProgrammed { serial: String, evidence: String },

    /// Profile templates reference variables the session has no value for
    #[error("No value for template variable(s) {}; pass them as options or record them in the ledger", variables.join(", "))]
    UnboundVariables { serial: String, variables: Vec<String> },

    /// No communication port within the window
    #[error("No serial port appeared within {waited_ms} ms ({phase})")]
    SerialTimeout { waited_ms: u64, phase: String },

    /// Bound port could not be opened
    #[error("Serial port '{port}' could not be opened: {error}")]
    PortUnavailable { port: String, error: String },

    /// A provisioning step exhausted its retries
    #[error("Provisioning step '{step}' failed after {attempts} attempt(s): {reason}; last response: {}", last_response.as_deref().unwrap_or("<none>"))]
    ProvisioningStepFailed {
        step: String,
        attempts: u32,
        reason: String,
        last_response: Option<String>,
    },

    /// One or more verification fields did not match
    #[error("Verification failed: {}", describe_mismatches(mismatches))]
    VerificationFailed { mismatches: Vec<FieldResult> },

    /// Serial claimed by another session
    #[error("Serial number '{serial}' is locked by another session")]
    LedgerConflict { serial: String },

    /// Ledger exhausted
    #[error("No unprogrammed device remains in the ledger")]
    NoAvailableDevice,

    /// Operator abort
    #[error("Session aborted by operator during {state}")]
    Aborted { state: String },
}

impl SessionFailure {
    /// Stable machine-readable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::UploadFailed { .. } => "upload_failed",
            Self::AlreadyProgrammed { .. } => "already_programmed",
            Self::UnboundVariables { .. } => "unbound_variables",
            Self::SerialTimeout { .. } => "serial_timeout",
            Self::PortUnavailable { .. } => "port_unavailable",
            Self::ProvisioningStepFailed { .. } => "provisioning_step_failed",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::LedgerConflict { .. } => "ledger_conflict",
            Self::NoAvailableDevice => "no_available_device",
            Self::Aborted { .. } => "aborted",
        }
    }
}

fn describe_mismatches(mismatches: &[FieldResult]) -> String {
    mismatches
        .iter()
        .map(|f| {
            format!(
                "{} (expected {}, got {})",
                f.name,
                f.expected,
                f.actual.as_deref().unwrap_or("<missing>")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level provisioner error type
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// Profile error
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// Settings error
    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),

    /// Background task died
    #[error("Session task failed: {0}")]
    Task(String),
}
