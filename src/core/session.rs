//! Provisioning session context
//!
//! A session is owned by exactly one orchestrator run. It carries the
//! request, the state published to presentation layers, the serial
//! transcript and everything the run learned, and ends as a
//! [`SessionReport`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::ledger::{EventType, LedgerEntry};
use super::profile::Profile;
use super::provisioning::{EngineState, StepRecord};
use super::template::Variables;
use super::verification::VerificationReport;
use crate::error::{LinkError, SessionFailure};
use crate::infra::monitor::DeviceRef;
use crate::infra::serial::SerialLink;
use crate::infra::upload::{ArtifactInfo, ToolOutput};

/// Where a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started
    Idle,
    /// Waiting for an upload-mode device
    WaitingForDevice,
    /// Probing for existing firmware
    CheckingIdentity,
    /// Flashing utility running
    Uploading,
    /// Waiting for the port after upload
    WaitingForSerial,
    /// Provisioning exchange running
    Provisioning(EngineState),
    /// Waiting for the port after the reboot step
    WaitingForReboot,
    /// Verification queries running
    Verifying,
    /// Writing the ledger
    Recording,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
    /// Operator abort
    Aborted,
}

impl SessionState {
    /// Whether the session has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::WaitingForDevice => f.write_str("waiting_for_device"),
            Self::CheckingIdentity => f.write_str("checking_identity"),
            Self::Uploading => f.write_str("uploading"),
            Self::WaitingForSerial => f.write_str("waiting_for_serial"),
            Self::Provisioning(engine) => write!(f, "provisioning/{engine}"),
            Self::WaitingForReboot => f.write_str("waiting_for_reboot"),
            Self::Verifying => f.write_str("verifying"),
            Self::Recording => f.write_str("recording"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// How the serial number is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialSelection {
    /// Operator-supplied serial
    Explicit(String),
    /// First unprogrammed serial in the ledger
    Next,
}

/// Everything needed to run one session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Serial selection
    pub serial: SerialSelection,
    /// Product profile
    pub profile: Arc<Profile>,
    /// Firmware artifact
    pub artifact: PathBuf,
    /// Firmware version recorded in the ledger
    pub firmware_version: Option<String>,
    /// Hardware revision; falls back to the ledger record
    pub hardware_version: Option<String>,
    /// Region code; falls back to the ledger record
    pub region_code: Option<String>,
    /// Batch id; falls back to the ledger record
    pub batch_id: Option<String>,
    /// Operator notes
    pub notes: Option<String>,
    /// Upload device to use instead of waiting for one
    pub device: Option<DeviceRef>,
    /// Skip the firmware identity probe
    pub force: bool,
    /// Allow programming a unit the ledger shows as programmed
    pub reprogram: bool,
}

impl SessionRequest {
    /// Request with defaults for everything but the essentials
    pub fn new(serial: SerialSelection, profile: Arc<Profile>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            serial,
            profile,
            artifact: artifact.into(),
            firmware_version: None,
            hardware_version: None,
            region_code: None,
            batch_id: None,
            notes: None,
            device: None,
            force: false,
            reprogram: false,
        }
    }
}

/// Transcript line direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent to the device
    Tx,
    /// Received from the device
    Rx,
    /// Station note
    Note,
}

/// One transcript line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    /// Milliseconds since session start
    pub at_ms: u64,
    /// Direction
    pub direction: Direction,
    /// Text
    pub text: String,
}

/// Shared, append-only session transcript
#[derive(Debug, Clone)]
pub struct Transcript {
    started: Instant,
    lines: Arc<Mutex<Vec<TranscriptLine>>>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// Empty transcript starting now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lines_mut(&self) -> MutexGuard<'_, Vec<TranscriptLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, direction: Direction, text: &str) {
        let at_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.lines_mut().push(TranscriptLine {
            at_ms,
            direction,
            text: text.to_string(),
        });
    }

    /// Record a sent line
    pub fn tx(&self, text: &str) {
        self.push(Direction::Tx, text);
    }

    /// Record a received line
    pub fn rx(&self, text: &str) {
        self.push(Direction::Rx, text);
    }

    /// Record a station note
    pub fn note(&self, text: &str) {
        self.push(Direction::Note, text);
    }

    /// Snapshot of all lines
    pub fn lines(&self) -> Vec<TranscriptLine> {
        self.lines_mut().clone()
    }

    /// Plain-text rendering
    pub fn render(&self) -> String {
        self.lines_mut()
            .iter()
            .map(|l| {
                let marker = match l.direction {
                    Direction::Tx => ">>",
                    Direction::Rx => "<<",
                    Direction::Note => "--",
                };
                format!("[{:>8} ms] {marker} {}\n", l.at_ms, l.text)
            })
            .collect()
    }
}

/// Link wrapper that copies traffic into the transcript
pub struct RecordingLink {
    inner: Box<dyn SerialLink>,
    transcript: Transcript,
}

impl RecordingLink {
    /// Wrap a link
    pub fn new(inner: Box<dyn SerialLink>, transcript: Transcript) -> Self {
        Self { inner, transcript }
    }
}

impl SerialLink for RecordingLink {
    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.transcript.tx(line);
        self.inner.send_line(line)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let line = self.inner.read_line(timeout)?;
        if let Some(text) = &line {
            self.transcript.rx(text);
        }
        Ok(line)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Device programmed and verified
    Completed {
        /// Ledger event recorded
        event: EventType,
    },
    /// Session ended with a failure (including operator abort)
    Failed {
        /// What went wrong
        failure: SessionFailure,
    },
}

impl SessionOutcome {
    /// Whether the device was programmed and verified
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Failure, if any
    pub fn failure(&self) -> Option<&SessionFailure> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { failure } => Some(failure),
        }
    }
}

/// Summary of one finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Session id
    pub session_id: String,
    /// Serial number, if one was claimed
    pub serial_number: Option<String>,
    /// Product id
    pub product_id: String,
    /// Outcome
    pub outcome: SessionOutcome,
    /// Last state before the session ended
    pub last_state: SessionState,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Upload device used
    pub device: Option<DeviceRef>,
    /// Port bound for provisioning and verification
    pub port: Option<String>,
    /// Validated artifact
    pub artifact: Option<ArtifactInfo>,
    /// Flashing utility output
    pub upload: Option<ToolOutput>,
    /// Provisioning steps executed
    pub steps: Vec<StepRecord>,
    /// Verification results
    pub verification: Option<VerificationReport>,
    /// Ledger entry written, if any
    pub ledger_entry: Option<LedgerEntry>,
    /// Ledger write error, if recording failed
    pub ledger_error: Option<String>,
    /// Serial transcript and station notes
    pub transcript: Vec<TranscriptLine>,
}

/// Mutable context of a running session
pub struct Session {
    /// Session id
    pub id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Transcript shared with the engines
    pub transcript: Transcript,
    /// Serial number once claimed
    pub serial: Option<String>,
    /// Template variables once the serial is known
    pub variables: Variables,
    /// Whether the unit carried firmware before this session
    pub previously_programmed: bool,
    /// Upload device
    pub device: Option<DeviceRef>,
    /// Bound port
    pub port: Option<String>,
    /// Validated artifact
    pub artifact: Option<ArtifactInfo>,
    /// Utility output
    pub upload: Option<ToolOutput>,
    /// Provisioning steps
    pub steps: Vec<StepRecord>,
    /// Verification results
    pub verification: Option<VerificationReport>,
    state: SessionState,
    states: Arc<watch::Sender<SessionState>>,
}

impl Session {
    /// New session publishing its state on `states`
    pub fn new(states: Arc<watch::Sender<SessionState>>) -> Self {
        let started_at = Utc::now();
        Self {
            id: format!(
                "{}-{:05}",
                started_at.format("%Y%m%dT%H%M%S%3f"),
                std::process::id() % 100_000
            ),
            started_at,
            transcript: Transcript::new(),
            serial: None,
            variables: Variables::new(),
            previously_programmed: false,
            device: None,
            port: None,
            artifact: None,
            upload: None,
            steps: Vec::new(),
            verification: None,
            state: SessionState::Idle,
            states,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to a new state and publish it
    pub fn enter(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session {}: {} -> {}", self.id, self.state, state);
            self.transcript.note(&format!("state {state}"));
        }
        self.state = state;
        self.states.send_replace(state);
    }

    /// Publisher handle for engines running on other threads
    pub fn publisher(&self) -> Arc<watch::Sender<SessionState>> {
        Arc::clone(&self.states)
    }

    /// Finish into a report
    pub fn into_report(
        self,
        product_id: &str,
        outcome: SessionOutcome,
        last_state: SessionState,
        ledger_entry: Option<LedgerEntry>,
        ledger_error: Option<String>,
    ) -> SessionReport {
        SessionReport {
            session_id: self.id,
            serial_number: self.serial,
            product_id: product_id.to_string(),
            outcome,
            last_state,
            started_at: self.started_at,
            finished_at: Utc::now(),
            device: self.device,
            port: self.port,
            artifact: self.artifact,
            upload: self.upload,
            steps: self.steps,
            verification: self.verification,
            ledger_entry,
            ledger_error,
            transcript: self.transcript.lines(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::ScriptedDevice;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::WaitingForSerial.to_string(), "waiting_for_serial");
        assert_eq!(
            SessionState::Provisioning(EngineState::WritingField(1)).to_string(),
            "provisioning/writing_field[1]"
        );
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Verifying.is_terminal());
    }

    #[test]
    fn test_recording_link_copies_traffic() {
        let device = ScriptedDevice::new("/dev/ttyACM0").respond("PING", &["PONG"]);
        let transcript = Transcript::new();
        let mut link = RecordingLink::new(device.link(), transcript.clone());

        link.send_line("PING").unwrap();
        assert_eq!(
            link.read_line(Duration::from_millis(10)).unwrap().as_deref(),
            Some("PONG")
        );

        let lines = transcript.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].direction, Direction::Tx);
        assert_eq!(lines[1].text, "PONG");
        assert!(transcript.render().contains(">> PING"));
    }

    #[test]
    fn test_session_publishes_state() {
        let (tx, rx) = watch::channel(SessionState::Idle);
        let mut session = Session::new(Arc::new(tx));
        session.enter(SessionState::Uploading);
        assert_eq!(*rx.borrow(), SessionState::Uploading);
        assert_eq!(session.state(), SessionState::Uploading);
    }
}
