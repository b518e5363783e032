//! Provisioning engine
//!
//! Runs a profile's command/response exchange over a bound link, strictly in
//! profile order. Each step renders its command, sends it and feeds response
//! lines to its matcher until the matcher accepts, rejects or the step times
//! out. Mismatches are retried up to the step's attempt budget.
//!
//! The engine is synchronous; the orchestrator runs it on a blocking thread.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::matcher::Verdict;
use super::profile::{Profile, ProvisioningStep, ReadyBanner, StepKind};
use super::template::{self, Variables};
use crate::error::SessionFailure;
use crate::infra::serial::SerialLink;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Before the first step
    Locked,
    /// Unlock step running
    Unlocking,
    /// Write step `i` (ordinal among write steps)
    WritingField(usize),
    /// Verify step `i` (ordinal among verify steps)
    VerifyingEcho(usize),
    /// Reboot command sent
    Rebooting,
    /// All steps passed
    Done,
    /// A step exhausted its attempts
    Failed,
    /// Cancelled
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("locked"),
            Self::Unlocking => f.write_str("unlocking"),
            Self::WritingField(i) => write!(f, "writing_field[{i}]"),
            Self::VerifyingEcho(i) => write!(f, "verifying_echo[{i}]"),
            Self::Rebooting => f.write_str("rebooting"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// Step id
    pub id: String,
    /// Rendered command
    pub command: String,
    /// Attempts used
    pub attempts: u32,
    /// Whether the step passed
    pub passed: bool,
    /// Lines of the last response
    pub response: Vec<String>,
}

/// Evidence of a failed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Step id
    pub step: String,
    /// Attempts made
    pub attempts: u32,
    /// Why the last attempt failed
    pub reason: String,
    /// Last response seen
    pub last_response: Option<String>,
}

impl From<StepFailure> for SessionFailure {
    fn from(f: StepFailure) -> Self {
        SessionFailure::ProvisioningStepFailed {
            step: f.step,
            attempts: f.attempts,
            reason: f.reason,
            last_response: f.last_response,
        }
    }
}

/// How a provisioning run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Every step passed
    Done,
    /// A step failed
    Failed(StepFailure),
    /// Cancelled in the given state
    Aborted(EngineState),
}

/// Result of a provisioning run
#[derive(Debug, Clone)]
pub struct ProvisioningReport {
    /// Outcome
    pub outcome: ProvisioningOutcome,
    /// Executed steps
    pub steps: Vec<StepRecord>,
    /// Whether the ready banner was seen (`None` if the profile has none)
    pub ready_seen: Option<bool>,
}

/// State observer callback
pub type StateObserver = Box<dyn Fn(EngineState) + Send>;

/// Wait for a banner line
///
/// Returns `true` once a line containing the marker arrives, `false` on
/// timeout, cancellation or link error.
pub fn wait_for_banner(
    link: &mut dyn SerialLink,
    banner: &ReadyBanner,
    cancel: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + Duration::from_millis(banner.timeout_ms);
    let slice = Duration::from_millis(100);
    while !cancel.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match link.read_line(remaining.min(slice)) {
            Ok(Some(line)) if line.contains(&banner.marker) => {
                tracing::debug!("Ready banner seen on {}", link.port_name());
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Link error while waiting for ready banner: {}", e);
                return false;
            }
        }
    }
    false
}

/// Runs the provisioning exchange of one profile
pub struct ProvisioningEngine {
    profile: Arc<Profile>,
    vars: Variables,
    cancel: CancellationToken,
    observer: Option<StateObserver>,
    state: EngineState,
}

impl ProvisioningEngine {
    /// Engine for `profile` with bound session variables
    pub fn new(profile: Arc<Profile>, vars: Variables, cancel: CancellationToken) -> Self {
        Self {
            profile,
            vars,
            cancel,
            observer: None,
            state: EngineState::Locked,
        }
    }

    /// Call `observer` on every state change
    #[must_use]
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    fn enter(&mut self, state: EngineState) {
        tracing::debug!("Provisioning state {} -> {}", self.state, state);
        self.state = state;
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }

    /// Run every step in order
    pub fn run(&mut self, link: &mut dyn SerialLink) -> ProvisioningReport {
        let profile = Arc::clone(&self.profile);
        let mut steps = Vec::with_capacity(profile.steps.len());
        self.enter(EngineState::Locked);

        let ready_seen = profile.profile.ready.as_ref().map(|banner| {
            let seen = wait_for_banner(link, banner, &self.cancel);
            if !seen {
                tracing::warn!(
                    "Ready banner '{}' not seen within {} ms, continuing",
                    banner.marker,
                    banner.timeout_ms
                );
            }
            seen
        });

        let (mut writes, mut verifies) = (0usize, 0usize);
        for step in &profile.steps {
            if self.cancel.is_cancelled() {
                return self.aborted(steps, ready_seen);
            }
            let state = match step.kind {
                StepKind::Unlock => EngineState::Unlocking,
                StepKind::Write => {
                    writes += 1;
                    EngineState::WritingField(writes - 1)
                }
                StepKind::Verify => {
                    verifies += 1;
                    EngineState::VerifyingEcho(verifies - 1)
                }
                StepKind::Reboot => EngineState::Rebooting,
            };
            self.enter(state);

            match self.run_step(link, step) {
                StepResult::Passed(record) => steps.push(record),
                StepResult::Failed(record, failure) => {
                    steps.push(record);
                    tracing::warn!(
                        "Step '{}' failed after {} attempt(s): {}",
                        failure.step,
                        failure.attempts,
                        failure.reason
                    );
                    self.enter(EngineState::Failed);
                    return ProvisioningReport {
                        outcome: ProvisioningOutcome::Failed(failure),
                        steps,
                        ready_seen,
                    };
                }
                StepResult::Cancelled(record) => {
                    steps.push(record);
                    return self.aborted(steps, ready_seen);
                }
            }
        }

        self.enter(EngineState::Done);
        ProvisioningReport {
            outcome: ProvisioningOutcome::Done,
            steps,
            ready_seen,
        }
    }

    fn aborted(&mut self, steps: Vec<StepRecord>, ready_seen: Option<bool>) -> ProvisioningReport {
        let during = self.state;
        self.enter(EngineState::Aborted);
        ProvisioningReport {
            outcome: ProvisioningOutcome::Aborted(during),
            steps,
            ready_seen,
        }
    }

    fn run_step(&self, link: &mut dyn SerialLink, step: &ProvisioningStep) -> StepResult {
        let matcher = step.matcher();
        let command = template::render(&step.command, &self.vars);
        let timeout = Duration::from_millis(step.timeout_ms);
        let mut response = Vec::new();
        let mut reason = String::new();

        for attempt in 1..=step.attempts {
            if attempt > 1 {
                tracing::debug!("Retrying step '{}' (attempt {})", step.id, attempt);
                std::thread::sleep(Duration::from_millis(step.retry_delay_ms));
                if self.cancel.is_cancelled() {
                    return StepResult::Cancelled(record(step, &command, attempt - 1, false, response));
                }
            }

            if let Err(e) = link.send_line(&command) {
                reason = e.to_string();
                response.clear();
                continue;
            }
            if !matcher.expects_response() {
                return StepResult::Passed(record(step, &command, attempt, true, Vec::new()));
            }

            response.clear();
            let deadline = Instant::now() + timeout;
            let verdict = loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break matcher.settle(&response, &self.vars);
                }
                match link.read_line(remaining) {
                    Ok(Some(line)) => {
                        response.push(line);
                        match matcher.judge(&response, &self.vars) {
                            Verdict::Pending => {}
                            decided => break decided,
                        }
                    }
                    Ok(None) => break matcher.settle(&response, &self.vars),
                    Err(e) => break Verdict::Reject(e.to_string()),
                }
            };

            match verdict {
                Verdict::Accept => {
                    return StepResult::Passed(record(step, &command, attempt, true, response));
                }
                Verdict::Reject(why) => reason = why,
                Verdict::Pending => reason = "no decision".to_string(),
            }
        }

        let failure = StepFailure {
            step: step.id.clone(),
            attempts: step.attempts,
            reason,
            last_response: (!response.is_empty()).then(|| response.join(" | ")),
        };
        StepResult::Failed(record(step, &command, step.attempts, false, response), failure)
    }
}

enum StepResult {
    Passed(StepRecord),
    Failed(StepRecord, StepFailure),
    Cancelled(StepRecord),
}

fn record(
    step: &ProvisioningStep,
    command: &str,
    attempts: u32,
    passed: bool,
    response: Vec<String>,
) -> StepRecord {
    StepRecord {
        id: step.id.clone(),
        command: command.to_string(),
        attempts,
        passed,
        response,
    }
}
