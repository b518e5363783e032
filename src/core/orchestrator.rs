//! Provisioning orchestrator
//!
//! Sequences one session per physical device: claim a serial, wait for an
//! upload-mode device, upload, bind the serial port, provision, rebind after
//! the reboot, verify and record the outcome. Blocking serial work runs on
//! the blocking pool; the session state is published on a watch channel for
//! presentation layers.
//!
//! Every session that held a serial lock ends with exactly one ledger entry,
//! except for refusals that never touched the device (the unit was already
//! programmed, or the serial was locked or exhausted).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ledger::{DeviceRecord, EventType, LedgerEntry, SerialLock, TraceabilityLedger};
use super::provisioning::{self, EngineState, ProvisioningEngine, ProvisioningOutcome};
use super::session::{
    RecordingLink, SerialSelection, Session, SessionOutcome, SessionReport, SessionRequest,
    SessionState,
};
use super::template::Variables;
use super::verification::VerificationEngine;
use crate::config::defaults;
use crate::error::{LedgerError, ProvisionerError, SessionFailure};
use crate::infra::artifacts::ArtifactStore;
use crate::infra::monitor::{DeviceEvent, DeviceMonitor, DeviceRef, PortRef};
use crate::infra::reconnect::{ReconnectFailure, ReconnectPolicy, SerialReconnector};
use crate::infra::serial::PortOpener;
use crate::infra::upload::{self, UploadExecutor};

/// Orchestrator timing and identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Written to `programmed_by`
    pub station_id: String,
    /// Wait for an upload-mode device
    pub device_timeout: Duration,
    /// Port binding windows after upload and reboot
    pub reconnect: ReconnectPolicy,
    /// Attempts to open a bound port
    pub open_attempts: u32,
    /// Delay between open attempts
    pub open_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            station_id: defaults::STATION_ID.to_string(),
            device_timeout: Duration::from_millis(defaults::DEVICE_TIMEOUT_MS),
            reconnect: ReconnectPolicy {
                timeout: Duration::from_millis(defaults::SERIAL_TIMEOUT_MS),
                settle: Duration::from_millis(defaults::SETTLE_WINDOW_MS),
            },
            open_attempts: defaults::PORT_OPEN_ATTEMPTS,
            open_delay: Duration::from_millis(defaults::PORT_OPEN_DELAY_MS),
        }
    }
}

/// Running session
pub struct SessionHandle {
    /// Live session state
    pub state: watch::Receiver<SessionState>,
    join: JoinHandle<Result<SessionReport, ProvisionerError>>,
}

impl SessionHandle {
    /// Wait for the session to finish
    pub async fn wait(self) -> Result<SessionReport, ProvisionerError> {
        self.join
            .await
            .map_err(|e| ProvisionerError::Task(e.to_string()))?
    }
}

/// Drives provisioning sessions
pub struct Orchestrator {
    ledger: Arc<TraceabilityLedger>,
    monitor: Arc<DeviceMonitor>,
    uploader: UploadExecutor,
    opener: Arc<dyn PortOpener>,
    artifacts: Option<ArtifactStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Orchestrator over the given ledger, monitor and port opener
    pub fn new(
        ledger: Arc<TraceabilityLedger>,
        monitor: Arc<DeviceMonitor>,
        uploader: UploadExecutor,
        opener: Arc<dyn PortOpener>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            monitor,
            uploader,
            opener,
            artifacts: None,
            config,
        }
    }

    /// Write session logs and summaries under `store`
    #[must_use]
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Ledger in use
    pub fn ledger(&self) -> &Arc<TraceabilityLedger> {
        &self.ledger
    }

    /// Start a session in the background
    pub fn start(self: &Arc<Self>, request: SessionRequest, cancel: CancellationToken) -> SessionHandle {
        let (tx, rx) = watch::channel(SessionState::Idle);
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.run_with(request, Arc::new(tx), cancel).await });
        SessionHandle { state: rx, join }
    }

    /// Run a session to completion
    ///
    /// Session failures are reported in the returned report; `Err` means the
    /// session could not be set up (unknown serial, unreadable ledger).
    pub async fn run(
        &self,
        request: SessionRequest,
        cancel: CancellationToken,
    ) -> Result<SessionReport, ProvisionerError> {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        self.run_with(request, Arc::new(tx), cancel).await
    }

    async fn run_with(
        &self,
        request: SessionRequest,
        states: Arc<watch::Sender<SessionState>>,
        cancel: CancellationToken,
    ) -> Result<SessionReport, ProvisionerError> {
        let mut session = Session::new(states);
        let product_id = request.profile.product_id().to_string();
        tracing::info!("Session {} started ({})", session.id, product_id);

        let lock = match self.acquire(&request.serial).await? {
            Ok(lock) => lock,
            Err(failure) => {
                tracing::warn!("Session {} refused: {}", session.id, failure);
                if let SessionFailure::LedgerConflict { serial } = &failure {
                    session.serial = Some(serial.clone());
                }
                session.enter(SessionState::Failed);
                return Ok(session.into_report(
                    &product_id,
                    SessionOutcome::Failed { failure },
                    SessionState::Idle,
                    None,
                    None,
                ));
            }
        };

        let record = self
            .ledger
            .record(lock.serial())
            .ok_or_else(|| LedgerError::UnknownSerial {
                serial: lock.serial().to_string(),
            })?;
        session.serial = Some(record.serial_number.clone());
        session.previously_programmed = record.date_programmed().is_some();
        session.variables = request.profile.bind(&session_variables(&request, &record));
        tracing::info!(
            "Session {} provisioning {}{}",
            session.id,
            record.serial_number,
            if session.previously_programmed {
                " (previously programmed)"
            } else {
                ""
            }
        );

        let result = self.drive(&mut session, &request, &cancel).await;
        let last_state = session.state();

        session.enter(SessionState::Recording);
        let (lock, ledger_entry, ledger_error) = match self.entry_for(&session, &request, &result) {
            Some(entry) => {
                let ledger = Arc::clone(&self.ledger);
                let (lock, written) = tokio::task::spawn_blocking(move || {
                    let written = ledger.record_outcome(&lock, entry);
                    (lock, written)
                })
                .await
                .map_err(|e| ProvisionerError::Task(e.to_string()))?;
                match written {
                    Ok(entry) => (lock, Some(entry), None),
                    Err(e) => {
                        tracing::error!("Failed to record outcome for {}: {}", lock.serial(), e);
                        session.transcript.note(&format!("ledger write failed: {e}"));
                        (lock, None, Some(e.to_string()))
                    }
                }
            }
            None => (lock, None, None),
        };
        lock.release();

        let (outcome, terminal) = match result {
            Ok(event) => (SessionOutcome::Completed { event }, SessionState::Completed),
            Err(failure) => {
                let terminal = if matches!(failure, SessionFailure::Aborted { .. }) {
                    SessionState::Aborted
                } else {
                    SessionState::Failed
                };
                (SessionOutcome::Failed { failure }, terminal)
            }
        };
        session.enter(terminal);
        match outcome.failure() {
            None => tracing::info!("Session {} completed", session.id),
            Some(failure) => tracing::warn!("Session {} failed: {}", session.id, failure),
        }

        let transcript = session.transcript.render();
        let report = session.into_report(&product_id, outcome, last_state, ledger_entry, ledger_error);
        if let Some(store) = &self.artifacts {
            if let Err(e) = store.write_session(&report, &transcript) {
                tracing::warn!("Could not write session artifacts: {}", e);
            }
        }
        Ok(report)
    }

    /// Lock the requested serial; refusals are session failures
    async fn acquire(
        &self,
        selection: &SerialSelection,
    ) -> Result<Result<SerialLock, SessionFailure>, ProvisionerError> {
        let ledger = Arc::clone(&self.ledger);
        let selection = selection.clone();
        let locked = tokio::task::spawn_blocking(move || match &selection {
            SerialSelection::Explicit(serial) => ledger.lock(serial),
            SerialSelection::Next => ledger.claim_next_unprogrammed(),
        })
        .await
        .map_err(|e| ProvisionerError::Task(e.to_string()))?;

        match locked {
            Ok(lock) => Ok(Ok(lock)),
            Err(LedgerError::Conflict { serial }) => {
                Ok(Err(SessionFailure::LedgerConflict { serial }))
            }
            Err(LedgerError::NoAvailableDevice) => Ok(Err(SessionFailure::NoAvailableDevice)),
            Err(e) => Err(e.into()),
        }
    }

    /// Everything between claiming the serial and recording the outcome
    async fn drive(
        &self,
        session: &mut Session,
        request: &SessionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventType, SessionFailure> {
        let serial = session.serial.clone().unwrap_or_default();
        if session.previously_programmed && !request.reprogram {
            return Err(SessionFailure::AlreadyProgrammed {
                serial,
                evidence: "ledger records a programmed entry".to_string(),
            });
        }

        let variables = request.profile.unbound_variables(&session.variables);
        if !variables.is_empty() {
            return Err(SessionFailure::UnboundVariables { serial, variables });
        }

        let artifact = upload::inspect_artifact(&request.artifact)?;
        session.artifact = Some(artifact.clone());

        let mut attach_events = self.monitor.subscribe();
        session.enter(SessionState::WaitingForDevice);
        let preset = request
            .device
            .clone()
            .or_else(|| self.monitor.snapshot().devices.into_iter().next());
        let device = match preset {
            Some(device) => device,
            None => match self.wait_for_attach(&mut attach_events, cancel).await {
                Ok(device) => device,
                Err(ReconnectFailure::Cancelled) => return Err(aborted(session)),
                Err(ReconnectFailure::TimedOut(waited)) => {
                    return Err(SessionFailure::DeviceNotFound {
                        waited_ms: millis(waited),
                    })
                }
            },
        };
        tracing::info!("Using upload device {}", device);
        session.transcript.note(&format!("upload device {device}"));
        session.device = Some(device.clone());

        if !(request.force || request.reprogram) {
            session.enter(SessionState::CheckingIdentity);
            let identity = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(aborted(session)),
                identity = self.uploader.probe_identity(Some(&device)) => identity,
            };
            if let Some(identity) = identity {
                return Err(SessionFailure::AlreadyProgrammed {
                    serial,
                    evidence: format!("device reports identity {identity}"),
                });
            }
        }

        // Subscribe before the upload resets the device
        let mut port_events = self.monitor.subscribe();
        session.enter(SessionState::Uploading);
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(aborted(session)),
            result = self.uploader.upload(&artifact, Some(&device)) => result?,
        };
        session.transcript.note(&format!(
            "upload finished in {} ms",
            output.elapsed_ms
        ));
        session.upload = Some(output);

        session.enter(SessionState::WaitingForSerial);
        let reconnector = SerialReconnector::new(self.config.reconnect);
        let bound = match reconnector.wait_for_port(&mut port_events, cancel).await {
            Ok(bound) => bound,
            Err(ReconnectFailure::Cancelled) => return Err(aborted(session)),
            Err(ReconnectFailure::TimedOut(waited)) => {
                return Err(SessionFailure::SerialTimeout {
                    waited_ms: millis(waited),
                    phase: "after upload".to_string(),
                })
            }
        };
        session.transcript.note(&format!(
            "bound {} after {} ms ({} candidate(s) dropped)",
            bound.port,
            bound.waited.as_millis(),
            bound.churn
        ));
        session.port = Some(bound.port.name.clone());
        let link = self.open_port(&bound.port, session, cancel).await?;

        // Subscribe before the reboot step runs
        let mut reboot_events = self.monitor.subscribe();
        let publisher = session.publisher();
        let mut engine = ProvisioningEngine::new(
            Arc::clone(&request.profile),
            session.variables.clone(),
            cancel.clone(),
        )
        .with_observer(Box::new(move |state| {
            publisher.send_replace(SessionState::Provisioning(state));
        }));
        session.enter(SessionState::Provisioning(EngineState::Locked));
        let (link, report) = tokio::task::spawn_blocking(move || {
            let mut link = link;
            let report = engine.run(&mut link);
            (link, report)
        })
        .await
        .map_err(|e| worker_failed("provisioning", &e))?;

        session.steps = report.steps;
        if report.ready_seen == Some(false) {
            session.transcript.note("ready banner not seen");
        }
        match report.outcome {
            ProvisioningOutcome::Done => {
                session.enter(SessionState::Provisioning(EngineState::Done));
            }
            ProvisioningOutcome::Failed(failure) => {
                session.enter(SessionState::Provisioning(EngineState::Failed));
                return Err(failure.into());
            }
            ProvisioningOutcome::Aborted(during) => {
                session.enter(SessionState::Provisioning(during));
                return Err(aborted(session));
            }
        }

        let profile = &request.profile;
        let link = if profile.has_reboot() && profile.verification.rebind_after_reboot {
            drop(link);
            session.enter(SessionState::WaitingForReboot);
            let port = match reconnector.wait_for_port(&mut reboot_events, cancel).await {
                Ok(rebound) => rebound.port,
                Err(ReconnectFailure::Cancelled) => return Err(aborted(session)),
                Err(ReconnectFailure::TimedOut(waited)) => {
                    if self.port_present(&bound.port) {
                        tracing::warn!(
                            "No re-enumeration seen after reboot, reusing {}",
                            bound.port
                        );
                        bound.port.clone()
                    } else {
                        return Err(SessionFailure::SerialTimeout {
                            waited_ms: millis(waited),
                            phase: "after reboot".to_string(),
                        });
                    }
                }
            };
            session.transcript.note(&format!("rebound {port} after reboot"));
            session.port = Some(port.name.clone());
            let link = self.open_port(&port, session, cancel).await?;

            match profile.profile.ready.clone() {
                Some(banner) => {
                    let token = cancel.clone();
                    let (link, seen) = tokio::task::spawn_blocking(move || {
                        let mut link = link;
                        let seen = provisioning::wait_for_banner(&mut link, &banner, &token);
                        (link, seen)
                    })
                    .await
                    .map_err(|e| worker_failed("reboot", &e))?;
                    if !seen {
                        tracing::warn!("Ready banner not seen after reboot, verifying anyway");
                        session.transcript.note("ready banner not seen after reboot");
                    }
                    link
                }
                None => link,
            }
        } else {
            link
        };

        if cancel.is_cancelled() {
            return Err(aborted(session));
        }
        session.enter(SessionState::Verifying);
        let verifier = VerificationEngine::new(
            Arc::clone(&request.profile),
            session.variables.clone(),
            cancel.clone(),
        );
        let verification = tokio::task::spawn_blocking(move || {
            let mut link = link;
            verifier.run(&mut link)
        })
        .await
        .map_err(|e| worker_failed("verification", &e))?;
        let Some(verification) = verification else {
            return Err(aborted(session));
        };

        let mismatches = verification.mismatches();
        session.verification = Some(verification);
        if !mismatches.is_empty() {
            return Err(SessionFailure::VerificationFailed { mismatches });
        }

        Ok(if session.previously_programmed {
            EventType::ReprogramAttempt
        } else {
            EventType::Programmed
        })
    }

    /// Wait for an `Attached` event
    async fn wait_for_attach(
        &self,
        events: &mut broadcast::Receiver<DeviceEvent>,
        cancel: &CancellationToken,
    ) -> Result<DeviceRef, ReconnectFailure> {
        let timeout = self.config.device_timeout;
        let deadline = Instant::now() + timeout;
        tracing::info!("Waiting for a device in upload mode");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ReconnectFailure::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(ReconnectFailure::TimedOut(timeout)),
                event = events.recv() => match event {
                    Ok(DeviceEvent::Attached(device)) => return Ok(device),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} device event(s)", skipped);
                        if let Some(device) = self.monitor.snapshot().devices.into_iter().next() {
                            return Ok(device);
                        }
                    }
                    Err(RecvError::Closed) => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(ReconnectFailure::Cancelled),
                            () = tokio::time::sleep_until(deadline) => return Err(ReconnectFailure::TimedOut(timeout)),
                        }
                    }
                },
            }
        }
    }

    /// Open a bound port, retrying while the OS finishes enumeration
    async fn open_port(
        &self,
        port: &PortRef,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<RecordingLink, SessionFailure> {
        let attempts = self.config.open_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let opener = Arc::clone(&self.opener);
            let target = port.clone();
            match tokio::task::spawn_blocking(move || opener.open(&target)).await {
                Ok(Ok(link)) => return Ok(RecordingLink::new(link, session.transcript.clone())),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(e) => last_error = e.to_string(),
            }
            tracing::debug!(
                "Open attempt {}/{} for {} failed: {}",
                attempt,
                attempts,
                port,
                last_error
            );
            if attempt < attempts {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(aborted(session)),
                    () = tokio::time::sleep(self.config.open_delay) => {}
                }
            }
        }
        Err(SessionFailure::PortUnavailable {
            port: port.name.clone(),
            error: last_error,
        })
    }

    fn port_present(&self, port: &PortRef) -> bool {
        self.monitor
            .snapshot()
            .ports
            .iter()
            .any(|p| p.name == port.name)
    }

    /// Ledger entry for a finished session, if the outcome is recorded
    fn entry_for(
        &self,
        session: &Session,
        request: &SessionRequest,
        result: &Result<EventType, SessionFailure>,
    ) -> Option<LedgerEntry> {
        let serial = session.serial.as_deref()?;
        let event = match result {
            Ok(event) => *event,
            Err(
                SessionFailure::AlreadyProgrammed { .. }
                | SessionFailure::UnboundVariables { .. }
                | SessionFailure::LedgerConflict { .. }
                | SessionFailure::NoAvailableDevice,
            ) => return None,
            Err(SessionFailure::VerificationFailed { .. }) => EventType::VerificationFailed,
            Err(SessionFailure::Aborted { .. }) => EventType::Aborted,
            Err(_) => EventType::SessionFailed,
        };

        let mut entry = LedgerEntry::new(serial, event, &self.config.station_id)
            .with_firmware(session.variables.get("firmware_version").cloned())
            .with_metadata("product_id", request.profile.product_id())
            .with_metadata("session_id", &session.id);
        for key in ["hardware_version", "region_code", "batch_id"] {
            if let Some(value) = session.variables.get(key) {
                entry = entry.with_metadata(key, value);
            }
        }
        if let Some(notes) = &request.notes {
            entry = entry.with_metadata("notes", notes);
        }
        if let Some(artifact) = &session.artifact {
            entry = entry.with_metadata("artifact_sha256", &artifact.sha256);
        }
        if let Some(port) = &session.port {
            entry = entry.with_metadata("port", port);
        }
        if let Some(device) = &session.device {
            entry = entry.with_metadata("device", device.to_string());
        }

        match result {
            Ok(_) => {}
            Err(SessionFailure::Aborted { state }) => {
                entry = entry.with_metadata("aborted_in", state);
            }
            Err(failure) => {
                entry = entry
                    .with_metadata("failure", failure.kind())
                    .with_metadata("reason", failure.to_string());
            }
        }
        Some(entry)
    }
}

/// Session variables from the request, falling back to the ledger record
fn session_variables(request: &SessionRequest, record: &DeviceRecord) -> Variables {
    let mut vars = Variables::new();
    vars.insert("serial_number".to_string(), record.serial_number.clone());
    for (key, value) in [
        ("firmware_version", &request.firmware_version, &record.firmware_version),
        ("hardware_version", &request.hardware_version, &record.hardware_version),
        ("region_code", &request.region_code, &record.region_code),
        ("batch_id", &request.batch_id, &record.batch_id),
    ]
    .map(|(key, requested, stored)| (key, requested.as_ref().or(stored.as_ref())))
    {
        if let Some(value) = value {
            vars.insert(key.to_string(), value.clone());
        }
    }
    vars
}

fn aborted(session: &Session) -> SessionFailure {
    SessionFailure::Aborted {
        state: session.state().to_string(),
    }
}

fn worker_failed(stage: &str, error: &tokio::task::JoinError) -> SessionFailure {
    SessionFailure::ProvisioningStepFailed {
        step: stage.to_string(),
        attempts: 0,
        reason: format!("serial worker failed: {error}"),
        last_response: None,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::DeviceStatus;
    use crate::infra::upload::UploaderConfig;
    use crate::test_utils::fakes::{ScriptedDevice, ScriptedHost, ScriptedOpener};
    use crate::test_utils::sample_profile;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const PORT: &str = "/dev/ttyACM0";

    struct Bench {
        orchestrator: Arc<Orchestrator>,
        ledger: Arc<TraceabilityLedger>,
        host: ScriptedHost,
        device: ScriptedDevice,
        opener: ScriptedOpener,
        artifact: PathBuf,
        temp: TempDir,
        monitor_cancel: CancellationToken,
    }

    impl Drop for Bench {
        fn drop(&mut self) {
            self.monitor_cancel.cancel();
        }
    }

    fn device(region: &str) -> ScriptedDevice {
        ScriptedDevice::new(PORT)
            .boot(&["rp2040 boot", "SYSTEM READY"])
            .respond("PROV UNLOCK 6D61676963", &["OK"])
            .respond("PROV SET_SN", &["OK"])
            .respond("PROV SET_REGION", &["OK"])
            .respond("PROV STATUS", &["SN=SN-0001 REGION=EU", "OK"])
            .respond(
                "SYSINFO",
                &[
                    "[SYS] Device Serial: SN-0001",
                    &format!("[SYS] Region: {region}"),
                    "[SYS] Firmware Version: 1.4.0",
                ],
            )
            .respond("NETINFO", &["IP: 192.168.4.1"])
    }

    fn bench(records: Vec<DeviceRecord>, upload_script: &str, device: ScriptedDevice) -> Bench {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("firmware.uf2");
        std::fs::write(&artifact, vec![0x55u8; 512]).unwrap();

        let host = ScriptedHost::new();
        host.add_device("/media/operator/RPI-RP2");
        let monitor = Arc::new(DeviceMonitor::new(
            Arc::new(host.clone()),
            Duration::from_millis(10),
        ));
        monitor.poll_once();
        let monitor_cancel = CancellationToken::new();
        Arc::clone(&monitor).spawn(monitor_cancel.clone());

        let uploader = UploadExecutor::new(UploaderConfig {
            program: "sh".to_string(),
            args: format!("-c {upload_script} {{artifact}}"),
            identity_args: String::new(),
            timeout: Duration::from_secs(10),
            ..UploaderConfig::default()
        })
        .unwrap();

        let opener = ScriptedOpener::new().with_device(&device);
        let ledger = Arc::new(TraceabilityLedger::in_memory(records));
        let config = OrchestratorConfig {
            station_id: "test-station".to_string(),
            device_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy {
                timeout: Duration::from_millis(1500),
                settle: Duration::from_millis(30),
            },
            open_attempts: 3,
            open_delay: Duration::from_millis(10),
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&ledger),
            monitor,
            uploader,
            Arc::new(opener.clone()),
            config,
        )
        .with_artifacts(ArtifactStore::new(temp.path().join("artifacts")));

        Bench {
            orchestrator: Arc::new(orchestrator),
            ledger,
            host,
            device,
            opener,
            artifact,
            temp,
            monitor_cancel,
        }
    }

    fn roster() -> Vec<DeviceRecord> {
        vec![DeviceRecord::new("SN-0001"), DeviceRecord::new("SN-0002")]
    }

    fn request(serial: SerialSelection, artifact: &Path) -> SessionRequest {
        let mut request = SessionRequest::new(serial, Arc::new(sample_profile()), artifact);
        request.firmware_version = Some("1.4.0".to_string());
        request.region_code = Some("EU".to_string());
        request.hardware_version = Some("rev-b".to_string());
        request
    }

    /// Plays the device side of the resets: the port appears after the
    /// upload and re-enumerates after the reboot step.
    fn simulate_resets(host: ScriptedHost, mut states: watch::Receiver<SessionState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rebooted = false;
            loop {
                let state = *states.borrow_and_update();
                match state {
                    SessionState::WaitingForSerial => host.add_port(PORT),
                    SessionState::WaitingForReboot if !rebooted => {
                        rebooted = true;
                        host.remove_port(PORT);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        host.add_port(PORT);
                    }
                    s if s.is_terminal() => break,
                    _ => {}
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_happy_path_programs_and_records() {
        let bench = bench(roster(), "true", device("EU"));
        let handle = bench.orchestrator.start(
            request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
            CancellationToken::new(),
        );
        let resets = simulate_resets(bench.host.clone(), handle.state.clone());
        let report = handle.wait().await.unwrap();
        resets.await.unwrap();

        assert_eq!(
            report.outcome,
            SessionOutcome::Completed {
                event: EventType::Programmed
            },
            "{:#?}",
            report.transcript
        );
        assert_eq!(
            bench.device.sent(),
            vec![
                "PROV UNLOCK 6D61676963",
                "PROV SET_SN SN-0001",
                "PROV SET_REGION EU",
                "PROV STATUS",
                "REBOOT",
                "SYSINFO",
                "NETINFO",
            ]
        );
        // Opened once after upload and once after reboot
        assert_eq!(bench.opener.opened(), vec![PORT, PORT]);

        let record = bench.ledger.record("SN-0001").unwrap();
        assert_eq!(record.status(), DeviceStatus::Programmed);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.firmware_version.as_deref(), Some("1.4.0"));
        assert_eq!(record.region_code.as_deref(), Some("EU"));
        assert_eq!(record.hardware_version.as_deref(), Some("rev-b"));
        let entry = report.ledger_entry.unwrap();
        assert_eq!(entry.programmed_by, "test-station");
        assert_eq!(entry.metadata["product_id"], "sensor-node");

        // Lock released
        bench.ledger.lock("SN-0001").unwrap();

        let logs = bench.temp.path().join("artifacts").join("SN-0001").join("logs");
        assert_eq!(std::fs::read_dir(logs).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_upload_sends_no_provisioning_command() {
        let bench = bench(roster(), "false", device("EU"));
        let report = bench
            .orchestrator
            .run(
                request(SerialSelection::Next, &bench.artifact),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let failure = report.outcome.failure().unwrap();
        assert_eq!(failure.kind(), "upload_failed");
        assert_eq!(report.last_state, SessionState::Uploading);
        assert!(bench.device.sent().is_empty());
        assert!(bench.opener.opened().is_empty());

        let record = bench.ledger.record("SN-0001").unwrap();
        assert_eq!(record.status(), DeviceStatus::Failed);
        let entry = record.latest().unwrap();
        assert_eq!(entry.event_type, EventType::SessionFailed);
        assert_eq!(entry.metadata["failure"], "upload_failed");
        // Descriptive columns only change on programmed outcomes
        assert_eq!(record.region_code, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_region_stops_before_upload() {
        let bench = bench(roster(), "true", device("EU"));
        let mut request = request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact);
        request.region_code = None;

        let report = bench
            .orchestrator
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        let failure = report.outcome.failure().unwrap();
        assert_eq!(failure.kind(), "unbound_variables");
        assert!(failure.to_string().contains("region_code"), "{failure}");
        assert!(report.artifact.is_none());
        assert!(bench.device.sent().is_empty());
        assert!(bench.opener.opened().is_empty());

        // Nothing touched the unit, so nothing is recorded
        assert!(report.ledger_entry.is_none());
        assert!(bench.ledger.record("SN-0001").unwrap().history.is_empty());
        bench.ledger.lock("SN-0001").unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verification_mismatch_is_recorded() {
        let bench = bench(roster(), "true", device("US"));
        let handle = bench.orchestrator.start(
            request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
            CancellationToken::new(),
        );
        let resets = simulate_resets(bench.host.clone(), handle.state.clone());
        let report = handle.wait().await.unwrap();
        resets.await.unwrap();

        match report.outcome.failure() {
            Some(SessionFailure::VerificationFailed { mismatches }) => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].name, "region");
            }
            other => panic!("Expected VerificationFailed, got {other:?}"),
        }
        assert_eq!(report.last_state, SessionState::Verifying);

        let record = bench.ledger.record("SN-0001").unwrap();
        assert_eq!(record.status(), DeviceStatus::Failed);
        assert_eq!(
            record.latest().unwrap().event_type,
            EventType::VerificationFailed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_programmed_unit_requires_reprogram() {
        let mut programmed = DeviceRecord::new("SN-0001");
        programmed.history.push(LedgerEntry::new(
            "SN-0001",
            EventType::Programmed,
            "station-0",
        ));
        let bench = bench(vec![programmed], "true", device("EU"));

        let report = bench
            .orchestrator
            .run(
                request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome.failure().unwrap().kind(), "already_programmed");
        assert!(report.ledger_entry.is_none());
        assert_eq!(bench.ledger.record("SN-0001").unwrap().history.len(), 1);

        let mut again = request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact);
        again.reprogram = true;
        let handle = bench.orchestrator.start(again, CancellationToken::new());
        let resets = simulate_resets(bench.host.clone(), handle.state.clone());
        let report = handle.wait().await.unwrap();
        resets.await.unwrap();

        assert_eq!(
            report.outcome,
            SessionOutcome::Completed {
                event: EventType::ReprogramAttempt
            }
        );
        let record = bench.ledger.record("SN-0001").unwrap();
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.status(), DeviceStatus::Reprogrammed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_locked_serial_is_refused_immediately() {
        let bench = bench(roster(), "true", device("EU"));
        let _held = bench.ledger.lock("SN-0001").unwrap();

        let started = std::time::Instant::now();
        let report = bench
            .orchestrator
            .run(
                request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(
            report.outcome.failure(),
            Some(&SessionFailure::LedgerConflict {
                serial: "SN-0001".to_string()
            })
        );
        assert!(bench.ledger.record("SN-0001").unwrap().history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_serial_is_an_error() {
        let bench = bench(roster(), "true", device("EU"));
        let result = bench
            .orchestrator
            .run(
                request(SerialSelection::Explicit("SN-9999".to_string()), &bench.artifact),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(ProvisionerError::Ledger(LedgerError::UnknownSerial { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serial_timeout_after_upload() {
        let bench = bench(roster(), "true", device("EU"));
        let report = bench
            .orchestrator
            .run(
                request(SerialSelection::Explicit("SN-0002".to_string()), &bench.artifact),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match report.outcome.failure() {
            Some(SessionFailure::SerialTimeout { phase, .. }) => assert_eq!(phase, "after upload"),
            other => panic!("Expected SerialTimeout, got {other:?}"),
        }
        assert_eq!(
            bench.ledger.record("SN-0002").unwrap().latest().unwrap().metadata["failure"],
            "serial_timeout"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_records_state_and_releases_lock() {
        let bench = bench(roster(), "true", device("EU"));
        let cancel = CancellationToken::new();
        let mut handle = bench.orchestrator.start(
            request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
            cancel.clone(),
        );

        // No port ever appears; abort while waiting for it
        handle
            .state
            .wait_for(|s| *s == SessionState::WaitingForSerial)
            .await
            .unwrap();
        cancel.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(
            report.outcome.failure(),
            Some(&SessionFailure::Aborted {
                state: "waiting_for_serial".to_string()
            })
        );
        let record = bench.ledger.record("SN-0001").unwrap();
        let entry = record.latest().unwrap();
        assert_eq!(entry.event_type, EventType::Aborted);
        assert_eq!(entry.metadata["aborted_in"], "waiting_for_serial");
        assert!(bench.ledger.lock("SN-0001").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_not_found() {
        let bench = bench(roster(), "true", device("EU"));
        bench.host.remove_device("/media/operator/RPI-RP2");
        // Let the monitor notice the removal
        tokio::time::sleep(Duration::from_millis(60)).await;

        let report = bench
            .orchestrator
            .run(
                request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome.failure().unwrap().kind(), "device_not_found");
        assert!(bench.device.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_port_open_retries_then_succeeds() {
        let bench = bench(roster(), "true", device("EU"));
        bench.opener.fail_next(2);
        let handle = bench.orchestrator.start(
            request(SerialSelection::Explicit("SN-0001".to_string()), &bench.artifact),
            CancellationToken::new(),
        );
        let resets = simulate_resets(bench.host.clone(), handle.state.clone());
        let report = handle.wait().await.unwrap();
        resets.await.unwrap();

        assert!(report.outcome.is_success(), "{:?}", report.outcome);
    }
}
