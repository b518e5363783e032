//! CLI command implementation for `provisioner run`

use anyhow::{bail, Context, Result};
use clap::Args;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::StationContext;
use crate::cli::output::{create_spinner, status, OutputConfig};
use crate::core::orchestrator::Orchestrator;
use crate::core::session::{SerialSelection, SessionOutcome, SessionReport, SessionRequest};
use crate::infra::artifacts::ArtifactStore;
use crate::infra::monitor::{DeviceMonitor, DeviceRef, HostEnumerator};
use crate::infra::serial::SerialPortOpener;
use crate::infra::upload::UploadExecutor;

/// Arguments of `provisioner run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Serial number to program
    #[arg(long, conflicts_with = "next", required_unless_present = "next")]
    pub serial: Option<String>,

    /// Program the next unprogrammed serial in the ledger
    #[arg(long)]
    pub next: bool,

    /// Product id or path to a profile file
    #[arg(short, long)]
    pub profile: String,

    /// Firmware artifact (.uf2, .elf or .hex)
    #[arg(short, long)]
    pub firmware: PathBuf,

    /// Firmware version recorded in the ledger
    #[arg(long)]
    pub firmware_version: Option<String>,

    /// Hardware revision
    #[arg(long)]
    pub hardware_version: Option<String>,

    /// Region code
    #[arg(long)]
    pub region: Option<String>,

    /// Production batch
    #[arg(long)]
    pub batch: Option<String>,

    /// Operator notes
    #[arg(long)]
    pub notes: Option<String>,

    /// Upload-mode device to use instead of waiting for one
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Skip the firmware identity probe
    #[arg(long)]
    pub force: bool,

    /// Program a unit the ledger already shows as programmed
    #[arg(long)]
    pub reprogram: bool,

    /// Skip confirmation prompts
    #[arg(short, long)]
    pub yes: bool,
}

/// Execute the run command
pub async fn execute(station: &StationContext, output: &OutputConfig, args: RunArgs) -> Result<()> {
    let settings = &station.settings;
    let profile = station
        .profiles()
        .resolve(&args.profile)
        .with_context(|| format!("Failed to load profile '{}'", args.profile))?;
    let ledger = Arc::new(station.open_ledger()?);

    if (args.reprogram || args.force) && !args.yes {
        require_confirmation(&args)?;
    }

    let enumerator = Arc::new(HostEnumerator::new(
        settings.vendor_id(),
        settings.volume_label(),
    ));
    let monitor = Arc::new(DeviceMonitor::new(enumerator, settings.poll_interval()));
    {
        let monitor = Arc::clone(&monitor);
        tokio::task::spawn_blocking(move || monitor.poll_once())
            .await
            .context("Device monitor failed to start")?;
    }
    let monitor_cancel = CancellationToken::new();
    let monitor_task = Arc::clone(&monitor).spawn(monitor_cancel.clone());

    let uploader = UploadExecutor::new(settings.uploader_config())?;
    let opener = Arc::new(SerialPortOpener::new(
        settings.baud_rate(),
        settings.line_ending(),
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(
            ledger,
            monitor,
            uploader,
            opener,
            settings.orchestrator_config(),
        )
        .with_artifacts(ArtifactStore::new(settings.artifacts_dir(&station.dirs))),
    );

    let serial = match args.serial {
        Some(serial) => SerialSelection::Explicit(serial),
        None => SerialSelection::Next,
    };
    let mut request = SessionRequest::new(serial, Arc::new(profile), args.firmware);
    request.firmware_version = args.firmware_version;
    request.hardware_version = args.hardware_version;
    request.region_code = args.region;
    request.batch_id = args.batch;
    request.notes = args.notes;
    request.device = args.device.map(|path| DeviceRef { path, label: None });
    request.force = args.force;
    request.reprogram = args.reprogram;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, aborting session");
                cancel.cancel();
            }
        });
    }

    let handle = orchestrator.start(request, cancel);
    if output.interactive() {
        let spinner = create_spinner("Starting session");
        let mut states = handle.state.clone();
        let progress = {
            let spinner = spinner.clone();
            tokio::spawn(async move {
                loop {
                    let state = *states.borrow_and_update();
                    spinner.set_message(state.to_string());
                    if state.is_terminal() || states.changed().await.is_err() {
                        break;
                    }
                }
            })
        };
        let report = handle.wait().await;
        progress.abort();
        spinner.finish_and_clear();
        finish(output, &report?, monitor_cancel, monitor_task).await
    } else {
        let report = handle.wait().await?;
        finish(output, &report, monitor_cancel, monitor_task).await
    }
}

async fn finish(
    output: &OutputConfig,
    report: &SessionReport,
    monitor_cancel: CancellationToken,
    monitor_task: tokio::task::JoinHandle<()>,
) -> Result<()> {
    monitor_cancel.cancel();
    if let Err(e) = monitor_task.await {
        tracing::debug!("Device monitor task ended with {}", e);
    }

    if output.json {
        output.json(report)?;
    } else {
        print_report(output, report);
    }

    match &report.outcome {
        SessionOutcome::Completed { .. } => Ok(()),
        SessionOutcome::Failed { failure } => bail!("{}: {}", failure.kind(), failure),
    }
}

fn print_report(output: &OutputConfig, report: &SessionReport) {
    let serial = report.serial_number.as_deref().unwrap_or("-");
    output.line("");
    output.line(&format!("Session {}", report.session_id));
    output.line(&format!("  Serial:   {serial}"));
    output.line(&format!("  Product:  {}", report.product_id));
    if let Some(port) = &report.port {
        output.line(&format!("  Port:     {port}"));
    }
    for step in &report.steps {
        let mark = if step.passed {
            status::SUCCESS
        } else {
            status::ERROR
        };
        output.line(&format!(
            "  {mark} {} ({} attempt(s))",
            step.id, step.attempts
        ));
    }
    if let Some(verification) = &report.verification {
        for field in &verification.fields {
            let mark = if field.passed {
                status::SUCCESS
            } else {
                status::ERROR
            };
            output.line(&format!(
                "  {mark} {} = {} (expected {})",
                field.name,
                field.actual.as_deref().unwrap_or("<missing>"),
                field.expected
            ));
        }
    }
    if let Some(error) = &report.ledger_error {
        output.warning(&format!("Outcome not recorded in the ledger: {error}"));
    }
    if let SessionOutcome::Completed { event } = &report.outcome {
        output.success(&format!("{serial} {event}"));
    }
}

/// Ask before overriding programmed-unit protection
fn require_confirmation(args: &RunArgs) -> Result<()> {
    let target = args.serial.as_deref().unwrap_or("the next unit");
    eprintln!();
    eprintln!("⚠️  WARNING: programmed-unit protection is disabled for {target}!");
    if args.reprogram {
        eprintln!("   --reprogram overwrites a unit the ledger shows as programmed.");
    }
    if args.force {
        eprintln!("   --force skips the firmware identity check on the device.");
    }
    eprintln!();
    eprint!("   Are you sure you want to continue? [y/N] ");
    io::stderr().flush()?;

    // In non-interactive mode (no TTY), fail
    if !io::stdin().is_terminal() {
        bail!(
            "Cannot prompt for confirmation in non-interactive mode.\n\
             Use --yes to skip confirmation."
        );
    }

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    if input != "y" && input != "yes" {
        bail!("Session cancelled by operator.");
    }

    Ok(())
}
