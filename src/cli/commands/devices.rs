//! CLI command implementation for `provisioner devices`

use anyhow::{Context, Result};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::StationContext;
use crate::cli::output::{status, OutputConfig};
use crate::infra::monitor::{DeviceEvent, DeviceMonitor, HostEnumerator};

/// List upload-mode devices and ports, optionally watching for changes
pub async fn execute(station: &StationContext, output: &OutputConfig, watch: bool) -> Result<()> {
    let settings = &station.settings;
    let enumerator = Arc::new(HostEnumerator::new(
        settings.vendor_id(),
        settings.volume_label(),
    ));
    let monitor = Arc::new(DeviceMonitor::new(enumerator, settings.poll_interval()));
    {
        let monitor = Arc::clone(&monitor);
        tokio::task::spawn_blocking(move || monitor.poll_once())
            .await
            .context("Device enumeration failed")?;
    }

    let snapshot = monitor.snapshot();
    if output.json && !watch {
        return output.json(&snapshot);
    }

    if !output.json {
        let uploader = settings.uploader_config();
        match which::which(&uploader.program) {
            Ok(path) => output.line(&format!(
                "{} Flashing utility: {}",
                status::SUCCESS,
                path.display()
            )),
            Err(_) => output.warning(&format!(
                "Flashing utility '{}' not found in PATH",
                uploader.program
            )),
        }

        if snapshot.devices.is_empty() {
            output.line(&format!("{} No upload-mode devices", status::INFO));
        }
        for device in &snapshot.devices {
            output.line(&format!(
                "  device  {} [{}]",
                device,
                device.label.as_deref().unwrap_or("?")
            ));
        }
        if snapshot.ports.is_empty() {
            output.line(&format!("{} No serial ports", status::INFO));
        }
        for port in &snapshot.ports {
            output.line(&format!(
                "  port    {}{}",
                port,
                port.serial_number
                    .as_deref()
                    .map(|s| format!(" serial {s}"))
                    .unwrap_or_default()
            ));
        }
    }

    if !watch {
        return Ok(());
    }

    let mut events = monitor.subscribe();
    let cancel = CancellationToken::new();
    let task = Arc::clone(&monitor).spawn(cancel.clone());
    output.line("Watching for device changes, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(event) => print_event(output, &event)?,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} device event(s)", missed);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    cancel.cancel();
    if let Err(e) = task.await {
        tracing::debug!("Device monitor task ended with {}", e);
    }
    Ok(())
}

fn print_event(output: &OutputConfig, event: &DeviceEvent) -> Result<()> {
    let (kind, subject) = match event {
        DeviceEvent::Attached(device) => ("attached", device.to_string()),
        DeviceEvent::Detached(device) => ("detached", device.to_string()),
        DeviceEvent::PortAppeared(port) => ("port-appeared", port.to_string()),
        DeviceEvent::PortVanished(port) => ("port-vanished", port.to_string()),
    };
    if output.json {
        // One object per line so the stream can be piped
        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({ "event": kind, "subject": subject }))?
        );
    } else {
        output.line(&format!(
            "{} {kind:<14} {subject}",
            chrono::Local::now().format("%H:%M:%S")
        ));
    }
    Ok(())
}
