//! CLI command implementations for `provisioner config`

use anyhow::{bail, Context, Result};

use super::StationContext;
use crate::cli::output::OutputConfig;
use crate::core::settings::{LineEnding, Settings};

/// Show effective settings and paths
pub fn execute_show(station: &StationContext, output: &OutputConfig) -> Result<()> {
    let settings = &station.settings;
    let uploader = settings.uploader_config();
    let orchestrator = settings.orchestrator_config();
    let ledger = station.ledger_path();
    let profiles = settings.profiles_dir(&station.dirs);
    let artifacts = settings.artifacts_dir(&station.dirs);

    if output.json {
        return output.json(&serde_json::json!({
            "settings_file": station.settings_path,
            "station_id": orchestrator.station_id,
            "paths": {
                "ledger": ledger,
                "profiles": profiles,
                "artifacts": artifacts,
            },
            "uploader": {
                "program": uploader.program,
                "args": uploader.args,
                "identity_args": uploader.identity_args,
                "identity_pattern": uploader.identity_pattern,
                "timeout_secs": uploader.timeout.as_secs(),
            },
            "serial": {
                "baud_rate": settings.baud_rate(),
                "line_ending": settings.line_ending().escape_default().to_string(),
                "timeout_ms": orchestrator.reconnect.timeout.as_millis(),
                "settle_ms": orchestrator.reconnect.settle.as_millis(),
                "open_attempts": orchestrator.open_attempts,
            },
            "monitor": {
                "poll_interval_ms": settings.poll_interval().as_millis(),
                "vendor_id": settings.vendor_id().map(|v| format!("{v:04x}")),
                "volume_label": settings.volume_label(),
                "device_timeout_ms": orchestrator.device_timeout.as_millis(),
            },
        }));
    }

    let file_state = if station.settings_path.exists() {
        ""
    } else {
        " (not present, using defaults)"
    };
    println!("Settings:   {}{file_state}", station.settings_path.display());
    println!("Station:    {}", orchestrator.station_id);
    println!("Ledger:     {}", ledger.display());
    println!("Profiles:   {}", profiles.display());
    println!("Artifacts:  {}", artifacts.display());
    println!();
    println!("Uploader:   {} {}", uploader.program, uploader.args);
    if uploader.identity_args.trim().is_empty() {
        println!("Identity:   disabled");
    } else {
        println!(
            "Identity:   {} {} (pattern {})",
            uploader.program, uploader.identity_args, uploader.identity_pattern
        );
    }
    println!("Timeout:    {} s", uploader.timeout.as_secs());
    println!();
    println!(
        "Serial:     {} baud, line ending \"{}\"",
        settings.baud_rate(),
        settings.line_ending().escape_default()
    );
    println!(
        "Reconnect:  {} ms timeout, {} ms settle, {} open attempt(s)",
        orchestrator.reconnect.timeout.as_millis(),
        orchestrator.reconnect.settle.as_millis(),
        orchestrator.open_attempts
    );
    println!(
        "Monitor:    every {} ms, vendor {}, volume '{}'",
        settings.poll_interval().as_millis(),
        settings
            .vendor_id()
            .map_or_else(|| "any".to_string(), |v| format!("{v:04x}")),
        settings.volume_label()
    );
    Ok(())
}

/// Write a settings file with the default values spelled out
pub fn execute_init(station: &StationContext, output: &OutputConfig, force: bool) -> Result<()> {
    let path = &station.settings_path;
    if path.exists() && !force {
        bail!(
            "Settings file '{}' already exists. Use --force to overwrite.",
            path.display()
        );
    }

    let defaults = Settings::default();
    let uploader = defaults.uploader_config();
    let orchestrator = defaults.orchestrator_config();
    let mut settings = Settings::default();
    settings.station.station_id = Some(orchestrator.station_id);
    settings.uploader.program = Some(uploader.program);
    settings.uploader.args = Some(uploader.args);
    settings.uploader.identity_args = Some(uploader.identity_args);
    settings.uploader.identity_pattern = Some(uploader.identity_pattern);
    settings.uploader.timeout_secs = Some(uploader.timeout.as_secs());
    settings.serial.baud_rate = Some(defaults.baud_rate());
    settings.serial.line_ending = Some(LineEnding::Crlf);
    settings.serial.timeout_ms = Some(duration_ms(orchestrator.reconnect.timeout));
    settings.serial.settle_ms = Some(duration_ms(orchestrator.reconnect.settle));
    settings.serial.open_attempts = Some(orchestrator.open_attempts);
    settings.serial.open_delay_ms = Some(duration_ms(orchestrator.open_delay));
    settings.monitor.poll_interval_ms = Some(duration_ms(defaults.poll_interval()));
    settings.monitor.vendor_id = defaults.vendor_id();
    settings.monitor.volume_label = Some(defaults.volume_label().to_string());
    settings.monitor.device_timeout_ms = Some(duration_ms(orchestrator.device_timeout));

    settings
        .save_to_path(path)
        .with_context(|| "Failed to write station settings")?;
    output.success(&format!("Wrote {}", path.display()));
    Ok(())
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
