//! CLI command implementations for `provisioner ledger`

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;

use super::StationContext;
use crate::cli::output::{status, OutputConfig};
use crate::core::ledger::{self, DeviceRecord, DeviceStatus, TraceabilityLedger};

#[derive(Serialize)]
struct RecordSummary<'a> {
    serial_number: &'a str,
    status: DeviceStatus,
    firmware_version: Option<&'a str>,
    region_code: Option<&'a str>,
    batch_id: Option<&'a str>,
    last_event: Option<String>,
}

impl<'a> RecordSummary<'a> {
    fn new(record: &'a DeviceRecord) -> Self {
        Self {
            serial_number: &record.serial_number,
            status: record.status(),
            firmware_version: record.firmware_version.as_deref(),
            region_code: record.region_code.as_deref(),
            batch_id: record.batch_id.as_deref(),
            last_event: record
                .latest()
                .map(|e| format!("{} {}", e.event_type, e.timestamp.to_rfc3339())),
        }
    }
}

/// Create a ledger from a roster file and/or explicit serials
pub fn execute_init(
    output: &OutputConfig,
    path: &Path,
    serials_file: Option<&Path>,
    serials: &[String],
) -> Result<()> {
    let mut records = match serials_file {
        Some(file) => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read roster '{}'", file.display()))?;
            ledger::parse_roster(&content)?
        }
        None => Vec::new(),
    };
    records.extend(serials.iter().map(|s| DeviceRecord::new(s)));
    if records.is_empty() {
        bail!("No serial numbers given. Use --serials-file or --serial.");
    }

    let count = records.len();
    TraceabilityLedger::create(path, records)
        .with_context(|| format!("Failed to create ledger '{}'", path.display()))?;

    if output.json {
        output.json(&serde_json::json!({
            "path": path,
            "records": count,
        }))
    } else {
        output.success(&format!(
            "Created ledger {} with {count} serial number(s)",
            path.display()
        ));
        Ok(())
    }
}

/// Show all records, or the full history of one serial
pub fn execute_show(
    station: &StationContext,
    output: &OutputConfig,
    serial: Option<&str>,
) -> Result<()> {
    let ledger = station.open_ledger()?;

    if let Some(serial) = serial {
        let Some(record) = ledger.record(serial) else {
            bail!("Serial number '{serial}' is not in the ledger");
        };
        if output.json {
            return output.json(&record);
        }
        output.line(&format!("{} ({})", record.serial_number, record.status()));
        for (label, value) in [
            ("Firmware", &record.firmware_version),
            ("Hardware", &record.hardware_version),
            ("Region", &record.region_code),
            ("Batch", &record.batch_id),
            ("Notes", &record.notes),
        ] {
            if let Some(value) = value {
                output.line(&format!("  {label:<9} {value}"));
            }
        }
        if record.history.is_empty() {
            if let Some(date) = record.date_programmed {
                output.line(&format!("  Imported as programmed on {}", date.to_rfc3339()));
            } else {
                output.line("  No history");
            }
        }
        for entry in &record.history {
            output.line(&format!(
                "  {}  {:<20} by {}{}",
                entry.timestamp.to_rfc3339(),
                entry.event_type.to_string(),
                entry.programmed_by,
                entry
                    .metadata
                    .get("failure")
                    .or_else(|| entry.metadata.get("aborted_in"))
                    .map(|v| format!(" ({v})"))
                    .unwrap_or_default()
            ));
        }
        return Ok(());
    }

    let records = ledger.records();
    if output.json {
        let summaries: Vec<_> = records.iter().map(RecordSummary::new).collect();
        return output.json(&summaries);
    }
    output.line(&format!(
        "{:<20} {:<13} {:<10} {:<6} LAST EVENT",
        "SERIAL", "STATUS", "FIRMWARE", "REGION"
    ));
    for record in &records {
        let summary = RecordSummary::new(record);
        output.line(&format!(
            "{:<20} {:<13} {:<10} {:<6} {}",
            summary.serial_number,
            summary.status.to_string(),
            summary.firmware_version.unwrap_or("-"),
            summary.region_code.unwrap_or("-"),
            summary.last_event.as_deref().unwrap_or("-")
        ));
    }
    Ok(())
}

/// Show the next unprogrammed serial
pub fn execute_next(station: &StationContext, output: &OutputConfig) -> Result<()> {
    let ledger = station.open_ledger()?;
    let record = ledger.select_next_unprogrammed()?;
    if output.json {
        output.json(&RecordSummary::new(&record))
    } else {
        // Printed even with --quiet so scripts can capture it
        println!("{}", record.serial_number);
        Ok(())
    }
}

/// Show progress statistics
pub fn execute_stats(station: &StationContext, output: &OutputConfig) -> Result<()> {
    let ledger = station.open_ledger()?;
    let stats = ledger.statistics();
    if output.json {
        return output.json(&stats);
    }
    output.line(&format!("Total:        {}", stats.total));
    output.line(&format!(
        "Programmed:   {} ({} reprogrammed)",
        stats.programmed, stats.reprogrammed
    ));
    output.line(&format!("Failed:       {}", stats.failed));
    output.line(&format!("Available:    {}", stats.available));
    output.line(&format!("Remaining:    {}", stats.remaining));
    output.line(&format!("Complete:     {:.1}%", stats.percent_complete));
    Ok(())
}

/// Add a serial to the roster
pub fn execute_add(
    station: &StationContext,
    output: &OutputConfig,
    record: DeviceRecord,
) -> Result<()> {
    let ledger = station.open_ledger()?;
    let serial = record.serial_number.clone();
    ledger.add_record(record)?;
    output.success(&format!("Added {serial}"));
    Ok(())
}

/// Remove a stale serial lock
pub fn execute_unlock(station: &StationContext, output: &OutputConfig, serial: &str) -> Result<()> {
    let ledger = station.open_ledger()?;
    if ledger.record(serial).is_none() {
        bail!("Serial number '{serial}' is not in the ledger");
    }
    if ledger.force_unlock(serial)? {
        output.success(&format!("Removed stale lock for {serial}"));
    } else {
        output.line(&format!("{} {serial} was not locked", status::INFO));
    }
    Ok(())
}
