//! CLI command implementations for `provisioner profile`

use anyhow::{Context, Result};

use super::StationContext;
use crate::cli::output::{status, OutputConfig};
use crate::core::profile::StepKind;

/// Load and validate a profile
pub fn execute_check(station: &StationContext, output: &OutputConfig, profile: &str) -> Result<()> {
    let loaded = station
        .profiles()
        .resolve(profile)
        .with_context(|| format!("Profile '{profile}' is invalid"))?;

    if output.json {
        return output.json(&serde_json::json!({
            "product_id": loaded.product_id(),
            "valid": true,
            "steps": loaded.steps.len(),
            "fields": loaded.verification.fields.len(),
            "queries": loaded.queries(),
        }));
    }

    output.success(&format!(
        "{} is valid ({} step(s), {} verification field(s))",
        loaded.product_id(),
        loaded.steps.len(),
        loaded.verification.fields.len()
    ));
    for step in &loaded.steps {
        let kind = match step.kind {
            StepKind::Unlock => "unlock",
            StepKind::Write => "write",
            StepKind::Verify => "verify",
            StepKind::Reboot => "reboot",
        };
        output.line(&format!(
            "  {:<8} {:<16} {} ({}x)",
            kind,
            step.id,
            step.command,
            step.attempts
        ));
    }
    for field in &loaded.verification.fields {
        output.line(&format!("  field    {:<16} via {}", field.name, field.query));
    }
    Ok(())
}

/// List profiles in the profile directory
pub fn execute_list(station: &StationContext, output: &OutputConfig) -> Result<()> {
    let registry = station.profiles();
    let profiles = registry.list();

    if output.json {
        let entries: Vec<_> = profiles
            .iter()
            .map(|(path, result)| match result {
                Ok(profile) => serde_json::json!({
                    "path": path,
                    "product_id": profile.product_id(),
                    "description": profile.profile.description,
                }),
                Err(e) => serde_json::json!({
                    "path": path,
                    "error": e.to_string(),
                }),
            })
            .collect();
        return output.json(&entries);
    }

    if profiles.is_empty() {
        output.line(&format!(
            "{} No profiles in {}",
            status::INFO,
            registry.dir().display()
        ));
        return Ok(());
    }
    for (path, result) in &profiles {
        match result {
            Ok(profile) => output.line(&format!(
                "{} {:<20} {}",
                status::SUCCESS,
                profile.product_id(),
                profile.profile.description.as_deref().unwrap_or("")
            )),
            Err(e) => output.warning(&format!("{}: {e}", path.display())),
        }
    }
    Ok(())
}
