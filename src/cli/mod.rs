//! Command-line interface module
//!
//! This module handles argument parsing and output formatting.
//! It contains no business logic - that belongs in the [`crate::core`] module.

pub mod commands;
pub mod output;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use commands::{Commands, StationContext};
use output::OutputConfig;

/// Provisioner - factory provisioning and verification station
///
/// Uploads firmware, provisions identity over the serial port, verifies the
/// result and records every outcome in a traceability ledger.
#[derive(Parser, Debug)]
#[command(name = "provisioner")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Station settings file
    #[arg(long, global = true, env = "PROVISIONER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Ledger file (overrides the settings)
    #[arg(long, global = true, env = "PROVISIONER_LEDGER")]
    pub ledger: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self, output: &OutputConfig) -> Result<()> {
        if let Some(cmd) = self.command {
            let station = StationContext::load(self.config, self.ledger)?;
            cmd.run(&station, output).await
        } else {
            // No subcommand provided, show help
            use clap::CommandFactory;
            let mut cmd = Self::command();
            cmd.print_help()?;
            Ok(())
        }
    }
}
