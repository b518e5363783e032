//! Provisioner CLI - factory provisioning and verification station
//!
//! Entry point for the provisioner command-line application.

use anyhow::Result;
use clap::Parser;

use provisioner::cli::output::{display_error, OutputConfig};
use provisioner::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let output_config = OutputConfig::new(cli.quiet, cli.json, cli.verbose);

    // Run the command and handle errors
    match cli.run(&output_config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            display_error(&e);
            std::process::exit(1);
        }
    }
}
