//! Output formatting and progress indicators
//!
//! This module provides utilities for displaying spinners, status prefixes
//! and formatted messages to the operator.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

/// Output preferences from the global flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputConfig {
    /// Only errors
    pub quiet: bool,
    /// Machine-readable output
    pub json: bool,
    /// Verbosity level
    pub verbose: u8,
}

impl OutputConfig {
    /// Output preferences
    pub fn new(quiet: bool, json: bool, verbose: u8) -> Self {
        Self {
            quiet,
            json,
            verbose,
        }
    }

    /// Whether human-readable progress should be drawn
    pub fn interactive(&self) -> bool {
        !self.quiet && !self.json
    }

    /// Print a line unless quiet or in JSON mode
    pub fn line(&self, message: &str) {
        if self.interactive() {
            println!("{message}");
        }
    }

    /// Print a success line
    pub fn success(&self, message: &str) {
        self.line(&format!("{} {message}", status::SUCCESS));
    }

    /// Print a warning line (not suppressed by `--quiet`)
    pub fn warning(&self, message: &str) {
        if !self.json {
            eprintln!("{} {message}", status::WARNING);
        }
    }

    /// Print a value as pretty JSON
    pub fn json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// Print an error and its causes to stderr
pub fn display_error(error: &anyhow::Error) {
    eprintln!("{} Error: {error}", status::ERROR);
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
}

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.blue} {msg} ({elapsed})")
            .expect("Invalid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";

    /// Warning prefix (yellow triangle)
    pub const WARNING: &str = "⚠";

    /// Info prefix (blue circle)
    pub const INFO: &str = "ℹ";
}
