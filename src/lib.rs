//! Provisioner - factory provisioning and verification station
//!
//! This library drives a provisioning station: it uploads firmware to
//! devices in upload mode, provisions their identity over the serial port,
//! verifies what the device reports and records every outcome in an
//! append-only traceability ledger.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Profiles, ledger, engines and the session orchestrator
//! - [`infra`] - Infrastructure layer (devices, serial ports, processes, filesystem)
//! - [`config`] - Configuration constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
