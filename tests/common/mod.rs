//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test station context
///
/// Creates a temporary directory holding the station's config and data
/// directories and runs the binary against it.
pub struct TestProject {
    /// Temporary directory for the test station
    pub dir: TempDir,
}

impl TestProject {
    /// Create a new test station in a temporary directory
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Get the path to the test station directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Config directory handed to the binary
    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    /// Data directory handed to the binary
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// Default ledger path inside the data directory
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir().join("ledger.toml")
    }

    /// Create a file in the test station
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Create a directory in the test station
    #[allow(dead_code)]
    pub fn create_dir(&self, name: &str) {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(path).expect("Failed to create directory");
    }

    /// Check if a file exists in the test station
    #[allow(dead_code)]
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read a file from the test station
    #[allow(dead_code)]
    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }

    /// Command for the binary with the station directories set
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_provisioner"));
        cmd.current_dir(self.path())
            .env("PROVISIONER_CONFIG_DIR", self.config_dir())
            .env("PROVISIONER_DATA_DIR", self.data_dir())
            .env_remove("PROVISIONER_CONFIG")
            .env_remove("PROVISIONER_LEDGER")
            .env_remove("RUST_LOG");
        cmd
    }

    /// Run the binary with `args`
    pub fn run(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .output()
            .expect("Failed to execute provisioner")
    }

    /// Create the default ledger from serial numbers
    #[allow(dead_code)]
    pub fn init_ledger(&self, serials: &[&str]) {
        let mut args = vec!["ledger", "init"];
        for serial in serials {
            args.push("--serial");
            args.push(serial);
        }
        let output = self.run(&args);
        assert!(
            output.status.success(),
            "ledger init failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Install a profile into the station's profile directory
    #[allow(dead_code)]
    pub fn install_profile(&self, product_id: &str, content: &str) {
        self.create_file(&format!("config/profiles/{product_id}.toml"), content);
    }

    /// Write station settings
    #[allow(dead_code)]
    pub fn write_settings(&self, content: &str) {
        self.create_file("config/config.toml", content);
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Stdout of a finished command
#[allow(dead_code)]
pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Stderr of a finished command
#[allow(dead_code)]
pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Sample product profile for testing
#[allow(dead_code)]
pub const SAMPLE_PROFILE: &str = r#"
[profile]
product_id = "sensor-node"
description = "Sensor node rev B"
ready = { marker = "SYSTEM READY", timeout_ms = 5000 }

[variables]
unlock_code = "6D61676963"

[[steps]]
id = "unlock"
kind = "unlock"
command = "PROV UNLOCK {unlock_code}"
attempts = 3

[[steps]]
id = "serial"
kind = "write"
field = "serial_number"
command = "PROV SET_SN {serial_number}"

[[steps]]
id = "status"
kind = "verify"
command = "PROV STATUS"
expect = { kind = "contains", value = "{serial_number}" }

[[steps]]
id = "reboot"
kind = "reboot"
command = "REBOOT"

[[verification.fields]]
name = "serial_number"
query = "SYSINFO"
parser = { kind = "key_value", key = "serial_number", aliases = ["serial"] }
expect = { kind = "exact", value = "{serial_number}" }
"#;

/// Profile referencing a variable nobody defines
#[allow(dead_code)]
pub const BROKEN_PROFILE: &str = r#"
[profile]
product_id = "broken"

[[steps]]
id = "serial"
kind = "write"
field = "serial_number"
command = "PROV SET_SN {serial_numbr}"
"#;

/// Sample roster file for testing
#[allow(dead_code)]
pub const SAMPLE_ROSTER: &str = "\
serial_number,hardware_version,region_code,batch_id,notes
# line 3 pilot run
SN-0001,rev2,EU,B-17
SN-0002,rev2,EU,B-17
SN-0003,rev2,US,B-18,spare
";

/// Bytes that pass the artifact size check
#[allow(dead_code)]
pub fn sample_firmware() -> Vec<u8> {
    let mut content = b"UF2\n".to_vec();
    content.resize(512, 0);
    content
}
