//! Test utilities
//!
//! Proptest generators, a sample product profile and scripted stand-ins for
//! the host, serial ports and devices.

#[cfg(test)]
use crate::core::profile::Profile;

/// Profile used across unit tests
#[cfg(test)]
pub const SAMPLE_PROFILE: &str = r#"
[profile]
product_id = "sensor-node"
description = "Sensor node rev B"
ready = { marker = "SYSTEM READY", timeout_ms = 200 }

[variables]
unlock_code = "6D61676963"

[[steps]]
id = "unlock"
kind = "unlock"
command = "PROV UNLOCK {unlock_code}"
attempts = 3
timeout_ms = 100
retry_delay_ms = 10

[[steps]]
id = "serial"
kind = "write"
field = "serial_number"
command = "PROV SET_SN {serial_number}"
timeout_ms = 100

[[steps]]
id = "region"
kind = "write"
field = "region_code"
command = "PROV SET_REGION {region_code}"
timeout_ms = 100

[[steps]]
id = "status"
kind = "verify"
command = "PROV STATUS"
timeout_ms = 100
expect = { kind = "all_of", matchers = [
    { kind = "contains", value = "{serial_number}" },
    { kind = "contains", value = "{region_code}" },
] }

[[steps]]
id = "reboot"
kind = "reboot"
command = "REBOOT"

[verification]
query_timeout_ms = 200
idle_gap_ms = 20

[[verification.fields]]
name = "serial_number"
query = "SYSINFO"
parser = { kind = "key_value", key = "serial_number", aliases = ["device_serial", "serial"] }
expect = { kind = "exact", value = "{serial_number}" }

[[verification.fields]]
name = "region"
query = "SYSINFO"
parser = { kind = "key_value", key = "region", aliases = ["region_code"] }
expect = { kind = "exact", value = "{region_code}" }

[[verification.fields]]
name = "firmware_version"
query = "SYSINFO"
parser = { kind = "key_value", key = "firmware_version", aliases = ["fw_version"] }
expect = { kind = "exact", value = "{firmware_version}" }

[[verification.fields]]
name = "ip_address"
query = "NETINFO"
parser = { kind = "regex", pattern = 'IP:\s*(\d+\.\d+\.\d+\.\d+)' }
expect = { kind = "pattern", pattern = '^\d+\.\d+\.\d+\.\d+$' }
"#;

/// Parsed [`SAMPLE_PROFILE`]
#[cfg(test)]
pub fn sample_profile() -> Profile {
    Profile::parse(SAMPLE_PROFILE, "sample").expect("sample profile is valid")
}

#[cfg(test)]
pub mod generators {
    use proptest::prelude::*;

    /// Generate a plausible serial number
    pub fn serial_number() -> impl Strategy<Value = String> {
        "[A-Z]{2,4}-[0-9]{4,8}"
    }

    /// Generate a region code
    pub fn region_code() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("EU".to_string()),
            Just("US".to_string()),
            Just("JP".to_string()),
            Just("CN".to_string()),
        ]
    }

    /// Generate a semver firmware version
    pub fn firmware_version() -> impl Strategy<Value = String> {
        (0u32..20, 0u32..50, 0u32..100)
            .prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
    }

    /// Generate a response key with optional tag and punctuation
    pub fn response_key() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just(String::new()), "\\[[A-Z]{2,5}\\] "],
            "[A-Za-z]{1,8}",
            prop_oneof![Just(" "), Just("-"), Just("_"), Just(" / ")],
            "[A-Za-z]{1,8}",
        )
            .prop_map(|(tag, a, sep, b)| format!("{tag}{a}{sep}{b}"))
    }
}

#[cfg(test)]
pub mod fakes {
    //! Scripted host, port opener and device

    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::{EnumerationError, LinkError};
    use crate::infra::monitor::{DeviceEnumerator, DeviceRef, PortRef};
    use crate::infra::serial::{PortOpener, SerialLink};

    struct Rule {
        prefix: String,
        responses: Vec<Vec<String>>,
        served: usize,
    }

    #[derive(Default)]
    struct DeviceState {
        rules: Vec<Rule>,
        boot: Vec<String>,
        queue: VecDeque<String>,
        sent: Vec<String>,
        fail_writes: bool,
    }

    /// Device answering commands from a script
    ///
    /// Commands are matched by prefix; the most recently added rule wins.
    /// Every opened link first delivers the boot lines.
    #[derive(Clone)]
    pub struct ScriptedDevice {
        port: String,
        state: Arc<Mutex<DeviceState>>,
    }

    impl ScriptedDevice {
        /// Silent device on `port`
        pub fn new(port: &str) -> Self {
            Self {
                port: port.to_string(),
                state: Arc::new(Mutex::new(DeviceState::default())),
            }
        }

        /// Port name
        pub fn port(&self) -> &str {
            &self.port
        }

        /// Lines printed after every (re)open
        #[must_use]
        pub fn boot(self, lines: &[&str]) -> Self {
            self.state.lock().unwrap().boot = lines.iter().map(ToString::to_string).collect();
            self
        }

        /// Always answer `prefix` with `lines`
        #[must_use]
        pub fn respond(self, prefix: &str, lines: &[&str]) -> Self {
            self.respond_seq(prefix, &[lines])
        }

        /// Answer successive `prefix` commands with successive responses;
        /// the last one repeats
        #[must_use]
        pub fn respond_seq(self, prefix: &str, responses: &[&[&str]]) -> Self {
            self.state.lock().unwrap().rules.push(Rule {
                prefix: prefix.to_string(),
                responses: responses
                    .iter()
                    .map(|r| r.iter().map(ToString::to_string).collect())
                    .collect(),
                served: 0,
            });
            self
        }

        /// Make writes fail
        pub fn fail_writes(&self, fail: bool) {
            self.state.lock().unwrap().fail_writes = fail;
        }

        /// Commands received so far
        pub fn sent(&self) -> Vec<String> {
            self.state.lock().unwrap().sent.clone()
        }

        /// Open a link to the device
        pub fn link(&self) -> Box<dyn SerialLink> {
            {
                let mut state = self.state.lock().unwrap();
                let boot = state.boot.clone();
                state.queue.extend(boot);
            }
            Box::new(ScriptedLink {
                port: self.port.clone(),
                state: Arc::clone(&self.state),
            })
        }
    }

    struct ScriptedLink {
        port: String,
        state: Arc<Mutex<DeviceState>>,
    }

    impl SerialLink for ScriptedLink {
        fn port_name(&self) -> &str {
            &self.port
        }

        fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(LinkError::Io {
                    port: self.port.clone(),
                    error: "device disconnected".to_string(),
                });
            }
            state.sent.push(line.to_string());
            let reply = state
                .rules
                .iter_mut()
                .rev()
                .find(|r| line.starts_with(&r.prefix))
                .and_then(|rule| {
                    let index = rule.served.min(rule.responses.len().saturating_sub(1));
                    rule.served += 1;
                    rule.responses.get(index).cloned()
                });
            if let Some(lines) = reply {
                state.queue.extend(lines);
            }
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
            let line = self.state.lock().unwrap().queue.pop_front();
            if line.is_none() {
                // Quiet line: do not spin callers polling until a deadline
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
            }
            Ok(line)
        }
    }

    /// Opens scripted devices by port name
    #[derive(Clone, Default)]
    pub struct ScriptedOpener {
        devices: Arc<Mutex<HashMap<String, ScriptedDevice>>>,
        failures_left: Arc<Mutex<u32>>,
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedOpener {
        /// Opener without devices
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a device under its port name
        #[must_use]
        pub fn with_device(self, device: &ScriptedDevice) -> Self {
            self.devices
                .lock()
                .unwrap()
                .insert(device.port().to_string(), device.clone());
            self
        }

        /// Fail the next `count` opens
        pub fn fail_next(&self, count: u32) {
            *self.failures_left.lock().unwrap() = count;
        }

        /// Ports opened successfully, in order
        pub fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    impl PortOpener for ScriptedOpener {
        fn open(&self, port: &PortRef) -> Result<Box<dyn SerialLink>, LinkError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(LinkError::Open {
                        port: port.name.clone(),
                        error: "Permission denied".to_string(),
                    });
                }
            }
            let device = self.devices.lock().unwrap().get(&port.name).cloned();
            match device {
                Some(device) => {
                    self.opened.lock().unwrap().push(port.name.clone());
                    Ok(device.link())
                }
                None => Err(LinkError::Open {
                    port: port.name.clone(),
                    error: "No such file or directory".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct HostState {
        devices: BTreeSet<DeviceRef>,
        ports: BTreeSet<PortRef>,
        failing: bool,
    }

    /// Host whose devices and ports are set by the test
    #[derive(Clone, Default)]
    pub struct ScriptedHost {
        state: Arc<Mutex<HostState>>,
    }

    impl ScriptedHost {
        /// Empty host
        pub fn new() -> Self {
            Self::default()
        }

        /// Plug in a port
        pub fn add_port(&self, name: &str) {
            self.state.lock().unwrap().ports.insert(PortRef::named(name));
        }

        /// Unplug a port
        pub fn remove_port(&self, name: &str) {
            self.state.lock().unwrap().ports.remove(&PortRef::named(name));
        }

        /// Mount an upload-mode volume
        pub fn add_device(&self, path: &str) -> DeviceRef {
            let device = DeviceRef {
                path: PathBuf::from(path),
                label: Some("RPI-RP2".to_string()),
            };
            self.state.lock().unwrap().devices.insert(device.clone());
            device
        }

        /// Unmount an upload-mode volume
        pub fn remove_device(&self, path: &str) {
            self.state
                .lock()
                .unwrap()
                .devices
                .retain(|d| d.path != PathBuf::from(path));
        }

        /// Make enumeration fail
        pub fn set_failing(&self, failing: bool) {
            self.state.lock().unwrap().failing = failing;
        }
    }

    impl DeviceEnumerator for ScriptedHost {
        fn upload_devices(&self) -> Result<Vec<DeviceRef>, EnumerationError> {
            let state = self.state.lock().unwrap();
            if state.failing {
                return Err(EnumerationError::Storage("scripted failure".to_string()));
            }
            Ok(state.devices.iter().cloned().collect())
        }

        fn ports(&self) -> Result<Vec<PortRef>, EnumerationError> {
            let state = self.state.lock().unwrap();
            if state.failing {
                return Err(EnumerationError::Ports("scripted failure".to_string()));
            }
            Ok(state.ports.iter().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use crate::core::matcher::normalize_key;
    use proptest::prelude::*;

    #[test]
    fn test_sample_profile_is_valid() {
        let profile = super::sample_profile();
        assert_eq!(profile.product_id(), "sensor-node");
        assert!(profile.has_reboot());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_serial_number_generator(serial in serial_number()) {
            prop_assert!(crate::core::ledger::validate_serial(&serial).is_ok());
        }

        #[test]
        fn test_normalized_keys_are_clean(key in response_key()) {
            let normalized = normalize_key(&key);
            prop_assert!(!normalized.is_empty());
            prop_assert!(normalized.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            prop_assert!(!normalized.starts_with('_') && !normalized.ends_with('_'));
            prop_assert!(!normalized.contains("__"));
            prop_assert_eq!(normalize_key(&normalized), normalized.clone());
        }

        #[test]
        fn test_region_code_generator(region in region_code()) {
            prop_assert_eq!(region.len(), 2);
        }

        #[test]
        fn test_firmware_version_generator(version in firmware_version()) {
            prop_assert_eq!(version.split('.').count(), 3);
        }
    }
}
