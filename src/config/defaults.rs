//! Default configuration values

/// Flashing utility
pub const UPLOAD_PROGRAM: &str = "picotool";

/// Upload arguments; `{artifact}` and `{device}` are substituted
pub const UPLOAD_ARGS: &str = "load {artifact} -fx";

/// Arguments that make the utility print the existing firmware identity
pub const IDENTITY_ARGS: &str = "info -a";

/// Firmware identity marker in the probe output
pub const IDENTITY_PATTERN: &str = r"DEVICE_ID:([^:\s]+):END";

/// Upload timeout (in seconds)
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;

/// Accepted firmware artifact extensions
pub const ARTIFACT_EXTENSIONS: &[&str] = &["elf", "hex", "uf2"];

/// Smallest plausible firmware artifact (in bytes)
pub const MIN_ARTIFACT_SIZE: u64 = 100;

/// Largest accepted firmware artifact (in bytes)
pub const MAX_ARTIFACT_SIZE: u64 = 16 * 1024 * 1024;

/// Serial baud rate
pub const BAUD_RATE: u32 = 115_200;

/// Line ending appended to every command
pub const LINE_ENDING: &str = "\r\n";

/// Maximum wait for the port after a reset (in milliseconds)
pub const SERIAL_TIMEOUT_MS: u64 = 10_000;

/// Churn window before a candidate port is bound (in milliseconds)
pub const SETTLE_WINDOW_MS: u64 = 500;

/// Port open attempts after binding
pub const PORT_OPEN_ATTEMPTS: u32 = 10;

/// Delay between port open attempts (in milliseconds)
pub const PORT_OPEN_DELAY_MS: u64 = 200;

/// Maximum wait for an upload-mode device (in milliseconds)
pub const DEVICE_TIMEOUT_MS: u64 = 30_000;

/// Host poll interval (in milliseconds)
pub const POLL_INTERVAL_MS: u64 = 250;

/// USB vendor id of supported devices
pub const USB_VENDOR_ID: u16 = 0x2E8A;

/// Volume label of the upload-mode mass-storage device
pub const VOLUME_LABEL: &str = "RPI-RP2";

/// Info file present on upload-mode volumes
pub const VOLUME_INFO_FILE: &str = "INFO_UF2.TXT";

/// Mount roots probed for removable volumes
pub const MOUNT_ROOTS: &[&str] = &["/media", "/run/media", "/mnt"];

/// Default per-step response timeout (in milliseconds)
pub const STEP_TIMEOUT_MS: u64 = 2000;

/// Default delay between step attempts (in milliseconds)
pub const RETRY_DELAY_MS: u64 = 200;

/// Largest allowed number of attempts for one step
pub const MAX_STEP_ATTEMPTS: u32 = 5;

/// Default ready-banner timeout (in milliseconds)
pub const READY_TIMEOUT_MS: u64 = 10_000;

/// Default verification query timeout (in milliseconds)
pub const QUERY_TIMEOUT_MS: u64 = 3000;

/// Silence that ends a verification response (in milliseconds)
pub const IDLE_GAP_MS: u64 = 300;

/// Ledger file name under the data directory
pub const LEDGER_FILE: &str = "ledger.toml";

/// Maximum wait for the ledger write guard (in milliseconds)
pub const WRITE_GUARD_WAIT_MS: u64 = 2000;

/// Station identifier when none is configured
pub const STATION_ID: &str = "station-1";

/// Minimum proptest iterations
pub const MIN_PROPTEST_ITERATIONS: u32 = 100;
