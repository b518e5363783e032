//! Traceability ledger
//!
//! The ledger is the source of truth for which serial numbers exist, which
//! have been programmed, and everything that ever happened to each unit.
//! History is append-only: outcomes are new entries, prior entries are never
//! rewritten, and the per-record status is derived from the latest entry.
//!
//! On disk the ledger is a TOML document. Every write reloads the document
//! under a ledger-wide write guard, applies the append and atomically
//! replaces the file, so concurrent station processes never lose entries.
//! Per-serial session locks are held both in-process and as `create_new`
//! lock files in `<ledger>.locks/`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::defaults;
use crate::error::{FilesystemError, LedgerError};
use crate::infra::filesystem::{self, LockFile};

/// Current ledger document version
pub const LEDGER_VERSION: u32 = 1;

/// Name of the ledger-wide write guard inside the locks directory
const WRITE_GUARD: &str = ".write.lock";

/// Ledger event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First successful programming
    Programmed,
    /// Successful programming of an already programmed unit
    ReprogramAttempt,
    /// Verification mismatch
    VerificationFailed,
    /// Any other terminal failure; the kind is in metadata `failure`
    SessionFailed,
    /// Operator abort; the state is in metadata `aborted_in`
    Aborted,
}

impl EventType {
    /// Whether the entry carries a programmed timestamp
    pub fn is_programmed(self) -> bool {
        matches!(self, Self::Programmed | Self::ReprogramAttempt)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Programmed => "Programmed",
            Self::ReprogramAttempt => "ReprogramAttempt",
            Self::VerificationFailed => "VerificationFailed",
            Self::SessionFailed => "SessionFailed",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Derived device status
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Never programmed
    Available,
    /// Programmed once
    Programmed,
    /// Latest attempt failed
    Failed,
    /// Programmed again after a previous programming
    Reprogrammed,
}

impl DeviceStatus {
    /// Whether the unit currently carries firmware from this station
    pub fn is_programmed(self) -> bool {
        matches!(self, Self::Programmed | Self::Reprogrammed)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Available => "available",
            Self::Programmed => "programmed",
            Self::Failed => "failed",
            Self::Reprogrammed => "reprogrammed",
        };
        f.write_str(name)
    }
}

/// Status implied by the latest entry of a record
pub fn derive_status(latest: Option<&LedgerEntry>) -> DeviceStatus {
    match latest.map(|e| e.event_type) {
        None => DeviceStatus::Available,
        Some(EventType::Programmed) => DeviceStatus::Programmed,
        Some(EventType::ReprogramAttempt) => DeviceStatus::Reprogrammed,
        Some(EventType::VerificationFailed | EventType::SessionFailed | EventType::Aborted) => {
            DeviceStatus::Failed
        }
    }
}

/// One appended ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    /// Serial number
    pub serial_number: String,

    /// What happened
    pub event_type: EventType,

    /// When it happened (UTC, strictly increasing per serial)
    pub timestamp: DateTime<Utc>,

    /// Firmware version programmed or attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Station/operator that produced the entry
    pub programmed_by: String,

    /// Profile-specific details
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LedgerEntry {
    /// New entry stamped now
    pub fn new(serial: &str, event_type: EventType, programmed_by: &str) -> Self {
        Self {
            serial_number: serial.to_string(),
            event_type,
            timestamp: Utc::now(),
            firmware_version: None,
            programmed_by: programmed_by.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the firmware version
    #[must_use]
    pub fn with_firmware(mut self, version: Option<String>) -> Self {
        self.firmware_version = version;
        self
    }

    /// Add a metadata value
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Override the proposed timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One device record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    /// Serial number (primary key)
    pub serial_number: String,

    /// Last programmed firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Hardware revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,

    /// Region code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,

    /// Production batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Programming date imported from a legacy roster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_programmed: Option<DateTime<Utc>>,

    /// Append-only history
    #[serde(default)]
    pub history: Vec<LedgerEntry>,
}

impl DeviceRecord {
    /// Fresh record without history
    pub fn new(serial: &str) -> Self {
        Self {
            serial_number: serial.to_string(),
            firmware_version: None,
            hardware_version: None,
            region_code: None,
            batch_id: None,
            notes: None,
            date_programmed: None,
            history: Vec::new(),
        }
    }

    /// Latest entry
    pub fn latest(&self) -> Option<&LedgerEntry> {
        self.history.last()
    }

    /// Derived status
    ///
    /// A record imported with a legacy programming date and no history
    /// counts as programmed.
    pub fn status(&self) -> DeviceStatus {
        if self.history.is_empty() && self.date_programmed.is_some() {
            return DeviceStatus::Programmed;
        }
        derive_status(self.latest())
    }

    /// Timestamp of the most recent programming
    pub fn date_programmed(&self) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .rev()
            .find(|e| e.event_type.is_programmed())
            .map(|e| e.timestamp)
            .or(self.date_programmed)
    }

    /// Append an entry and refresh the descriptive columns
    fn apply(&mut self, entry: LedgerEntry) {
        if entry.event_type.is_programmed() {
            if entry.firmware_version.is_some() {
                self.firmware_version.clone_from(&entry.firmware_version);
            }
            for (key, column) in [
                ("hardware_version", &mut self.hardware_version),
                ("region_code", &mut self.region_code),
                ("batch_id", &mut self.batch_id),
                ("notes", &mut self.notes),
            ] {
                if let Some(value) = entry.metadata.get(key).filter(|v| !v.is_empty()) {
                    *column = Some(value.clone());
                }
            }
        }
        self.history.push(entry);
    }
}

/// On-disk ledger document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerDocument {
    /// Document version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Records in roster order
    #[serde(default)]
    pub records: Vec<DeviceRecord>,
}

fn default_version() -> u32 {
    LEDGER_VERSION
}

impl LedgerDocument {
    fn new(records: Vec<DeviceRecord>) -> Self {
        Self {
            version: LEDGER_VERSION,
            records,
        }
    }

    fn record_mut(&mut self, serial: &str) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|r| r.serial_number == serial)
    }
}

/// Ledger progress summary
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerStatistics {
    /// Records in the ledger
    pub total: usize,
    /// Status programmed
    pub programmed: usize,
    /// Status reprogrammed
    pub reprogrammed: usize,
    /// Latest attempt failed
    pub failed: usize,
    /// Never attempted
    pub available: usize,
    /// Still waiting for firmware (available + failed)
    pub remaining: usize,
    /// Share of records carrying firmware
    pub percent_complete: f64,
}

/// Append-only traceability ledger
#[derive(Debug)]
pub struct TraceabilityLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerDocument>,
    held: Mutex<HashSet<String>>,
}

/// Exclusive claim on one serial number, released on drop
#[derive(Debug)]
pub struct SerialLock {
    ledger: Arc<TraceabilityLedger>,
    serial: String,
    file: Option<LockFile>,
}

impl SerialLock {
    /// Locked serial number
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Release the lock now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SerialLock {
    fn drop(&mut self) {
        drop(self.file.take());
        self.ledger.held().remove(&self.serial);
        tracing::debug!("Released lock on {}", self.serial);
    }
}

impl TraceabilityLedger {
    /// Ledger kept only in memory
    pub fn in_memory(records: Vec<DeviceRecord>) -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerDocument::new(records)),
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Create a new ledger file
    pub fn create(path: &Path, records: Vec<DeviceRecord>) -> Result<Self, LedgerError> {
        if path.exists() {
            return Err(LedgerError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        let mut seen = HashSet::new();
        for record in &records {
            validate_serial(&record.serial_number)?;
            if !seen.insert(record.serial_number.as_str()) {
                return Err(LedgerError::DuplicateSerial {
                    serial: record.serial_number.clone(),
                });
            }
        }
        let doc = LedgerDocument::new(records);
        persist(path, &doc)?;
        tracing::info!("Created ledger {} with {} records", path.display(), doc.records.len());
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(doc),
            held: Mutex::new(HashSet::new()),
        })
    }

    /// Open an existing ledger file
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let doc = load_document(path)?;
        tracing::debug!("Opened ledger {} ({} records)", path.display(), doc.records.len());
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(doc),
            held: Mutex::new(HashSet::new()),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn state(&self) -> MutexGuard<'_, LedgerDocument> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the backing file
    pub fn reload(&self) -> Result<(), LedgerError> {
        if let Some(path) = &self.path {
            let doc = load_document(path)?;
            *self.state() = doc;
        }
        Ok(())
    }

    /// All records in roster order
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.state().records.clone()
    }

    /// Look up one record
    pub fn record(&self, serial: &str) -> Option<DeviceRecord> {
        self.state()
            .records
            .iter()
            .find(|r| r.serial_number == serial)
            .cloned()
    }

    /// First record in roster order that does not carry firmware
    pub fn select_next_unprogrammed(&self) -> Result<DeviceRecord, LedgerError> {
        self.state()
            .records
            .iter()
            .find(|r| !r.status().is_programmed())
            .cloned()
            .ok_or(LedgerError::NoAvailableDevice)
    }

    /// Select and lock the first unprogrammed record nobody else holds
    pub fn claim_next_unprogrammed(self: &Arc<Self>) -> Result<SerialLock, LedgerError> {
        self.reload()?;
        let candidates: Vec<String> = self
            .state()
            .records
            .iter()
            .filter(|r| !r.status().is_programmed())
            .map(|r| r.serial_number.clone())
            .collect();

        for serial in candidates {
            match self.lock(&serial) {
                Ok(lock) => return Ok(lock),
                Err(LedgerError::Conflict { .. }) => {
                    tracing::debug!("Skipping {} (locked by another session)", serial);
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::NoAvailableDevice)
    }

    /// Lock a serial for one session; never blocks
    pub fn lock(self: &Arc<Self>, serial: &str) -> Result<SerialLock, LedgerError> {
        if self.record(serial).is_none() {
            return Err(LedgerError::UnknownSerial {
                serial: serial.to_string(),
            });
        }
        if !self.held().insert(serial.to_string()) {
            return Err(LedgerError::Conflict {
                serial: serial.to_string(),
            });
        }

        let file = match self.lock_path(serial) {
            Some(path) => match LockFile::acquire(&path, &lock_owner()) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.held().remove(serial);
                    return Err(match e {
                        FilesystemError::LockHeld { .. } => LedgerError::Conflict {
                            serial: serial.to_string(),
                        },
                        other => LedgerError::Storage(other),
                    });
                }
            },
            None => None,
        };

        tracing::debug!("Locked {}", serial);
        Ok(SerialLock {
            ledger: Arc::clone(self),
            serial: serial.to_string(),
            file,
        })
    }

    /// Remove a stale lock file left by a crashed station
    pub fn force_unlock(&self, serial: &str) -> Result<bool, LedgerError> {
        if self.held().contains(serial) {
            return Err(LedgerError::Conflict {
                serial: serial.to_string(),
            });
        }
        match self.lock_path(serial) {
            Some(path) => Ok(LockFile::break_stale(&path)?),
            None => Ok(false),
        }
    }

    /// Append an outcome for the locked serial and persist it
    ///
    /// The stored timestamp is bumped past the previous entry if needed, so
    /// timestamps are strictly increasing per serial. Returns the entry as
    /// stored.
    pub fn record_outcome(
        &self,
        lock: &SerialLock,
        mut entry: LedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        entry.serial_number = lock.serial().to_string();
        let stored = self.mutate(|doc| {
            let record = doc
                .record_mut(&entry.serial_number)
                .ok_or_else(|| LedgerError::UnknownSerial {
                    serial: entry.serial_number.clone(),
                })?;
            if let Some(previous) = record.latest() {
                if entry.timestamp <= previous.timestamp {
                    entry.timestamp = previous.timestamp + chrono::Duration::microseconds(1);
                }
            }
            record.apply(entry.clone());
            Ok(entry)
        })?;
        tracing::info!(
            "Recorded {} for {} at {}",
            stored.event_type,
            stored.serial_number,
            stored.timestamp.to_rfc3339()
        );
        Ok(stored)
    }

    /// Add a roster record
    pub fn add_record(&self, record: DeviceRecord) -> Result<(), LedgerError> {
        validate_serial(&record.serial_number)?;
        self.mutate(|doc| {
            if doc
                .records
                .iter()
                .any(|r| r.serial_number == record.serial_number)
            {
                return Err(LedgerError::DuplicateSerial {
                    serial: record.serial_number.clone(),
                });
            }
            doc.records.push(record);
            Ok(())
        })
    }

    /// Progress summary
    pub fn statistics(&self) -> LedgerStatistics {
        let state = self.state();
        let mut stats = LedgerStatistics {
            total: state.records.len(),
            programmed: 0,
            reprogrammed: 0,
            failed: 0,
            available: 0,
            remaining: 0,
            percent_complete: 0.0,
        };
        for record in &state.records {
            match record.status() {
                DeviceStatus::Available => stats.available += 1,
                DeviceStatus::Programmed => stats.programmed += 1,
                DeviceStatus::Reprogrammed => stats.reprogrammed += 1,
                DeviceStatus::Failed => stats.failed += 1,
            }
        }
        stats.remaining = stats.available + stats.failed;
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let done = (stats.programmed + stats.reprogrammed) as f64 / stats.total as f64;
            stats.percent_complete = done * 100.0;
        }
        stats
    }

    /// Apply a change under the write guard and persist it
    ///
    /// File-backed ledgers are reloaded first so appends made by other
    /// processes survive.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut LedgerDocument) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let _guard = self.write_guard()?;
        let mut state = self.state();
        let mut doc = match &self.path {
            Some(path) => load_document(path)?,
            None => state.clone(),
        };
        let result = change(&mut doc)?;
        if let Some(path) = &self.path {
            persist(path, &doc)?;
        }
        *state = doc;
        Ok(result)
    }

    fn locks_dir(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| {
            let mut name = p.file_name().unwrap_or_default().to_os_string();
            name.push(".locks");
            p.with_file_name(name)
        })
    }

    fn lock_path(&self, serial: &str) -> Option<PathBuf> {
        self.locks_dir()
            .map(|dir| dir.join(format!("{}.lock", sanitize_serial(serial))))
    }

    fn write_guard(&self) -> Result<Option<LockFile>, LedgerError> {
        let Some(path) = self.locks_dir().map(|d| d.join(WRITE_GUARD)) else {
            return Ok(None);
        };
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(20))
            .with_max_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(Duration::from_millis(defaults::WRITE_GUARD_WAIT_MS)))
            .build();

        let owner = lock_owner();
        backoff::retry(policy, || {
            LockFile::acquire(&path, &owner).map_err(|e| match e {
                FilesystemError::LockHeld { .. } => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .map(Some)
        .map_err(|e| match e {
            backoff::Error::Permanent(FilesystemError::LockHeld { path })
            | backoff::Error::Transient {
                err: FilesystemError::LockHeld { path },
                ..
            } => LedgerError::WriteGuardBusy { path },
            backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => {
                LedgerError::Storage(err)
            }
        })
    }
}

/// Reject serials that cannot be stored or locked safely
pub fn validate_serial(serial: &str) -> Result<(), LedgerError> {
    let valid = !serial.is_empty()
        && serial.len() <= 64
        && serial
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '/' && c != '\\');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidSerial {
            serial: serial.to_string(),
        })
    }
}

/// File-system safe form of a serial number
///
/// `[A-Za-z0-9-]` is kept; every other byte, `_` included, becomes `_XX`
/// (upper-case hex), so distinct serials never share a lock file or an
/// artifact directory.
pub fn sanitize_serial(serial: &str) -> String {
    let mut safe = String::with_capacity(serial.len());
    for byte in serial.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            safe.push(char::from(byte));
        } else {
            safe.push('_');
            safe.push_str(&hex::encode_upper([byte]));
        }
    }
    safe
}

fn lock_owner() -> String {
    format!("pid {} at {}", std::process::id(), Utc::now().to_rfc3339())
}

fn load_document(path: &Path) -> Result<LedgerDocument, LedgerError> {
    if !path.exists() {
        return Err(LedgerError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = filesystem::read_file(path)?;
    toml::from_str(&content).map_err(|e| LedgerError::Parse {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

fn persist(path: &Path, doc: &LedgerDocument) -> Result<(), LedgerError> {
    let content =
        toml::to_string_pretty(doc).map_err(|e| LedgerError::Serialize(e.to_string()))?;
    filesystem::write_atomic(path, &content)?;
    Ok(())
}

/// Roster columns read when the file has no header line
const POSITIONAL_COLUMNS: [&str; 5] = [
    "serial_number",
    "hardware_version",
    "region_code",
    "batch_id",
    "notes",
];

/// Formats accepted for a legacy `date_programmed` column
const LEGACY_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// One roster row, columns matched by header name
#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(default)]
    serial_number: Option<String>,
    #[serde(default)]
    date_programmed: Option<String>,
    #[serde(default)]
    firmware_version: Option<String>,
    #[serde(default)]
    hardware_version: Option<String>,
    #[serde(default)]
    region_code: Option<String>,
    #[serde(default)]
    batch_id: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

/// Parse a serial roster
///
/// CSV with a `serial_number,...` header is matched by column name, so a
/// legacy ledger export (`serial_number,date_programmed,firmware_version,
/// hardware_version,region_code,batch_id,notes` plus any extra columns)
/// imports as-is and units it records as programmed stay programmed.
/// Without a header the columns are `serial[,hardware_version[,region_code
/// [,batch_id[,notes]]]]`. Blank lines and `#` comments are skipped.
pub fn parse_roster(content: &str) -> Result<Vec<DeviceRecord>, LedgerError> {
    let has_header = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .is_some_and(|l| l.starts_with("serial_number"));

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(content.as_bytes());

    let headers = if has_header {
        reader.headers().map_err(roster_error)?.clone()
    } else {
        csv::StringRecord::from(POSITIONAL_COLUMNS.to_vec())
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(roster_error)?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let line = row.position().map_or(0, csv::Position::line);
        let parsed: RosterRow = row.deserialize(Some(&headers)).map_err(roster_error)?;

        let serial = parsed.serial_number.unwrap_or_default();
        validate_serial(&serial)?;
        let mut record = DeviceRecord::new(&serial);
        record.firmware_version = parsed.firmware_version;
        record.hardware_version = parsed.hardware_version;
        record.region_code = parsed.region_code;
        record.batch_id = parsed.batch_id;
        record.notes = parsed.notes;
        if let Some(date) = parsed.date_programmed.as_deref() {
            let programmed = parse_legacy_date(date).ok_or_else(|| LedgerError::Roster {
                line,
                message: format!("unrecognised date_programmed '{date}'"),
            })?;
            record.date_programmed = Some(programmed);
        }
        records.push(record);
    }
    Ok(records)
}

fn roster_error(e: csv::Error) -> LedgerError {
    LedgerError::Roster {
        line: e.position().map_or(0, csv::Position::line),
        message: e.to_string(),
    }
}

/// Legacy programming dates are station-local wall clock; they are taken as UTC
fn parse_legacy_date(date: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(date) {
        return Some(parsed.with_timezone(&Utc));
    }
    LEGACY_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}
