//! Host device monitoring
//!
//! Polls the host for upload-mode volumes and communication ports and
//! broadcasts the differences between consecutive polls. The monitor never
//! opens a device and never waits on a session; slow subscribers just lag.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::error::EnumerationError;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// Upload-mode mass-storage device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceRef {
    /// Mount point
    pub path: PathBuf,
    /// Volume label, if known
    pub label: Option<String>,
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Communication port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortRef {
    /// Port name (e.g. `/dev/ttyACM0`)
    pub name: String,
    /// USB vendor id
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB serial number string
    pub serial_number: Option<String>,
}

impl PortRef {
    /// Port known only by name
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vid: None,
            pid: None,
            serial_number: None,
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => write!(f, "{} ({vid:04x}:{pid:04x})", self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// Device lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Upload-mode volume appeared
    Attached(DeviceRef),
    /// Upload-mode volume went away
    Detached(DeviceRef),
    /// Port appeared
    PortAppeared(PortRef),
    /// Port went away
    PortVanished(PortRef),
}

/// What the host showed at the last poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSnapshot {
    /// Upload-mode volumes
    pub devices: BTreeSet<DeviceRef>,
    /// Matching ports
    pub ports: BTreeSet<PortRef>,
}

/// Source of host device lists
pub trait DeviceEnumerator: Send + Sync {
    /// Mounted upload-mode volumes
    fn upload_devices(&self) -> Result<Vec<DeviceRef>, EnumerationError>;

    /// Communication ports of interest
    fn ports(&self) -> Result<Vec<PortRef>, EnumerationError>;
}

/// Enumerates the real host with `serialport`, `sysinfo` and `walkdir`
#[derive(Debug, Clone)]
pub struct HostEnumerator {
    vendor_id: Option<u16>,
    volume_label: String,
    mount_roots: Vec<PathBuf>,
}

impl HostEnumerator {
    /// Enumerator filtering ports by vendor id and volumes by label
    pub fn new(vendor_id: Option<u16>, volume_label: &str) -> Self {
        Self {
            vendor_id,
            volume_label: volume_label.to_string(),
            mount_roots: defaults::MOUNT_ROOTS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Whether a mount point looks like an upload-mode volume
    fn is_upload_volume(&self, mount: &Path) -> bool {
        let label = self.volume_label.to_uppercase();
        let name_matches = mount
            .file_name()
            .is_some_and(|n| n.to_string_lossy().to_uppercase().contains(&label));
        if name_matches {
            return true;
        }
        std::fs::read_to_string(mount.join(defaults::VOLUME_INFO_FILE))
            .map(|info| {
                let info = info.to_uppercase();
                info.contains(&label) || info.contains("RP2040") || info.contains("RP2350")
            })
            .unwrap_or(false)
    }
}

impl DeviceEnumerator for HostEnumerator {
    fn upload_devices(&self) -> Result<Vec<DeviceRef>, EnumerationError> {
        let mut found = BTreeSet::new();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        for disk in disks.list() {
            let mount = disk.mount_point();
            if self.is_upload_volume(mount) {
                found.insert(mount.to_path_buf());
            }
        }

        // Automounters do not always register with the disk list
        for root in self.mount_roots.iter().filter(|r| r.is_dir()) {
            let candidates = walkdir::WalkDir::new(root)
                .min_depth(1)
                .max_depth(3)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_dir());
            for entry in candidates {
                if self.is_upload_volume(entry.path()) {
                    found.insert(entry.into_path());
                }
            }
        }

        Ok(found
            .into_iter()
            .map(|path| DeviceRef {
                label: Some(self.volume_label.clone()),
                path,
            })
            .collect())
    }

    fn ports(&self) -> Result<Vec<PortRef>, EnumerationError> {
        let ports = serialport::available_ports()
            .map_err(|e| EnumerationError::Ports(e.to_string()))?;
        Ok(ports
            .into_iter()
            .filter_map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    if self.vendor_id.is_some_and(|vid| vid != info.vid) {
                        return None;
                    }
                    Some(PortRef {
                        name: p.port_name,
                        vid: Some(info.vid),
                        pid: Some(info.pid),
                        serial_number: info.serial_number,
                    })
                }
                _ if self.vendor_id.is_none() => Some(PortRef::named(&p.port_name)),
                _ => None,
            })
            .collect())
    }
}

/// Polls an enumerator and broadcasts lifecycle events
pub struct DeviceMonitor {
    enumerator: Arc<dyn DeviceEnumerator>,
    interval: Duration,
    events: broadcast::Sender<DeviceEvent>,
    snapshot: Mutex<Option<HostSnapshot>>,
    // Serialises pollers so each diff starts from the previous poll
    polling: Mutex<()>,
}

impl DeviceMonitor {
    /// Monitor polling `enumerator` every `interval`
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            enumerator,
            interval,
            events,
            snapshot: Mutex::new(None),
            polling: Mutex::new(()),
        }
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, Option<HostSnapshot>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last observed host state; empty before the first poll
    pub fn snapshot(&self) -> HostSnapshot {
        self.state().clone().unwrap_or_default()
    }

    /// Poll once and broadcast the differences
    ///
    /// The first poll only records the baseline. A failed enumeration keeps
    /// the previous set for that half, so nothing is reported as detached.
    /// Enumeration runs without holding the snapshot, so
    /// [`snapshot`](Self::snapshot) never waits on a slow scan.
    pub fn poll_once(&self) -> Vec<DeviceEvent> {
        let _polling = self.polling.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.state().clone();
        let base = previous.clone().unwrap_or_default();

        let devices = match self.enumerator.upload_devices() {
            Ok(list) => list.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Device enumeration failed: {}", e);
                base.devices.clone()
            }
        };
        let ports = match self.enumerator.ports() {
            Ok(list) => list.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Port enumeration failed: {}", e);
                base.ports.clone()
            }
        };
        let current = HostSnapshot { devices, ports };
        *self.state() = Some(current.clone());

        let Some(previous) = previous else {
            tracing::debug!(
                "Monitor baseline: {} device(s), {} port(s)",
                current.devices.len(),
                current.ports.len()
            );
            return Vec::new();
        };

        let events = diff(&previous, &current);
        for event in &events {
            tracing::debug!("Device event: {:?}", event);
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }
        events
    }

    /// Poll in the background until cancelled
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let monitor = Arc::clone(&self);
                        if let Err(e) = tokio::task::spawn_blocking(move || monitor.poll_once()).await {
                            tracing::warn!("Device poll task failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Device monitor stopped");
        })
    }
}

/// Events turning `previous` into `current`
fn diff(previous: &HostSnapshot, current: &HostSnapshot) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    events.extend(
        previous
            .devices
            .difference(&current.devices)
            .cloned()
            .map(DeviceEvent::Detached),
    );
    events.extend(
        current
            .devices
            .difference(&previous.devices)
            .cloned()
            .map(DeviceEvent::Attached),
    );
    events.extend(
        previous
            .ports
            .difference(&current.ports)
            .cloned()
            .map(DeviceEvent::PortVanished),
    );
    events.extend(
        current
            .ports
            .difference(&previous.ports)
            .cloned()
            .map(DeviceEvent::PortAppeared),
    );
    events
}
