//! Serial reconnection after device resets
//!
//! After an upload or a reboot the device re-enumerates, sometimes more than
//! once. The reconnector follows the monitor's port events, keeps the newest
//! candidate that is still present, and binds it once it has been stable for
//! the settle window. The whole wait is bounded by a single timeout.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::monitor::{DeviceEvent, PortRef};

/// Reconnection windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total wait for a port
    pub timeout: Duration,
    /// Quiet period before a candidate is bound
    pub settle: Duration,
}

/// Port bound to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPort {
    /// The port
    pub port: PortRef,
    /// Time from start of the wait to binding
    pub waited: Duration,
    /// Candidates replaced or dropped before binding
    pub churn: u32,
}

/// Why no port was bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectFailure {
    /// No candidate within the timeout
    TimedOut(Duration),
    /// Session cancelled
    Cancelled,
}

/// Waits for a port to (re)appear
#[derive(Debug, Clone)]
pub struct SerialReconnector {
    policy: ReconnectPolicy,
}

impl SerialReconnector {
    /// Reconnector with the given windows
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use
    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Wait for a port to appear and settle
    ///
    /// `events` must have been subscribed before the reset was triggered so
    /// that no appearance is missed.
    pub async fn wait_for_port(
        &self,
        events: &mut broadcast::Receiver<DeviceEvent>,
        cancel: &CancellationToken,
    ) -> Result<BoundPort, ReconnectFailure> {
        let start = Instant::now();
        let deadline = start + self.policy.timeout;
        let mut candidate: Option<(PortRef, Instant)> = None;
        let mut churn = 0u32;
        let mut closed = false;

        loop {
            let wake = match &candidate {
                Some((_, seen)) => (*seen + self.policy.settle).min(deadline),
                None => deadline,
            };
            if Instant::now() >= wake {
                return match candidate {
                    Some((port, _)) => {
                        let waited = start.elapsed();
                        tracing::info!(
                            "Bound port {} after {} ms ({} candidate change(s))",
                            port.name,
                            waited.as_millis(),
                            churn
                        );
                        Ok(BoundPort {
                            port,
                            waited,
                            churn,
                        })
                    }
                    None => Err(ReconnectFailure::TimedOut(self.policy.timeout)),
                };
            }

            if closed {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(ReconnectFailure::Cancelled),
                    () = tokio::time::sleep_until(wake) => continue,
                }
            }

            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ReconnectFailure::Cancelled),
                received = tokio::time::timeout_at(wake, events.recv()) => received,
            };

            match received {
                Err(_) => {}
                Ok(Ok(DeviceEvent::PortAppeared(port))) => {
                    tracing::debug!("Port candidate {}", port.name);
                    if candidate.is_some() {
                        churn += 1;
                    }
                    candidate = Some((port, Instant::now()));
                }
                Ok(Ok(DeviceEvent::PortVanished(port))) => {
                    if candidate.as_ref().is_some_and(|(c, _)| *c == port) {
                        tracing::debug!("Port candidate {} vanished", port.name);
                        candidate = None;
                        churn += 1;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!("Reconnector missed {} device event(s)", skipped);
                }
                Ok(Err(RecvError::Closed)) => {
                    tracing::warn!("Device event channel closed while waiting for port");
                    closed = true;
                }
            }
        }
    }
}
