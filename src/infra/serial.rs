//! Line-oriented serial transport
//!
//! The engines talk to devices through [`SerialLink`], a blocking transport
//! whose reads are always bounded by a timeout. The host implementation wraps
//! `serialport`; tests substitute scripted links.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::monitor::PortRef;
use crate::error::LinkError;

/// Longest single blocking read on the host port
const READ_SLICE: Duration = Duration::from_millis(50);

/// Blocking, line-oriented serial link
pub trait SerialLink: Send {
    /// Name of the underlying port
    fn port_name(&self) -> &str;

    /// Send one line; the line ending is appended
    fn send_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Next non-empty line, or `None` if nothing arrived within `timeout`
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError>;
}

/// Opens links for bound ports
pub trait PortOpener: Send + Sync {
    /// Open the port
    fn open(&self, port: &PortRef) -> Result<Box<dyn SerialLink>, LinkError>;
}

/// Read a multi-line response
///
/// Waits up to `timeout` for the first line, then keeps reading until no
/// line arrives for `idle_gap` or the overall timeout expires.
pub fn read_response(
    link: &mut dyn SerialLink,
    timeout: Duration,
    idle_gap: Duration,
) -> Result<Vec<String>, LinkError> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = if lines.is_empty() {
            remaining
        } else {
            remaining.min(idle_gap)
        };
        match link.read_line(wait)? {
            Some(line) => lines.push(line),
            None => break,
        }
    }
    Ok(lines)
}

/// Opens host serial ports with `serialport`
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    baud_rate: u32,
    line_ending: String,
}

impl SerialPortOpener {
    /// Opener with the given baud rate and line ending
    pub fn new(baud_rate: u32, line_ending: impl Into<String>) -> Self {
        Self {
            baud_rate,
            line_ending: line_ending.into(),
        }
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &PortRef) -> Result<Box<dyn SerialLink>, LinkError> {
        let handle = serialport::new(&port.name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| LinkError::Open {
                port: port.name.clone(),
                error: e.to_string(),
            })?;

        tracing::info!("Opened serial port {} at {} baud", port.name, self.baud_rate);

        Ok(Box::new(SerialPortLink {
            name: port.name.clone(),
            port: handle,
            line_ending: self.line_ending.clone(),
            pending: Vec::new(),
        }))
    }
}

/// Host serial port link
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
    line_ending: String,
    pending: Vec<u8>,
}

impl SerialPortLink {
    fn io_error(&self, e: &std::io::Error) -> LinkError {
        LinkError::Io {
            port: self.name.clone(),
            error: e.to_string(),
        }
    }
}

impl SerialLink for SerialPortLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        tracing::debug!(target: "serial", "{} >> {}", self.name, line);
        let framed = format!("{line}{}", self.line_ending);
        let written = self.port.write_all(framed.as_bytes());
        written
            .and_then(|()| self.port.flush())
            .map_err(|e| self.io_error(&e))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = take_line(&mut self.pending) {
                tracing::debug!(target: "serial", "{} << {}", self.name, line);
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.port
                .set_timeout(remaining.min(READ_SLICE))
                .map_err(|e| LinkError::Io {
                    port: self.name.clone(),
                    error: e.to_string(),
                })?;
            match self.port.read(&mut buf) {
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(self.io_error(&e)),
            }
        }
    }
}

/// Split the first complete non-empty line off the buffer
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    while let Some(end) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
        let raw: Vec<u8> = pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw[..end]).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::ScriptedDevice;

    #[test]
    fn test_take_line_handles_crlf() {
        let mut pending = b"OK\r\nSerial: SN-1\r\npart".to_vec();
        assert_eq!(take_line(&mut pending).as_deref(), Some("OK"));
        assert_eq!(take_line(&mut pending).as_deref(), Some("Serial: SN-1"));
        assert_eq!(take_line(&mut pending), None);
        assert_eq!(pending, b"part");
    }

    #[test]
    fn test_take_line_skips_blank_lines() {
        let mut pending = b"\r\n\r\n  \nREADY\n".to_vec();
        assert_eq!(take_line(&mut pending).as_deref(), Some("READY"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_read_response_collects_all_lines() {
        let device = ScriptedDevice::new("/dev/ttyACM0")
            .respond("SYSINFO", &["Serial: SN-1", "Region: EU", "OK"]);
        let mut link = device.link();
        link.send_line("SYSINFO").unwrap();

        let lines = read_response(
            link.as_mut(),
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .unwrap();
        assert_eq!(lines, vec!["Serial: SN-1", "Region: EU", "OK"]);
    }

    #[test]
    fn test_read_response_without_answer_is_empty() {
        let device = ScriptedDevice::new("/dev/ttyACM0");
        let mut link = device.link();
        link.send_line("NETINFO").unwrap();
        let lines = read_response(
            link.as_mut(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .unwrap();
        assert!(lines.is_empty());
    }
}
