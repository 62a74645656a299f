//! Byte-level serial port access (§4.1 `SerialLink`).
//!
//! Owns the serial file descriptor. No framing, resync, or checksum logic
//! lives here — that belongs to `robot::RobotDriver`, which parses the
//! bytes this crate hands back.

use std::io::{Read, Write};
use std::time::Duration;

use thiserror::Error;
use tokio_serial::SerialPort;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("serial link is closed")]
    Closed,
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A serial port opened for byte-level read/write.
///
/// `read_available` and `write` never block longer than the port's
/// configured timeout; `close` is idempotent and safe to call repeatedly
/// (e.g. once from a shutdown path and once from `Drop`).
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    path: String,
    baud_rate: u32,
}

impl SerialLink {
    /// Open the port at `path`/`baud_rate`. `read_timeout` bounds how long
    /// a single `read_available` call may block waiting for the first byte.
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, LinkError> {
        let port = tokio_serial::new(path, baud_rate)
            .timeout(read_timeout)
            .open_native()?;
        debug!(path, baud_rate, "serial link opened");
        Ok(Self {
            port: Some(Box::new(port)),
            path: path.to_string(),
            baud_rate,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// A link that never successfully opened a port: every operation
    /// returns `LinkClosed`, never panics. Used by downstream crates'
    /// tests that exercise command-path behavior without a real serial
    /// device.
    pub fn closed_for_test() -> Self {
        Self {
            port: None,
            path: "/dev/null".to_string(),
            baud_rate: 115200,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    /// Write `bytes` atomically: the whole buffer or an error, flushed
    /// before returning.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    /// Return bytes already buffered by the OS, plus at least one byte if
    /// one arrives within `max_wait`; empty if nothing arrives in time.
    pub fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;
        port.set_timeout(max_wait)?;
        let mut buf = [0u8; 4096];
        match port.read(&mut buf) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    /// Close the underlying port. Safe to call more than once.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial link closed");
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.port.is_some() {
            warn!(path = %self.path, "serial link dropped without explicit close");
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_nonexistent_port_fails() {
        let result = SerialLink::open("/dev/does-not-exist-xyz", 115200, Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn closed_link_rejects_write_and_read() {
        // A link that never successfully opened behaves the same as one
        // explicitly closed: operations return `Closed`, never panic.
        let mut link = SerialLink {
            port: None,
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        };
        assert!(!link.is_connected());
        assert!(matches!(link.write(&[1, 2, 3]), Err(LinkError::Closed)));
        assert!(matches!(
            link.read_available(Duration::from_millis(10)),
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut link = SerialLink {
            port: None,
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        };
        link.close();
        link.close();
        assert!(!link.is_connected());
    }
}
