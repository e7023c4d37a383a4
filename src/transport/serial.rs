// RS-422 driver over a local serial port.

use super::Driver;
use crate::config::{BAUD_BOUNDS, ChunkPolicy, DEFAULT_BAUD, Timeouts};
use crate::{Error, Result};
use serial2::SerialPort;
use std::io::ErrorKind;
use std::sync::RwLock;
use std::time::Duration;

const READ_SLICE: Duration = Duration::from_millis(50);
const WRITE_SLICE: Duration = Duration::from_millis(100);

/// Serial (RS-422) transport. The port handle is full duplex, so the sender
/// and receiver threads operate on it concurrently through the shared lock.
#[derive(Debug)]
pub struct SerialDriver {
    port: RwLock<Option<SerialPort>>,
    baud: u32,
}

impl SerialDriver {
    pub fn new() -> Self {
        Self {
            port: RwLock::new(None),
            baud: DEFAULT_BAUD,
        }
    }

    pub fn with_baud(baud: u32) -> Self {
        Self {
            port: RwLock::new(None),
            baud,
        }
    }
}

impl Default for SerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SerialDriver {
    fn ident(&self) -> &'static str {
        "CM_SERIAL"
    }

    fn open(&self, identifier: &str) -> Result<()> {
        if !BAUD_BOUNDS.contains(&self.baud) {
            return Err(Error::InvalidParams(format!(
                "Baud rate out of range, got {}",
                self.baud
            )));
        }
        let mut port = SerialPort::open(identifier, self.baud)?;
        port.set_read_timeout(READ_SLICE)?;
        port.set_write_timeout(WRITE_SLICE)?;
        port.discard_buffers()?;
        *self.port.write().unwrap() = Some(port);
        Ok(())
    }

    fn close(&self) {
        *self.port.write().unwrap() = None;
    }

    fn is_open(&self) -> bool {
        self.port.read().unwrap().is_some()
    }

    fn write_control(&self, bytes: &[u8]) -> Result<usize> {
        let guard = self.port.read().unwrap();
        let port = guard.as_ref().ok_or(Error::NotConnected)?;
        match port.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_control(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.port.read().unwrap();
        let port = guard.as_ref().ok_or(Error::NotConnected)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            // The port signals an empty slice either way depending on the
            // platform.
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn candidates(&self, port_mask: &[String]) -> Result<Vec<String>> {
        let ports = SerialPort::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|name| port_mask.is_empty() || port_mask.iter().any(|m| m == name))
            .collect())
    }

    fn default_timeouts(&self) -> Timeouts {
        Timeouts::serial()
    }

    fn chunk_policy(&self) -> Option<ChunkPolicy> {
        Some(ChunkPolicy::default())
    }
}
