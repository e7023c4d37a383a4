/* Abstraction for the byte transports the connection core drives */

use crate::config::{ChunkPolicy, Timeouts};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

pub mod loopback;
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

/// One device found by [`discover`].
///
/// [`discover`]: crate::Connection::discover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Opaque identifier accepted by [`connect`].
    ///
    /// [`connect`]: crate::Connection::connect
    pub identifier: String,
    /// Printable identity returned by the probe, typically the first bytes
    /// of the controller settings block.
    pub identity: String,
}

/// A byte channel to the device.
///
/// All operations are blocking but bounded: `read_control` must return
/// within a short slice (100 ms or less) so the receiver thread can poll
/// the shutdown flag. Implementations are shared between the sender and
/// receiver threads and must synchronise internally; every method takes
/// `&self`.
pub trait Driver: Send + Sync {
    /// A human readable name for the connection type.
    fn ident(&self) -> &'static str;

    /// Opens the channel to the device named by `identifier`.
    fn open(&self, identifier: &str) -> Result<()>;

    fn close(&self);

    fn is_open(&self) -> bool;

    /// Writes some of `bytes` to the control channel, returning how many
    /// were accepted. May accept fewer than offered, or none within its
    /// internal slice; the sender loops against its own send timeout.
    fn write_control(&self, bytes: &[u8]) -> Result<usize>;

    /// Reads whatever control-channel bytes are available into `buf`.
    /// Returns 0 on idle rather than blocking indefinitely.
    fn read_control(&self, buf: &mut [u8]) -> Result<usize>;

    /// Identifiers worth probing during discovery. `port_mask`, when not
    /// empty, restricts the result to the named ports.
    fn candidates(&self, port_mask: &[String]) -> Result<Vec<String>>;

    /// Timeout defaults appropriate for this transport.
    fn default_timeouts(&self) -> Timeouts;

    /// Chunking policy for block-memory transfers, or `None` when this
    /// transport has no memory path at all.
    fn chunk_policy(&self) -> Option<ChunkPolicy>;

    /// True when outgoing frames must be zero-padded to 32-bit words.
    fn pad_to_word(&self) -> bool {
        false
    }

    /// True when the transport returns one response buffer per request, so
    /// received bytes can be committed to a specific message instead of the
    /// shared stream.
    fn delivers_frames(&self) -> bool {
        false
    }

    /// True when a dedicated high-throughput bulk pipe exists. The transfer
    /// planner then bypasses the control path for payload bytes.
    fn has_bulk(&self) -> bool {
        false
    }

    fn write_bulk(&self, _bytes: &[u8]) -> Result<usize> {
        Err(Error::Unsupported("bulk write"))
    }

    fn read_bulk(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("bulk read"))
    }

    /// True when the device can push asynchronous interrupt packets.
    fn has_interrupt(&self) -> bool {
        false
    }

    /// Reads one interrupt packet, returning 0 when none arrived within
    /// `timeout`.
    fn read_interrupt(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        Err(Error::Unsupported("interrupt pipe"))
    }
}

// Shared drivers delegate, which lets a caller keep a handle to the driver
// (e.g. the loopback's fault hooks) after handing it to a connection.
impl<D: Driver + ?Sized> Driver for Arc<D> {
    fn ident(&self) -> &'static str {
        (**self).ident()
    }
    fn open(&self, identifier: &str) -> Result<()> {
        (**self).open(identifier)
    }
    fn close(&self) {
        (**self).close()
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn write_control(&self, bytes: &[u8]) -> Result<usize> {
        (**self).write_control(bytes)
    }
    fn read_control(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_control(buf)
    }
    fn candidates(&self, port_mask: &[String]) -> Result<Vec<String>> {
        (**self).candidates(port_mask)
    }
    fn default_timeouts(&self) -> Timeouts {
        (**self).default_timeouts()
    }
    fn chunk_policy(&self) -> Option<ChunkPolicy> {
        (**self).chunk_policy()
    }
    fn pad_to_word(&self) -> bool {
        (**self).pad_to_word()
    }
    fn delivers_frames(&self) -> bool {
        (**self).delivers_frames()
    }
    fn has_bulk(&self) -> bool {
        (**self).has_bulk()
    }
    fn write_bulk(&self, bytes: &[u8]) -> Result<usize> {
        (**self).write_bulk(bytes)
    }
    fn read_bulk(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_bulk(buf)
    }
    fn has_interrupt(&self) -> bool {
        (**self).has_interrupt()
    }
    fn read_interrupt(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_interrupt(buf, timeout)
    }
}
