//! Host-side control of a modular RF synthesiser over USB bulk or RS-422
//! serial transports.
//!
//! The `rfsynth` crate implements the framed request/response protocol the
//! synthesiser controller speaks on its control channel, together with the
//! pipelined block-memory ("image DMA") transfer engine used to move image
//! data in and out of controller memory while the control channel stays
//! usable.
//!
//! The central type is [`Connection`]: it owns the transport driver and five
//! worker threads (sender, receiver, parser/supervisor, memory transfer and,
//! where the transport provides an interrupt pipe, an interrupt listener).
//! Requests are posted as [`HostReport`]s and tracked as [`Message`]s,
//! identified by an integer [`MessageHandle`] until they reach a terminal
//! status and age out of the registry.
//!
//! # Example
//! Open the first discovered device over RS-422 and read the controller
//! settings block.
//!
//! ```no_run
//! # fn example() -> rfsynth::Result<()> {
//! use rfsynth::{ConnectionBuilder, HostReport, Action, Direction};
//!
//! let conn = ConnectionBuilder::new().with_serial().build();
//! let found = conn.discover(&[])?;
//! conn.connect(&found[0].identifier)?;
//!
//! let rpt = HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16);
//! let resp = conn.send_msg_blocking(&rpt);
//! assert!(resp.done());
//! conn.disconnect();
//! # Ok(())
//! # }
//! ```
//!
//! # Example
//! Download an image block into controller memory and watch for completion
//! through the event bus.
//!
//! ```no_run
//! # fn example(conn: &rfsynth::Connection) {
//! use std::sync::{Arc, Mutex};
//! use rfsynth::MessageEvent;
//!
//! conn.event_subscribe(MessageEvent::MemoryTransferComplete, |args| {
//!     println!("transferred {} bytes", args.param);
//! });
//! let buf = Arc::new(Mutex::new(vec![0u8; 8192]));
//! conn.memory_download(buf, 0x1000, 0, uuid::Uuid::nil());
//! # }
//! ```

use thiserror::Error;

pub mod config;
pub mod connection;
pub mod events;
pub mod message;
pub mod registry;
pub mod report;
pub mod transport;

pub use config::{ChunkPolicy, Timeouts};
pub use connection::{Connection, ConnectionBuilder, TransferBuffer};
pub use events::{EventArgs, EventAux, EventToken, MessageEvent};
pub use message::{Message, MessageHandle, NULL_MESSAGE, Status};
pub use report::{Action, DeviceReport, Direction, HostReport};
pub use transport::DiscoveredDevice;

/// Errors surfaced by connection management and the transport drivers.
///
/// Per-message failures never appear here; they terminate the owning
/// [`Message`] and fire a [`MessageEvent`] instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Device not found.")]
    DeviceNotFound,
    #[error("Not connected to a device.")]
    NotConnected,
    #[error("{0}")]
    InvalidParams(String),
    #[error("Transport has no {0} capability.")]
    Unsupported(&'static str),
    #[error("{0}")]
    Transport(String),
    #[cfg(feature = "usb")]
    #[error(transparent)]
    Usb(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
