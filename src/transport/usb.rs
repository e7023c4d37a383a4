// USB driver for the synthesiser's Cypress-style bulk interface.
//
// The device exposes a bulk control pair (0x01 out / 0x81 in), a bulk data
// pair (0x02 out / 0x82 in) for image DMA and, on newer firmware, an
// interrupt-in pipe at 0x83.

use super::Driver;
use crate::config::{ChunkPolicy, Timeouts};
use crate::{Error, Result};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::RwLock;
use std::time::Duration;

const VENDOR_ID: u16 = 0x04B4;
const PRODUCT_ID: u16 = 0x00F1;

const EP_CTRL_OUT: u8 = 0x01;
const EP_CTRL_IN: u8 = 0x81;
const EP_BULK_OUT: u8 = 0x02;
const EP_BULK_IN: u8 = 0x82;
const EP_INT_IN: u8 = 0x83;

const CTRL_SLICE: Duration = Duration::from_millis(100);
const BULK_TIMEOUT: Duration = Duration::from_millis(1000);

struct OpenDevice {
    handle: DeviceHandle<Context>,
    has_interrupt: bool,
}

/// USB bulk transport.
pub struct UsbDriver {
    device: RwLock<Option<OpenDevice>>,
}

#[derive(Debug, Default)]
struct EndpointSet {
    ctrl_in: bool,
    ctrl_out: bool,
    bulk_in: bool,
    bulk_out: bool,
    int_in: bool,
}

fn probe_endpoints<T: UsbContext>(device: &Device<T>) -> EndpointSet {
    let mut found = EndpointSet::default();
    let Ok(config) = device.config_descriptor(0) else {
        return found;
    };
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            for ep in desc.endpoint_descriptors() {
                match (ep.transfer_type(), ep.direction(), ep.address()) {
                    (TransferType::Bulk, Direction::In, EP_CTRL_IN) => found.ctrl_in = true,
                    (TransferType::Bulk, Direction::Out, EP_CTRL_OUT) => found.ctrl_out = true,
                    (TransferType::Bulk, Direction::In, EP_BULK_IN) => found.bulk_in = true,
                    (TransferType::Bulk, Direction::Out, EP_BULK_OUT) => found.bulk_out = true,
                    (TransferType::Interrupt, Direction::In, EP_INT_IN) => found.int_in = true,
                    _ => {}
                }
            }
        }
    }
    found
}

fn identifier_of<T: UsbContext>(device: &Device<T>) -> String {
    format!("usb:{:03}:{:03}", device.bus_number(), device.address())
}

impl UsbDriver {
    pub fn new() -> Self {
        Self {
            device: RwLock::new(None),
        }
    }

    fn with_handle<R>(&self, f: impl FnOnce(&OpenDevice) -> Result<R>) -> Result<R> {
        let guard = self.device.read().unwrap();
        match guard.as_ref() {
            Some(dev) => f(dev),
            None => Err(Error::NotConnected),
        }
    }
}

impl Default for UsbDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for UsbDriver {
    fn ident(&self) -> &'static str {
        "CM_USBSS"
    }

    fn open(&self, identifier: &str) -> Result<()> {
        let context = Context::new()?;
        for device in context.devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            if identifier_of(&device) != identifier {
                continue;
            }
            let eps = probe_endpoints(&device);
            if !(eps.ctrl_in && eps.ctrl_out && eps.bulk_in && eps.bulk_out) {
                return Err(Error::Transport(format!(
                    "device {} lacks the expected endpoint set",
                    identifier
                )));
            }
            let mut handle = device.open()?;
            handle.claim_interface(0)?;
            *self.device.write().unwrap() = Some(OpenDevice {
                handle,
                has_interrupt: eps.int_in,
            });
            return Ok(());
        }
        Err(Error::DeviceNotFound)
    }

    fn close(&self) {
        *self.device.write().unwrap() = None;
    }

    fn is_open(&self) -> bool {
        self.device.read().unwrap().is_some()
    }

    fn write_control(&self, bytes: &[u8]) -> Result<usize> {
        self.with_handle(|dev| match dev.handle.write_bulk(EP_CTRL_OUT, bytes, CTRL_SLICE) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(Error::Usb(e)),
        })
    }

    fn read_control(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_handle(|dev| match dev.handle.read_bulk(EP_CTRL_IN, buf, CTRL_SLICE) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(Error::Usb(e)),
        })
    }

    fn candidates(&self, _port_mask: &[String]) -> Result<Vec<String>> {
        let context = Context::new()?;
        let mut found = Vec::new();
        for device in context.devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            let eps = probe_endpoints(&device);
            if eps.ctrl_in && eps.ctrl_out && eps.bulk_in && eps.bulk_out {
                found.push(identifier_of(&device));
            }
        }
        Ok(found)
    }

    fn default_timeouts(&self) -> Timeouts {
        Timeouts::usb()
    }

    fn chunk_policy(&self) -> Option<ChunkPolicy> {
        // One DMA prime covers a 64 KiB region which is then moved through
        // the bulk pipe in 1 KiB buffers.
        Some(ChunkPolicy {
            transfer_unit: 65_536,
            dl_chunk: 1024,
            ul_chunk: 1024,
            dma_max_bytes: 65_536,
        })
    }

    fn pad_to_word(&self) -> bool {
        true
    }

    fn delivers_frames(&self) -> bool {
        true
    }

    fn has_bulk(&self) -> bool {
        true
    }

    fn write_bulk(&self, bytes: &[u8]) -> Result<usize> {
        self.with_handle(|dev| Ok(dev.handle.write_bulk(EP_BULK_OUT, bytes, BULK_TIMEOUT)?))
    }

    fn read_bulk(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_handle(|dev| Ok(dev.handle.read_bulk(EP_BULK_IN, buf, BULK_TIMEOUT)?))
    }

    fn has_interrupt(&self) -> bool {
        self.device
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|d| d.has_interrupt)
    }

    fn read_interrupt(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.with_handle(|dev| match dev.handle.read_interrupt(EP_INT_IN, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(Error::Usb(e)),
        })
    }
}
