// In-process transport that plays the device side of the protocol.
//
// Every control frame written to it is decoded and answered the way the
// controller firmware would: settings reads return the settings block,
// image chunks land in a byte-addressable memory model, and everything else
// echoes. Fault hooks let tests swallow requests, fail writes, corrupt CRCs
// or raise interrupts. No hardware is involved, which is what the
// integration suite runs against.

use super::Driver;
use crate::config::{ChunkPolicy, Timeouts};
use crate::report::{Action, DeviceReport, Direction, HostReport, StatusBits};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const READ_SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct BulkWindow {
    addr: usize,
    cursor: usize,
}

struct State {
    open: bool,
    rx: VecDeque<u8>,
    partial: Vec<u8>,
    interrupts: VecDeque<Vec<u8>>,
    memory: Vec<u8>,
    settings: Vec<u8>,
    swallow: usize,
    fail_write_call: Option<usize>,
    writes_seen: usize,
    next_status: StatusBits,
    corrupt_next_crc: bool,
    bulk: BulkWindow,
}

impl Default for State {
    fn default() -> Self {
        Self {
            open: false,
            rx: VecDeque::new(),
            partial: Vec::new(),
            interrupts: VecDeque::new(),
            memory: Vec::new(),
            settings: b"RFSYNTH-LOOPBACK".to_vec(),
            swallow: 0,
            fail_write_call: None,
            writes_seen: 0,
            next_status: StatusBits::default(),
            corrupt_next_crc: false,
            bulk: BulkWindow::default(),
        }
    }
}

/// Loopback transport used for testing without a device attached.
pub struct LoopbackDriver {
    state: Mutex<State>,
    rx_cond: Condvar,
    policy: ChunkPolicy,
    bulk_path: bool,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            rx_cond: Condvar::new(),
            policy: ChunkPolicy::default(),
            bulk_path: false,
        }
    }

    pub fn with_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Switches the driver to the legacy raw-bulk transfer path.
    pub fn with_bulk_path(mut self) -> Self {
        self.bulk_path = true;
        self
    }

    /// Drops the next `n` requests without answering them.
    pub fn swallow_next(&self, n: usize) {
        self.state.lock().unwrap().swallow = n;
    }

    /// Makes the `n`th `write_control` call (1-based, counted from now)
    /// fail with a transport error.
    pub fn fail_write_call(&self, n: usize) {
        let mut st = self.state.lock().unwrap();
        let at = st.writes_seen + n;
        st.fail_write_call = Some(at);
    }

    /// Pushes raw bytes into the host-bound stream, ahead of any queued
    /// responses.
    pub fn inject(&self, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.rx.extend(bytes);
        self.rx_cond.notify_all();
    }

    /// Decorates the next response with the given device status bits.
    pub fn set_next_status(&self, status: StatusBits) {
        self.state.lock().unwrap().next_status = status;
    }

    /// Corrupts the CRC trailer of the next response.
    pub fn corrupt_next_crc(&self) {
        self.state.lock().unwrap().corrupt_next_crc = true;
    }

    /// Queues an interrupt packet carrying `itype` in the address field and
    /// the given payload.
    pub fn raise_interrupt(&self, itype: u16, payload: &[u8]) {
        let frame = DeviceReport::frame(
            Action::AsyncControl,
            Direction::Read,
            itype,
            0,
            StatusBits::default(),
            payload,
        );
        self.state.lock().unwrap().interrupts.push_back(frame);
        self.rx_cond.notify_all();
    }

    pub fn set_settings(&self, settings: Vec<u8>) {
        self.state.lock().unwrap().settings = settings;
    }

    /// Preloads the device memory model, as if a previous download had
    /// stored the bytes.
    pub fn preload_memory(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().memory = bytes;
    }

    /// Snapshot of the device memory model.
    pub fn memory(&self) -> Vec<u8> {
        self.state.lock().unwrap().memory.clone()
    }

    fn respond(&self, st: &mut State, frame: Vec<u8>) {
        let mut frame = frame;
        if st.corrupt_next_crc {
            st.corrupt_next_crc = false;
            let last = frame.len() - 1;
            frame[last] ^= 0xA5;
        }
        st.rx.extend(frame);
        self.rx_cond.notify_all();
    }

    fn handle_request(&self, st: &mut State, rpt: HostReport) {
        if st.swallow > 0 {
            st.swallow -= 1;
            return;
        }
        let status = std::mem::take(&mut st.next_status);
        let unit = self.policy.transfer_unit;
        let frame = match (rpt.action, rpt.direction) {
            (Action::CtlrImage, Direction::Write) => {
                let idx = rpt.address as usize | (rpt.context as usize) << 16;
                let off = idx * unit;
                let end = off + rpt.payload.len();
                if st.memory.len() < end {
                    st.memory.resize(end, 0);
                }
                st.memory[off..end].copy_from_slice(&rpt.payload);
                DeviceReport::frame(rpt.action, rpt.direction, rpt.address, rpt.context, status, &[])
            }
            (Action::CtlrImage, Direction::Read) => {
                let idx = rpt.address as usize | (rpt.context as usize) << 16;
                let off = idx * unit;
                let mut payload = vec![0u8; rpt.length as usize];
                for (i, b) in payload.iter_mut().enumerate() {
                    *b = st.memory.get(off + i).copied().unwrap_or(0);
                }
                DeviceReport::frame(
                    rpt.action,
                    rpt.direction,
                    rpt.address,
                    rpt.context,
                    status,
                    &payload,
                )
            }
            (Action::CtlrSettings, Direction::Read) => {
                let mut payload = st.settings.clone();
                payload.resize(rpt.length as usize, 0);
                DeviceReport::frame(rpt.action, rpt.direction, rpt.address, 0, status, &payload)
            }
            (Action::CtlrImgIdx, Direction::Read) => {
                let payload = vec![0u8; rpt.length as usize];
                DeviceReport::frame(
                    rpt.action,
                    rpt.direction,
                    rpt.address,
                    rpt.context,
                    status,
                    &payload,
                )
            }
            (Action::CtlrImgDma, Direction::Write) => {
                // Prime: payload is [chunk length, start address] as LE u32.
                let addr = rpt
                    .payload
                    .get(4..8)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                st.bulk.addr = addr as usize;
                st.bulk.cursor = 0;
                DeviceReport::frame(rpt.action, rpt.direction, rpt.address, 0, status, &[])
            }
            (_, Direction::Write) => DeviceReport::frame(
                rpt.action,
                rpt.direction,
                rpt.address,
                rpt.context,
                status,
                &rpt.payload,
            ),
            (_, Direction::Read) => {
                let payload: Vec<u8> = (0..rpt.length as usize).map(|i| i as u8).collect();
                DeviceReport::frame(
                    rpt.action,
                    rpt.direction,
                    rpt.address,
                    rpt.context,
                    status,
                    &payload,
                )
            }
        };
        self.respond(st, frame);
    }

    // Pulls complete frames out of the accumulated write bytes.
    fn drain_frames(&self, st: &mut State) {
        loop {
            if st.partial.is_empty() {
                return;
            }
            if st.partial[0] != crate::report::START_BYTE {
                st.partial.remove(0);
                continue;
            }
            if st.partial.len() < 7 {
                return;
            }
            let has_context = st.partial[1] & 0x80 != 0;
            let length = u16::from_le_bytes([st.partial[5], st.partial[6]]) as usize;
            let total = 9 + usize::from(has_context) + length;
            if st.partial.len() < total {
                return;
            }
            let frame: Vec<u8> = st.partial.drain(..total).collect();
            if let Some(rpt) = HostReport::decode(&frame) {
                self.handle_request(st, rpt);
            }
        }
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for LoopbackDriver {
    fn ident(&self) -> &'static str {
        "CM_LOOPBACK"
    }

    fn open(&self, _identifier: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.open = true;
        st.rx.clear();
        st.partial.clear();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().open = false;
        self.rx_cond.notify_all();
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn write_control(&self, bytes: &[u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if !st.open {
            return Err(Error::NotConnected);
        }
        st.writes_seen += 1;
        if st.fail_write_call == Some(st.writes_seen) {
            st.fail_write_call = None;
            return Err(Error::Transport("injected write failure".to_string()));
        }
        st.partial.extend_from_slice(bytes);
        self.drain_frames(&mut st);
        Ok(bytes.len())
    }

    fn read_control(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.rx.is_empty() {
            let (guard, _) = self.rx_cond.wait_timeout(st, READ_SLICE).unwrap();
            st = guard;
        }
        let mut n = 0;
        while n < buf.len() {
            match st.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn candidates(&self, _port_mask: &[String]) -> Result<Vec<String>> {
        Ok(vec!["loopback0".to_string()])
    }

    fn default_timeouts(&self) -> Timeouts {
        Timeouts::default()
    }

    fn chunk_policy(&self) -> Option<ChunkPolicy> {
        Some(self.policy)
    }

    fn has_bulk(&self) -> bool {
        self.bulk_path
    }

    fn write_bulk(&self, bytes: &[u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        let off = st.bulk.addr + st.bulk.cursor;
        let end = off + bytes.len();
        if st.memory.len() < end {
            st.memory.resize(end, 0);
        }
        st.memory[off..end].copy_from_slice(bytes);
        st.bulk.cursor += bytes.len();
        Ok(bytes.len())
    }

    fn read_bulk(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        let off = st.bulk.addr + st.bulk.cursor;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = st.memory.get(off + i).copied().unwrap_or(0);
        }
        st.bulk.cursor += buf.len();
        Ok(buf.len())
    }

    fn has_interrupt(&self) -> bool {
        true
    }

    fn read_interrupt(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.interrupts.is_empty() {
            let (guard, _) = self.rx_cond.wait_timeout(st, timeout).unwrap();
            st = guard;
        }
        match st.interrupts.pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_read_is_answered() {
        let lb = LoopbackDriver::new();
        lb.open("loopback0").unwrap();
        let rpt = HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16);
        let frame = rpt.encode(false).unwrap();
        lb.write_control(&frame).unwrap();

        let mut buf = [0u8; 128];
        let n = lb.read_control(&mut buf).unwrap();
        assert!(n > 0);
        let mut resp = DeviceReport::default();
        for &b in &buf[..n] {
            resp.parse_step(b);
        }
        assert!(resp.done());
        assert_eq!(resp.payload(), b"RFSYNTH-LOOPBACK");
    }

    #[test]
    fn image_writes_land_at_chunk_offsets() {
        let lb = LoopbackDriver::new();
        lb.open("loopback0").unwrap();
        // Chunk 1 written before chunk 0; the memory model still orders by
        // index.
        for (idx, fill) in [(1u16, 0xBBu8), (0, 0xAA)] {
            let rpt = HostReport::new(Action::CtlrImage, Direction::Write, idx)
                .with_payload(vec![fill; 64]);
            lb.write_control(&rpt.encode(false).unwrap()).unwrap();
        }
        let mem = lb.memory();
        assert_eq!(mem.len(), 128);
        assert!(mem[..64].iter().all(|&b| b == 0xAA));
        assert!(mem[64..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn swallowed_requests_get_no_answer() {
        let lb = LoopbackDriver::new();
        lb.open("loopback0").unwrap();
        lb.swallow_next(1);
        let rpt = HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4);
        lb.write_control(&rpt.encode(false).unwrap()).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(lb.read_control(&mut buf).unwrap(), 0);
    }

    #[test]
    fn partial_writes_reassemble() {
        let lb = LoopbackDriver::new();
        lb.open("loopback0").unwrap();
        let rpt = HostReport::new(Action::CtlrReg, Direction::Write, 2).with_payload(vec![5; 8]);
        let frame = rpt.encode(false).unwrap();
        let (a, b) = frame.split_at(3);
        lb.write_control(a).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(lb.read_control(&mut buf).unwrap(), 0);
        lb.write_control(b).unwrap();
        assert!(lb.read_control(&mut buf).unwrap() > 0);
    }
}
