// The connection core: owns the transport driver, the message registry and
// the worker threads that move reports between them.
//
// Thread layout while connected:
//   sender    pops the tx queue, serialises and writes to the transport
//   receiver  reads transport bytes into the shared rx queue
//   parser    assembles responses, applies timeouts, evicts stale messages
//   memory    runs block transfers handed over by memory_download/upload
//   interrupt listens on the interrupt pipe where the transport has one
//
// Each queue has exactly one owning mutex. The parser records events while
// it works through the registry and fires them only after it is done with
// the message list, so a subscriber is free to post new requests from its
// callback.

mod transfer;

use crate::config::Timeouts;
use crate::events::{EventArgs, EventAux, EventBus, EventToken, MessageEvent};
use crate::message::{Message, MessageHandle, NULL_MESSAGE, PumpOutcome, Status};
use crate::registry::MessageRegistry;
use crate::report::{Action, DeviceReport, Direction, HostReport};
use crate::transport::{DiscoveredDevice, Driver};
use crate::Result;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use transfer::{FastTransfer, TransferDir};
use uuid::Uuid;

/// Shared byte buffer handed to the memory-transfer engine. The engine
/// fills or drains it on its own thread while the caller keeps a handle.
pub type TransferBuffer = Arc<Mutex<Vec<u8>>>;

const WORKER_SLICE: Duration = Duration::from_millis(100);
const PARSER_SLICE: Duration = Duration::from_millis(10);
const DRAIN_SLICE: Duration = Duration::from_millis(25);

pub(crate) struct Core {
    pub(crate) driver: Box<dyn Driver>,
    open: AtomicBool,
    pub(crate) timeouts: RwLock<Timeouts>,
    pub(crate) registry: MessageRegistry,
    pub(crate) events: EventBus,

    tx: Mutex<VecDeque<Arc<Message>>>,
    tx_cond: Condvar,

    rx: Mutex<BytesMut>,
    rx_cond: Condvar,

    transfer: Mutex<Option<FastTransfer>>,
    transfer_cond: Condvar,
    pub(crate) transfer_busy: AtomicBool,
    pub(crate) transfer_progress: AtomicI32,
}

impl Core {
    fn new(driver: Box<dyn Driver>) -> Self {
        let timeouts = driver.default_timeouts();
        Self {
            driver,
            open: AtomicBool::new(false),
            timeouts: RwLock::new(timeouts),
            registry: MessageRegistry::new(),
            events: EventBus::new(),
            tx: Mutex::new(VecDeque::new()),
            tx_cond: Condvar::new(),
            rx: Mutex::new(BytesMut::new()),
            rx_cond: Condvar::new(),
            transfer: Mutex::new(None),
            transfer_cond: Condvar::new(),
            transfer_busy: AtomicBool::new(false),
            transfer_progress: AtomicI32::new(0),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Creates a message for the report, makes it findable in the registry
    /// and only then queues it for the sender.
    pub(crate) fn send_msg(&self, rpt: &HostReport) -> MessageHandle {
        if !self.is_open() {
            return NULL_MESSAGE;
        }
        let msg = Arc::new(Message::new(rpt.clone()));
        let handle = msg.handle();
        self.registry.insert(Arc::clone(&msg));
        {
            let mut queue = self.tx.lock().unwrap();
            queue.push_back(msg);
        }
        self.tx_cond.notify_one();
        handle
    }

    pub(crate) fn send_msg_blocking(&self, rpt: &HostReport) -> DeviceReport {
        if !self.is_open() {
            return DeviceReport::default();
        }
        let handle = self.send_msg(rpt);
        let Some(msg) = self.registry.find(handle) else {
            return DeviceReport::default();
        };
        loop {
            let status = msg.wait_for_completion_timeout(WORKER_SLICE);
            if status.is_terminal() || !self.is_open() {
                break;
            }
        }
        msg.response()
    }

    pub(crate) fn response(&self, handle: MessageHandle) -> DeviceReport {
        match self.registry.find(handle) {
            Some(msg) => msg.response(),
            None => DeviceReport::default(),
        }
    }

    fn rx_timeout(&self) -> Duration {
        self.timeouts.read().unwrap().rx_timeout
    }

    fn send_timeout(&self) -> Duration {
        self.timeouts.read().unwrap().send_timeout
    }

    fn auto_free_timeout(&self) -> Duration {
        self.timeouts.read().unwrap().auto_free_timeout
    }

    // ======= Sender thread =======

    fn sender_loop(&self) {
        while self.is_open() {
            let msg = {
                let mut queue = self.tx.lock().unwrap();
                loop {
                    if !self.is_open() {
                        return;
                    }
                    if let Some(m) = queue.pop_front() {
                        break m;
                    }
                    let (guard, _) = self.tx_cond.wait_timeout(queue, WORKER_SLICE).unwrap();
                    queue = guard;
                }
            };
            self.send_one(&msg);
        }
    }

    fn send_one(&self, msg: &Arc<Message>) {
        let handle = msg.handle();
        let Some(frame) = msg.report().encode(self.driver.pad_to_word()) else {
            log::error!("Msg ({}): report payload exceeds protocol limit", handle);
            msg.set_status(Status::SendError);
            msg.mark_send_time();
            self.registry.notify_all();
            self.events.trigger(MessageEvent::SendError, handle);
            return;
        };

        let deadline = Instant::now() + self.send_timeout();
        let mut written = 0usize;
        let mut outcome = Ok(());
        while written < frame.len() {
            if Instant::now() >= deadline {
                outcome = Err(None);
                break;
            }
            match self.driver.write_control(&frame[written..]) {
                Ok(0) => continue,
                Ok(n) => written += n,
                Err(e) => {
                    outcome = Err(Some(e));
                    break;
                }
            }
        }
        msg.mark_send_time();

        match outcome {
            Ok(()) => {
                msg.set_status(Status::Sent);
                log::trace!("H->D ({}): {} bytes", handle, frame.len());
            }
            Err(None) => {
                log::warn!("Msg ({}): send timed out", handle);
                msg.set_status(Status::TimeoutOnSend);
                self.registry.notify_all();
                self.events.trigger(MessageEvent::TimedOutOnSend, handle);
            }
            Err(Some(e)) => {
                log::error!("Msg ({}): send failed: {}", handle, e);
                msg.set_status(Status::SendError);
                self.registry.notify_all();
                self.events.trigger(MessageEvent::SendError, handle);
            }
        }
    }

    // ======= Receiver thread =======

    fn receiver_loop(&self) {
        let mut chunk = [0u8; 512];
        let mut failures = 0;
        while self.is_open() {
            match self.driver.read_control(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => {
                    failures = 0;
                    if self.driver.delivers_frames() {
                        // This transport reads one buffer per request, so
                        // the bytes belong to the oldest open message.
                        match self.registry.oldest_incomplete() {
                            Some(msg) => msg.commit_bytes(&chunk[..n]),
                            None => {
                                log::warn!("Dropping {} bytes with no message awaiting data", n)
                            }
                        }
                    } else {
                        let mut rxq = self.rx.lock().unwrap();
                        rxq.put_slice(&chunk[..n]);
                    }
                    self.rx_cond.notify_one();
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("Receive error ({} in a row): {}", failures, e);
                    if failures >= 10 {
                        log::error!("Receiver giving up after repeated transport errors");
                        return;
                    }
                    thread::sleep(PARSER_SLICE);
                }
            }
        }
    }

    // ======= Parser / supervisor thread =======

    fn parser_loop(&self) {
        let mut stream: VecDeque<u8> = VecDeque::new();
        let mut pending: Vec<(MessageEvent, i32, EventAux)> = Vec::new();

        while self.is_open() {
            // Swap the shared queue into the local stream; the lock is held
            // only for the swap.
            let taken = {
                let mut rxq = self.rx.lock().unwrap();
                if rxq.is_empty() {
                    let (guard, _) = self.rx_cond.wait_timeout(rxq, PARSER_SLICE).unwrap();
                    rxq = guard;
                }
                rxq.split()
            };
            stream.extend(taken);
            if !self.is_open() {
                break;
            }

            for msg in self.registry.snapshot() {
                if msg.is_complete() {
                    continue;
                }
                if stream.is_empty() && !msg.has_private_data() {
                    continue;
                }
                match msg.pump(&mut stream) {
                    PumpOutcome::NeedMoreData => {}
                    PumpOutcome::UnexpectedChar(byte) => {
                        log::warn!(
                            "Unexpected char 0x{:02x} ({}): [{}]",
                            byte,
                            msg.handle(),
                            msg.status()
                        );
                        pending.push((MessageEvent::UnexpectedRxChar, byte as i32, EventAux::None));
                        self.registry.notify_all();
                    }
                    PumpOutcome::FrameDone => {
                        self.finalise(&msg, &mut pending);
                        self.registry.notify_all();
                    }
                }
            }
            self.fire(&mut pending);

            // Sweep for response timeouts, then expire stale terminal
            // messages.
            let rx_timeout = self.rx_timeout();
            let auto_free = self.auto_free_timeout();
            for msg in self.registry.snapshot() {
                let status = msg.status();
                let elapsed = msg.elapsed().unwrap_or(Duration::ZERO);
                match status {
                    Status::Sent | Status::RxPartial => {
                        if elapsed > rx_timeout {
                            log::warn!("Msg RX timeout ({}): [{}]", msg.handle(), status);
                            msg.set_status(Status::TimeoutOnRecv);
                            pending.push((
                                MessageEvent::ResponseTimedOut,
                                msg.handle(),
                                EventAux::None,
                            ));
                            self.registry.notify_all();
                        }
                    }
                    s if s.is_terminal() => {
                        if elapsed > auto_free {
                            self.registry.remove(msg.handle());
                        }
                    }
                    _ => {}
                }
            }
            self.fire(&mut pending);
        }
    }

    /// Applies the terminal status a finished frame calls for and records
    /// the matching events.
    fn finalise(&self, msg: &Arc<Message>, pending: &mut Vec<(MessageEvent, i32, EventAux)>) {
        let resp = msg.response();
        let handle = msg.handle();
        let ms = |m: &Arc<Message>| m.duration().unwrap_or(Duration::ZERO).as_millis();

        if resp.hardware_alarm() {
            log::warn!("Msg ({}): >>> INTERLOCK ALARM <<<", handle);
            pending.push((MessageEvent::InterlockAlarmSet, handle, EventAux::None));
        }

        if resp.general_error() || resp.tx_timeout() || resp.tx_crc_error() {
            msg.set_status(Status::RxErrorValid);
            log::warn!("Msg ({}): [{}] {}ms", handle, msg.status(), ms(msg));
            pending.push((MessageEvent::ResponseErrorValid, handle, EventAux::None));
        } else if resp.rx_crc_error() {
            msg.set_status(Status::RxErrorInvalid);
            log::error!("Msg ({}): [{}] {}ms", handle, msg.status(), ms(msg));
            pending.push((MessageEvent::ResponseErrorCrc, handle, EventAux::None));
        } else if msg.status() == Status::Interrupt {
            msg.set_status(Status::ProcessedInterrupt);
            // The address field is the interrupt type; the first payload
            // word is its data.
            let mut param = (resp.address as u32) << 16;
            if let Some(word) = resp.payload_u16(0) {
                param |= word as u32;
            }
            let aux = if resp.payload().len() > 4 {
                EventAux::Bytes(resp.payload().to_vec())
            } else if let Some(second) = resp.payload_u16(1) {
                EventAux::Word(second as i32)
            } else {
                EventAux::None
            };
            log::info!("Processed interrupt ({}): type {:#06x}", handle, resp.address);
            pending.push((MessageEvent::InterruptReceived, param as i32, aux));
        } else {
            msg.set_status(Status::RxOk);
            log::debug!("Msg ({}): [{}] {}ms", handle, msg.status(), ms(msg));
            pending.push((MessageEvent::ResponseReceived, handle, EventAux::None));
        }
    }

    fn fire(&self, pending: &mut Vec<(MessageEvent, i32, EventAux)>) {
        for (event, param, aux) in pending.drain(..) {
            self.events.trigger_with(event, param, aux);
        }
    }

    // ======= Memory transfer thread =======

    fn memory_loop(&self) {
        while self.is_open() {
            let job = {
                let mut slot = self.transfer.lock().unwrap();
                loop {
                    if !self.is_open() {
                        return;
                    }
                    if let Some(job) = slot.take() {
                        break job;
                    }
                    let (guard, _) = self.transfer_cond.wait_timeout(slot, WORKER_SLICE).unwrap();
                    slot = guard;
                }
            };
            transfer::run(self, job);
            self.transfer_busy.store(false, Ordering::Release);
        }
    }

    // ======= Interrupt thread =======

    fn interrupt_loop(&self) {
        let mut packet = [0u8; 64];
        while self.is_open() {
            match self.driver.read_interrupt(&mut packet, WORKER_SLICE) {
                Ok(0) => continue,
                Ok(n) => {
                    let msg = Arc::new(Message::interrupt(&packet[..n]));
                    log::debug!("Interrupt packet of {} bytes -> msg {}", n, msg.handle());
                    self.registry.insert(msg);
                    self.rx_cond.notify_one();
                }
                Err(e) => {
                    log::warn!("Interrupt pipe error, listener stopping: {}", e);
                    return;
                }
            }
        }
    }
}

// Type-state builder states for the connection.
pub struct Init;
#[cfg(feature = "serial")]
pub struct Serial;
#[cfg(feature = "usb")]
pub struct Usb;
pub struct Custom;

/// Type-state builder selecting the transport a [`Connection`] will use.
pub struct ConnectionBuilder<T> {
    baud: Option<u32>,
    driver: Option<Box<dyn Driver>>,
    _marker: PhantomData<T>,
}

impl ConnectionBuilder<Init> {
    /// Starts the type-state builder pattern.
    pub fn new() -> ConnectionBuilder<Init> {
        ConnectionBuilder {
            baud: None,
            driver: None,
            _marker: PhantomData,
        }
    }

    /// Continues in the path to build the connection over RS-422 serial.
    #[cfg(feature = "serial")]
    pub fn with_serial(self) -> ConnectionBuilder<Serial> {
        ConnectionBuilder {
            baud: None,
            driver: None,
            _marker: PhantomData,
        }
    }

    /// Continues in the path to build the connection over USB bulk pipes.
    #[cfg(feature = "usb")]
    pub fn with_usb(self) -> ConnectionBuilder<Usb> {
        ConnectionBuilder {
            baud: None,
            driver: None,
            _marker: PhantomData,
        }
    }

    /// Builds on a caller-supplied driver, e.g. the loopback transport.
    pub fn with_driver(self, driver: Box<dyn Driver>) -> ConnectionBuilder<Custom> {
        ConnectionBuilder {
            baud: None,
            driver: Some(driver),
            _marker: PhantomData,
        }
    }
}

impl Default for ConnectionBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "serial")]
impl ConnectionBuilder<Serial> {
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    pub fn build(self) -> Connection {
        let driver = match self.baud {
            Some(baud) => crate::transport::serial::SerialDriver::with_baud(baud),
            None => crate::transport::serial::SerialDriver::new(),
        };
        Connection::with_driver(Box::new(driver))
    }
}

#[cfg(feature = "usb")]
impl ConnectionBuilder<Usb> {
    pub fn build(self) -> Connection {
        Connection::with_driver(Box::new(crate::transport::usb::UsbDriver::new()))
    }
}

impl ConnectionBuilder<Custom> {
    pub fn build(self) -> Connection {
        Connection::with_driver(self.driver.expect("Driver required for custom build path."))
    }
}

/// A connection to one synthesiser system.
///
/// Created idle; [`connect`] opens the transport and starts the worker
/// threads, [`disconnect`] tears them down again. The same value can
/// connect and disconnect repeatedly.
///
/// [`connect`]: Connection::connect
/// [`disconnect`]: Connection::disconnect
pub struct Connection {
    core: Arc<Core>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn with_driver(driver: Box<dyn Driver>) -> Self {
        Self {
            core: Arc::new(Core::new(driver)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// A human readable name for the connection type.
    pub fn ident(&self) -> &'static str {
        self.core.driver.ident()
    }

    /// True while a device is open and the workers are running.
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Opens the device named by `identifier` and starts the worker
    /// threads. A no-op when already connected.
    pub fn connect(&self, identifier: &str) -> Result<()> {
        if self.core.is_open() {
            return Ok(());
        }
        if let Err(e) = self.core.driver.open(identifier) {
            self.core.events.trigger(MessageEvent::DeviceNotAvailable, -1);
            return Err(e);
        }

        self.core.registry.clear();
        self.core.tx.lock().unwrap().clear();
        self.core.rx.lock().unwrap().clear();
        *self.core.transfer.lock().unwrap() = None;
        self.core.transfer_busy.store(false, Ordering::Release);
        self.core.transfer_progress.store(0, Ordering::Release);
        self.core.open.store(true, Ordering::Release);

        let mut workers = self.workers.lock().unwrap();
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("Worker threads must spawn.")
        };
        let core = Arc::clone(&self.core);
        workers.push(spawn("rfsynth-sender", Box::new(move || core.sender_loop())));
        let core = Arc::clone(&self.core);
        workers.push(spawn(
            "rfsynth-receiver",
            Box::new(move || core.receiver_loop()),
        ));
        let core = Arc::clone(&self.core);
        workers.push(spawn("rfsynth-parser", Box::new(move || core.parser_loop())));
        let core = Arc::clone(&self.core);
        workers.push(spawn("rfsynth-memory", Box::new(move || core.memory_loop())));
        if self.core.driver.has_interrupt() {
            let core = Arc::clone(&self.core);
            workers.push(spawn(
                "rfsynth-interrupt",
                Box::new(move || core.interrupt_loop()),
            ));
        }
        log::info!("Connected to {} via {}", identifier, self.ident());
        Ok(())
    }

    /// Disables device interrupts, drains outstanding messages (bounded by
    /// the auto-free timeout), stops the workers and closes the transport.
    pub fn disconnect(&self) {
        if !self.core.is_open() {
            return;
        }

        let off = HostReport::new(Action::CtlrIntrEn, Direction::Write, 0)
            .with_payload(0u32.to_le_bytes().to_vec());
        self.core.send_msg(&off);

        let deadline = Instant::now() + self.core.auto_free_timeout();
        loop {
            let queued = !self.core.tx.lock().unwrap().is_empty();
            let waiting = self
                .core
                .registry
                .snapshot()
                .iter()
                .any(|m| !m.is_complete());
            if (!queued && !waiting) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(DRAIN_SLICE);
        }

        self.core.open.store(false, Ordering::Release);
        self.core.tx_cond.notify_all();
        self.core.rx_cond.notify_all();
        self.core.transfer_cond.notify_all();
        self.core.registry.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        self.core.driver.close();
        log::info!("Disconnected from {}", self.ident());
    }

    /// Probes every candidate port for a responding device.
    ///
    /// `port_mask`, when not empty, restricts the scan to the named ports.
    /// Returns the devices that answered the identity probe; each entry's
    /// `identifier` can be passed straight to [`connect`].
    ///
    /// [`connect`]: Connection::connect
    pub fn discover(&self, port_mask: &[String]) -> Result<Vec<DiscoveredDevice>> {
        if self.core.is_open() {
            // Cannot reopen the driver while a live connection uses it.
            return Ok(Vec::new());
        }
        let candidates = self.core.driver.candidates(port_mask)?;
        let mut found = Vec::new();
        for identifier in candidates {
            if self.connect(&identifier).is_err() {
                continue;
            }
            let saved = *self.core.timeouts.read().unwrap();
            self.core.timeouts.write().unwrap().rx_timeout = saved.discover_timeout;

            let probe = HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16);
            let resp = self.core.send_msg_blocking(&probe);

            *self.core.timeouts.write().unwrap() = saved;

            if resp.done() {
                let identity = String::from_utf8_lossy(resp.payload())
                    .trim_end_matches('\0')
                    .to_string();
                found.push(DiscoveredDevice {
                    identifier: identifier.clone(),
                    identity,
                });
            }
            self.disconnect();
        }
        Ok(found)
    }

    /// Replaces the connection's timeout policy.
    pub fn set_timeouts(&self, timeouts: Timeouts) {
        *self.core.timeouts.write().unwrap() = timeouts;
    }

    pub fn timeouts(&self) -> Timeouts {
        *self.core.timeouts.read().unwrap()
    }

    /// Queues a report and returns immediately. The handle stays valid
    /// until the message ages out of the registry or the connection closes;
    /// [`NULL_MESSAGE`] is returned when no connection is open.
    pub fn send_msg(&self, rpt: &HostReport) -> MessageHandle {
        self.core.send_msg(rpt)
    }

    /// Posts the report and blocks until its message completes, returning
    /// the response. On any failure the response's `done` flag is false and
    /// its status bits describe what happened.
    pub fn send_msg_blocking(&self, rpt: &HostReport) -> DeviceReport {
        self.core.send_msg_blocking(rpt)
    }

    /// Snapshot of whatever response data the parser has accumulated for
    /// `handle`. An empty report when the handle is unknown.
    pub fn response(&self, handle: MessageHandle) -> DeviceReport {
        self.core.response(handle)
    }

    /// Starts a block download of `buf` into device memory at `start_addr`.
    ///
    /// Accepted only while the transfer engine is idle and `start_addr` is
    /// 8-byte aligned. The buffer is zero-padded up to the transfer
    /// granularity. Completion is reported through
    /// [`MessageEvent::MemoryTransferComplete`] or
    /// [`MessageEvent::MemoryTransferError`].
    pub fn memory_download(
        &self,
        buf: TransferBuffer,
        start_addr: u32,
        image_index: i32,
        uuid: Uuid,
    ) -> bool {
        let Some(policy) = self.core.driver.chunk_policy() else {
            self.core.events.trigger(MessageEvent::NoFastMemoryInterface, -1);
            return false;
        };
        if !self.core.is_open() {
            return false;
        }
        if self
            .core
            .transfer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.core.events.trigger(MessageEvent::MemoryTransferNotIdle, -1);
            return false;
        }
        // The DMA engine cannot accept addresses not aligned to 64 bits.
        if start_addr & 0x7 != 0 {
            self.core.transfer_busy.store(false, Ordering::Release);
            return false;
        }

        let len = {
            let mut data = buf.lock().unwrap();
            let rounded = policy.round_up(data.len());
            data.resize(rounded, 0);
            rounded
        };
        log::debug!(
            "Starting memory download of {} bytes at {:#010x} (idx {}, uuid {})",
            len,
            start_addr,
            image_index,
            uuid
        );

        let job = FastTransfer::new(
            buf,
            TransferDir::Download,
            len,
            start_addr,
            image_index,
            uuid,
            policy,
        );
        self.core.transfer_progress.store(0, Ordering::Release);
        *self.core.transfer.lock().unwrap() = Some(job);
        self.core.transfer_cond.notify_one();
        true
    }

    /// Starts a block upload of `len` bytes from device memory at
    /// `start_addr` into `buf`.
    ///
    /// Same preconditions as [`memory_download`]. Before the transfer is
    /// queued, an image-index prepare request primes the device's DMA
    /// engine; the upload is refused when that request fails. The buffer is
    /// resized to `len` rounded up to the transfer granularity and filled
    /// in chunk order.
    ///
    /// [`memory_download`]: Connection::memory_download
    pub fn memory_upload(
        &self,
        buf: TransferBuffer,
        start_addr: u32,
        len: usize,
        image_index: i32,
        uuid: Uuid,
    ) -> bool {
        let Some(policy) = self.core.driver.chunk_policy() else {
            self.core.events.trigger(MessageEvent::NoFastMemoryInterface, -1);
            return false;
        };
        if !self.core.is_open() {
            return false;
        }
        if self
            .core
            .transfer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.core.events.trigger(MessageEvent::MemoryTransferNotIdle, -1);
            return false;
        }
        if start_addr & 0x7 != 0 {
            self.core.transfer_busy.store(false, Ordering::Release);
            return false;
        }

        // Prime the controller's DMA status with an index read so it is
        // ready to stream the data back.
        let prepare = HostReport::new(Action::CtlrImgIdx, Direction::Read, image_index as u16)
            .with_context(2)
            .with_len(49);
        let resp = self.core.send_msg_blocking(&prepare);
        if !resp.done() {
            log::warn!("Upload prepare request failed, refusing transfer");
            self.core.transfer_busy.store(false, Ordering::Release);
            return false;
        }

        let rounded = policy.round_up(len);
        {
            let mut data = buf.lock().unwrap();
            data.clear();
            data.resize(rounded, 0);
        }
        log::debug!(
            "Starting memory upload of {} bytes at {:#010x} (idx {}, uuid {})",
            rounded,
            start_addr,
            image_index,
            uuid
        );

        let job = FastTransfer::new(
            buf,
            TransferDir::Upload,
            rounded,
            start_addr,
            image_index,
            uuid,
            policy,
        );
        self.core.transfer_progress.store(0, Ordering::Release);
        *self.core.transfer.lock().unwrap() = Some(job);
        self.core.transfer_cond.notify_one();
        true
    }

    /// Best-effort transfer progress in percent. `-1` when the transport
    /// has no memory path at all.
    pub fn memory_progress(&self) -> i32 {
        if self.core.driver.chunk_policy().is_none() {
            self.core.events.trigger(MessageEvent::NoFastMemoryInterface, -1);
            return -1;
        }
        self.core.transfer_progress.load(Ordering::Acquire)
    }

    /// Signs up `handler` for one event kind. Handlers run on whichever
    /// worker thread fires the event.
    pub fn event_subscribe<F>(&self, event: MessageEvent, handler: F) -> EventToken
    where
        F: Fn(&EventArgs) + Send + Sync + 'static,
    {
        self.core.events.subscribe(event, handler)
    }

    /// Removes one registration made by [`event_subscribe`].
    ///
    /// [`event_subscribe`]: Connection::event_subscribe
    pub fn event_unsubscribe(&self, event: MessageEvent, token: EventToken) -> bool {
        self.core.events.unsubscribe(event, token)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("ident", &self.ident())
            .field("open", &self.is_open())
            .finish()
    }
}
