// One in-flight protocol transaction: the outbound report, the response
// being assembled for it, and the lifecycle status callers wait on.

use crate::report::{DeviceReport, HostReport};
use derive_more::Display;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Identifies an outstanding [`Message`] within one process.
pub type MessageHandle = i32;

/// Sentinel returned by `send_msg` when no connection is open.
pub const NULL_MESSAGE: MessageHandle = -1;

static ID_COUNT: AtomicI32 = AtomicI32::new(1);

// Handles only need to be unique among currently live messages, so the
// counter is allowed to wrap; it just skips the non-positive range.
fn next_handle() -> MessageHandle {
    loop {
        let h = ID_COUNT.fetch_add(1, Ordering::Relaxed);
        if h > 0 {
            return h;
        }
        let _ = ID_COUNT.compare_exchange(h + 1, 1, Ordering::Relaxed, Ordering::Relaxed);
    }
}

/// Lifecycle states of a message. Terminal states are never left again.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[display("UNSENT")]
    Unsent,
    #[display("SENT")]
    Sent,
    #[display("SEND_ERROR")]
    SendError,
    #[display("TIMEOUT_ON_SEND")]
    TimeoutOnSend,
    #[display("RX_PARTIAL")]
    RxPartial,
    #[display("RX_OK")]
    RxOk,
    #[display("TIMEOUT_ON_RXCV")]
    TimeoutOnRecv,
    #[display("RX_ERROR_VALID")]
    RxErrorValid,
    #[display("RX_ERROR_INVALID")]
    RxErrorInvalid,
    #[display("INTERRUPT")]
    Interrupt,
    #[display("PROCESSED_INTERRUPT")]
    ProcessedInterrupt,
}

impl Status {
    /// True for every state a message cannot leave again.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Status::Unsent | Status::Sent | Status::RxPartial | Status::Interrupt
        )
    }
}

struct Inner {
    status: Status,
    resp: DeviceReport,
    sent_at: Option<Instant>,
    received_at: Option<Instant>,
    // Bytes committed for this message alone, by transports that can tell
    // which request a received buffer belongs to.
    unparsed: VecDeque<u8>,
}

/// Outcome of one parser pass over a message, see [`Message::pump`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpOutcome {
    /// Both byte sources ran dry before the frame completed.
    NeedMoreData,
    /// A byte arrived that cannot start a frame. The parser has been reset
    /// and the offending byte consumed.
    UnexpectedChar(u8),
    /// The embedded parser reached its terminal state, with either a good
    /// frame or a CRC failure; the supervisor reads the flags to decide.
    FrameDone,
}

/// A request/response pair in flight, shared between the caller and the
/// worker threads.
pub struct Message {
    report: HostReport,
    handle: MessageHandle,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Message {
    pub fn new(report: HostReport) -> Self {
        Self {
            report,
            handle: next_handle(),
            inner: Mutex::new(Inner {
                status: Status::Unsent,
                resp: DeviceReport::default(),
                sent_at: None,
                received_at: None,
                unparsed: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Synthesises a message for a device-initiated packet. It enters the
    /// registry already carrying its bytes and waits for the parser to turn
    /// it into a `ProcessedInterrupt`.
    pub(crate) fn interrupt(bytes: &[u8]) -> Self {
        let m = Message::new(HostReport::default());
        {
            let mut inner = m.inner.lock().unwrap();
            inner.status = Status::Interrupt;
            inner.sent_at = Some(Instant::now());
            inner.unparsed.extend(bytes);
        }
        m
    }

    pub fn handle(&self) -> MessageHandle {
        self.handle
    }

    pub fn report(&self) -> &HostReport {
        &self.report
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// Advances the lifecycle. Leaving `Unsent` stamps the send time; the
    /// first transition into a terminal state stamps the receive time and
    /// wakes everyone blocked in [`wait_for_completion`].
    ///
    /// Attempts to move out of a terminal state are ignored.
    ///
    /// [`wait_for_completion`]: Message::wait_for_completion
    pub fn set_status(&self, s: Status) {
        let mut inner = self.inner.lock().unwrap();
        Self::transition(&mut inner, &self.cond, s);
    }

    fn transition(inner: &mut Inner, cond: &Condvar, s: Status) {
        if inner.status.is_terminal() {
            return;
        }
        if inner.status == Status::Unsent && s != Status::Unsent {
            inner.sent_at = Some(Instant::now());
        }
        inner.status = s;
        if s.is_terminal() {
            if inner.received_at.is_none() {
                inner.received_at = Some(Instant::now());
            }
            cond.notify_all();
        }
    }

    /// Stamps the send time without changing status. The sender calls this
    /// after the bytes went out, whatever the outcome was.
    pub(crate) fn mark_send_time(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.sent_at.is_none() {
            inner.sent_at = Some(Instant::now());
        }
    }

    /// Time since the message was handed to the transport.
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner.sent_at.map(|t| t.elapsed())
    }

    /// Round-trip time from send to terminal status.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match (inner.sent_at, inner.received_at) {
            (Some(s), Some(r)) => Some(r.duration_since(s)),
            _ => None,
        }
    }

    /// Blocks the caller until the message reaches a terminal status.
    pub fn wait_for_completion(&self) -> Status {
        let inner = self.inner.lock().unwrap();
        let inner = self
            .cond
            .wait_while(inner, |i| !i.status.is_terminal())
            .unwrap();
        inner.status
    }

    /// Bounded wait; returns the status reached when the wait ended, which
    /// may still be non-terminal.
    pub fn wait_for_completion_timeout(&self, timeout: Duration) -> Status {
        let inner = self.inner.lock().unwrap();
        let (inner, _) = self
            .cond
            .wait_timeout_while(inner, timeout, |i| !i.status.is_terminal())
            .unwrap();
        inner.status
    }

    /// Snapshot of whatever the parser has accumulated so far.
    pub fn response(&self) -> DeviceReport {
        self.inner.lock().unwrap().resp.clone()
    }

    /// Commits a buffer of received bytes to this message alone. Only used
    /// by transports that know which request a buffer answers.
    pub(crate) fn commit_bytes(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().unparsed.extend(bytes);
    }

    pub(crate) fn has_private_data(&self) -> bool {
        !self.inner.lock().unwrap().unparsed.is_empty()
    }

    /// Feeds the embedded parser from this message's private buffer first,
    /// then from the shared stream, one byte at a time, until the frame
    /// completes, an unexpected byte shows up, or both sources run dry.
    ///
    /// The first parsed byte moves a `Sent` message to `RxPartial`.
    pub(crate) fn pump(&self, stream: &mut VecDeque<u8>) -> PumpOutcome {
        use crate::report::ParseState;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.resp.state() == ParseState::Done {
                return PumpOutcome::FrameDone;
            }
            let byte = match inner.unparsed.pop_front() {
                Some(b) => b,
                None => match stream.pop_front() {
                    Some(b) => b,
                    None => return PumpOutcome::NeedMoreData,
                },
            };
            inner.resp.parse_step(byte);
            if inner.status == Status::Sent {
                Self::transition(&mut inner, &self.cond, Status::RxPartial);
            }
            if inner.resp.unexpected_char() {
                inner.resp.reset();
                return PumpOutcome::UnexpectedChar(byte);
            }
            if inner.resp.state() == ParseState::Done {
                return PumpOutcome::FrameDone;
            }
        }
    }

}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("handle", &self.handle)
            .field("status", &self.status())
            .field("action", &self.report.action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Action, Direction, StatusBits};
    use std::sync::Arc;
    use std::thread;

    fn msg() -> Message {
        Message::new(HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4))
    }

    #[test]
    fn handles_are_unique_and_positive() {
        let a = msg();
        let b = msg();
        assert!(a.handle() > 0);
        assert!(b.handle() > 0);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn terminal_status_is_sticky() {
        let m = msg();
        m.set_status(Status::Sent);
        m.set_status(Status::RxOk);
        m.set_status(Status::RxPartial);
        assert_eq!(m.status(), Status::RxOk);
        m.set_status(Status::TimeoutOnRecv);
        assert_eq!(m.status(), Status::RxOk);
    }

    #[test]
    fn received_at_is_stamped_once() {
        let m = msg();
        m.set_status(Status::Sent);
        thread::sleep(Duration::from_millis(5));
        m.set_status(Status::RxOk);
        let d1 = m.duration().unwrap();
        m.set_status(Status::RxErrorValid);
        assert_eq!(m.duration().unwrap(), d1);
    }

    #[test]
    fn completion_wakes_waiters() {
        let m = Arc::new(msg());
        let waiter = {
            let m = Arc::clone(&m);
            thread::spawn(move || m.wait_for_completion())
        };
        m.set_status(Status::Sent);
        m.set_status(Status::RxOk);
        assert_eq!(waiter.join().unwrap(), Status::RxOk);
    }

    #[test]
    fn bounded_wait_returns_current_status() {
        let m = msg();
        m.set_status(Status::Sent);
        assert_eq!(
            m.wait_for_completion_timeout(Duration::from_millis(10)),
            Status::Sent
        );
    }

    #[test]
    fn pump_prefers_the_private_buffer() {
        use crate::report::DeviceReport;
        let m = msg();
        m.set_status(Status::Sent);
        let frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Read,
            0,
            0,
            StatusBits::default(),
            &[1, 2, 3, 4],
        );
        m.commit_bytes(&frame);
        let mut stream = VecDeque::from(vec![0xEEu8]);
        assert_eq!(m.pump(&mut stream), PumpOutcome::FrameDone);
        // The shared stream byte was never touched.
        assert_eq!(stream.len(), 1);
        assert_eq!(m.response().payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn pump_reports_unexpected_bytes_and_recovers() {
        use crate::report::DeviceReport;
        let m = msg();
        m.set_status(Status::Sent);
        let mut stream = VecDeque::from(vec![0xFFu8]);
        let frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Read,
            0,
            0,
            StatusBits::default(),
            &[9; 4],
        );
        stream.extend(frame);
        assert_eq!(m.pump(&mut stream), PumpOutcome::UnexpectedChar(0xFF));
        assert_eq!(m.pump(&mut stream), PumpOutcome::FrameDone);
        assert_eq!(m.response().payload(), &[9; 4]);
    }

    #[test]
    fn first_byte_moves_sent_to_rx_partial() {
        let m = msg();
        m.set_status(Status::Sent);
        let mut stream = VecDeque::from(vec![crate::report::START_BYTE]);
        assert_eq!(m.pump(&mut stream), PumpOutcome::NeedMoreData);
        assert_eq!(m.status(), Status::RxPartial);
    }

    #[test]
    fn interrupt_message_is_not_complete_until_processed() {
        let m = Message::interrupt(&[0x01, 0x02]);
        assert_eq!(m.status(), Status::Interrupt);
        assert!(!m.is_complete());
        m.set_status(Status::ProcessedInterrupt);
        assert!(m.is_complete());
    }
}
