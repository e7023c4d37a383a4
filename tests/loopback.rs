// End-to-end exercises of the connection core against the loopback
// transport. No hardware involved; the loopback plays the device side and
// injects faults on request.

use rfsynth::transport::loopback::LoopbackDriver;
use rfsynth::report::StatusBits;
use rfsynth::{
    Action, Connection, ConnectionBuilder, Direction, EventArgs, EventAux, HostReport,
    MessageEvent, Timeouts, NULL_MESSAGE,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn test_timeouts() -> Timeouts {
    Timeouts {
        send_timeout: Duration::from_millis(500),
        rx_timeout: Duration::from_millis(400),
        auto_free_timeout: Duration::from_millis(2000),
        discover_timeout: Duration::from_millis(500),
    }
}

fn connect_loopback() -> (Connection, Arc<LoopbackDriver>) {
    let lb = Arc::new(LoopbackDriver::new());
    let conn = ConnectionBuilder::new()
        .with_driver(Box::new(Arc::clone(&lb)))
        .build();
    conn.set_timeouts(test_timeouts());
    conn.connect("loopback0").unwrap();
    (conn, lb)
}

type Captured = Arc<Mutex<Vec<EventArgs>>>;

fn capture(conn: &Connection, kind: MessageEvent) -> Captured {
    let store: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&store);
    conn.event_subscribe(kind, move |args| {
        sink.lock().unwrap().push(args.clone());
    });
    store
}

fn wait_for(store: &Captured, count: usize, budget: Duration) -> Vec<EventArgs> {
    let deadline = Instant::now() + budget;
    loop {
        {
            let seen = store.lock().unwrap();
            if seen.len() >= count {
                return seen.clone();
            }
        }
        assert!(Instant::now() < deadline, "event did not arrive in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn echo_round_trip() {
    let (conn, _lb) = connect_loopback();
    let started = Instant::now();
    let rpt = HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16);
    let resp = conn.send_msg_blocking(&rpt);
    assert!(resp.done());
    assert_eq!(resp.payload().len(), 16);
    assert_eq!(resp.payload(), b"RFSYNTH-LOOPBACK");
    assert!(started.elapsed() < conn.timeouts().rx_timeout);
    conn.disconnect();
}

#[test]
fn swallowed_request_times_out() {
    let (conn, lb) = connect_loopback();
    let timed_out = capture(&conn, MessageEvent::ResponseTimedOut);
    lb.swallow_next(1);
    let handle = conn.send_msg(&HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4));
    assert_ne!(handle, NULL_MESSAGE);
    let events = wait_for(&timed_out, 1, Duration::from_secs(2));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].param, handle);
    conn.disconnect();
}

#[test]
fn write_failure_marks_only_the_failing_message() {
    let (conn, lb) = connect_loopback();
    let send_errors = capture(&conn, MessageEvent::SendError);

    let first = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4));
    assert!(first.done());

    lb.fail_write_call(1);
    let handle = conn.send_msg(&HostReport::new(Action::CtlrReg, Direction::Read, 1).with_len(4));
    let events = wait_for(&send_errors, 1, Duration::from_secs(2));
    assert_eq!(events[0].param, handle);

    // The connection keeps working afterwards.
    let again = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 2).with_len(4));
    assert!(again.done());
    conn.disconnect();
}

#[test]
fn unexpected_byte_then_recovery() {
    let (conn, lb) = connect_loopback();
    let unexpected = capture(&conn, MessageEvent::UnexpectedRxChar);
    lb.inject(&[0xFF]);
    let resp = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4));
    assert!(resp.done(), "valid frame after the stray byte still completes");
    let events = wait_for(&unexpected, 1, Duration::from_secs(2));
    assert_eq!(events[0].param, 0xFF);
    conn.disconnect();
}

#[test]
fn pipelined_upload_of_4096_bytes() {
    let (conn, lb) = connect_loopback();
    let complete = capture(&conn, MessageEvent::MemoryTransferComplete);

    let pattern: Vec<u8> = (0..4096usize).map(|i| i as u8).collect();
    lb.preload_memory(pattern.clone());

    let buf = Arc::new(Mutex::new(Vec::new()));
    assert!(conn.memory_upload(Arc::clone(&buf), 0, 4096, 0, Uuid::nil()));

    let events = wait_for(&complete, 1, Duration::from_secs(5));
    assert_eq!(events[0].param, 4096);

    let data = buf.lock().unwrap();
    assert_eq!(data.len(), 4096);
    assert_eq!(&data[..], &pattern[..]);
    conn.disconnect();
}

#[test]
fn unaligned_download_is_rejected_silently() {
    let (conn, _lb) = connect_loopback();
    let complete = capture(&conn, MessageEvent::MemoryTransferComplete);
    let error = capture(&conn, MessageEvent::MemoryTransferError);
    let not_idle = capture(&conn, MessageEvent::MemoryTransferNotIdle);

    let buf = Arc::new(Mutex::new(vec![0u8; 64]));
    assert!(!conn.memory_download(buf, 0x5, 0, Uuid::nil()));

    std::thread::sleep(Duration::from_millis(100));
    assert!(complete.lock().unwrap().is_empty());
    assert!(error.lock().unwrap().is_empty());
    assert!(not_idle.lock().unwrap().is_empty());
    conn.disconnect();
}

#[test]
fn download_lands_in_chunk_order_and_pads() {
    let (conn, lb) = connect_loopback();
    let complete = capture(&conn, MessageEvent::MemoryTransferComplete);

    let data: Vec<u8> = (0..200usize).map(|i| (i * 3) as u8).collect();
    let buf = Arc::new(Mutex::new(data.clone()));
    assert!(conn.memory_download(Arc::clone(&buf), 0, 1, Uuid::nil()));

    let events = wait_for(&complete, 1, Duration::from_secs(5));
    // 200 bytes round up to 256.
    assert_eq!(events[0].param, 256);

    let memory = lb.memory();
    assert_eq!(memory.len(), 256);
    assert_eq!(&memory[..200], &data[..]);
    assert!(memory[200..].iter().all(|&b| b == 0));
    conn.disconnect();
}

#[test]
fn stalled_transfer_reports_error_and_rejects_concurrent_one() {
    let (conn, lb) = connect_loopback();
    let error = capture(&conn, MessageEvent::MemoryTransferError);
    let not_idle = capture(&conn, MessageEvent::MemoryTransferNotIdle);

    // Single chunk, never answered; the transfer aborts once the
    // supervisor times the message out.
    lb.swallow_next(1);
    let buf = Arc::new(Mutex::new(vec![0xABu8; 64]));
    assert!(conn.memory_download(Arc::clone(&buf), 0, 0, Uuid::nil()));

    // While it is stalled the engine is not idle.
    let other = Arc::new(Mutex::new(vec![0u8; 64]));
    assert!(!conn.memory_download(other, 0, 0, Uuid::nil()));
    assert_eq!(wait_for(&not_idle, 1, Duration::from_secs(1)).len(), 1);

    let events = wait_for(&error, 1, Duration::from_secs(3));
    assert_eq!(events[0].param, 1, "failing chunk index is reported");
    conn.disconnect();
}

#[test]
fn bulk_path_download_uses_raw_pipes() {
    let lb = Arc::new(LoopbackDriver::new().with_bulk_path());
    let conn = ConnectionBuilder::new()
        .with_driver(Box::new(Arc::clone(&lb)))
        .build();
    conn.set_timeouts(test_timeouts());
    conn.connect("loopback0").unwrap();

    let complete = capture(&conn, MessageEvent::MemoryTransferComplete);
    let data: Vec<u8> = (0..256usize).map(|i| i as u8).collect();
    let buf = Arc::new(Mutex::new(data.clone()));
    assert!(conn.memory_download(Arc::clone(&buf), 0, 0, Uuid::nil()));

    let events = wait_for(&complete, 1, Duration::from_secs(5));
    assert_eq!(events[0].param, 256);
    assert_eq!(&lb.memory()[..256], &data[..]);
    conn.disconnect();
}

#[test]
fn interrupt_packets_fan_out_with_decoded_params() {
    let (conn, lb) = connect_loopback();
    let interrupts = capture(&conn, MessageEvent::InterruptReceived);

    // Two data bytes: type in the upper half, first word in the lower.
    lb.raise_interrupt(0x0042, &[0x34, 0x12]);
    let events = wait_for(&interrupts, 1, Duration::from_secs(2));
    assert_eq!(events[0].param as u32, 0x0042_1234);
    assert_eq!(events[0].aux, EventAux::None);

    // Exactly four bytes: second word arrives as a second integer.
    lb.raise_interrupt(0x0007, &[0x01, 0x00, 0xBE, 0xBA]);
    let events = wait_for(&interrupts, 2, Duration::from_secs(2));
    assert_eq!(events[1].param as u32, 0x0007_0001);
    assert_eq!(events[1].aux, EventAux::Word(0xBABE));

    // Longer payloads arrive raw.
    let long = [1u8, 0, 2, 3, 4, 5, 6, 7];
    lb.raise_interrupt(0x0009, &long);
    let events = wait_for(&interrupts, 3, Duration::from_secs(2));
    assert_eq!(events[2].param as u32, 0x0009_0001);
    assert_eq!(events[2].aux, EventAux::Bytes(long.to_vec()));
    conn.disconnect();
}

#[test]
fn crc_corruption_surfaces_as_invalid_response() {
    let (conn, lb) = connect_loopback();
    let crc_errors = capture(&conn, MessageEvent::ResponseErrorCrc);
    lb.corrupt_next_crc();
    let resp = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4));
    assert!(!resp.done());
    assert!(resp.rx_crc_error());
    assert_eq!(wait_for(&crc_errors, 1, Duration::from_secs(2)).len(), 1);
    conn.disconnect();
}

#[test]
fn device_error_bits_mark_response_error_valid() {
    let (conn, lb) = connect_loopback();
    let valid_errors = capture(&conn, MessageEvent::ResponseErrorValid);
    let alarms = capture(&conn, MessageEvent::InterlockAlarmSet);
    lb.set_next_status(StatusBits {
        general_error: true,
        hardware_alarm: true,
        ..Default::default()
    });
    let resp = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 0).with_len(4));
    assert!(!resp.done());
    assert!(resp.general_error());
    let handle_events = wait_for(&valid_errors, 1, Duration::from_secs(2));
    let alarm_events = wait_for(&alarms, 1, Duration::from_secs(2));
    assert_eq!(handle_events[0].param, alarm_events[0].param);
    conn.disconnect();
}

#[test]
fn send_msg_without_connection_returns_null() {
    let lb = Arc::new(LoopbackDriver::new());
    let conn = ConnectionBuilder::new()
        .with_driver(Box::new(Arc::clone(&lb)))
        .build();
    let handle = conn.send_msg(&HostReport::new(Action::CtlrReg, Direction::Read, 0));
    assert_eq!(handle, NULL_MESSAGE);
    let resp = conn.send_msg_blocking(&HostReport::new(Action::CtlrReg, Direction::Read, 0));
    assert!(!resp.done());
}

#[test]
fn unknown_handle_yields_empty_response() {
    let (conn, _lb) = connect_loopback();
    let resp = conn.response(0x7FFF_FFF0);
    assert!(!resp.done());
    assert!(resp.payload().is_empty());
    conn.disconnect();
}

#[test]
fn terminal_messages_age_out_of_the_registry() {
    let (conn, _lb) = connect_loopback();
    let mut timeouts = test_timeouts();
    timeouts.auto_free_timeout = Duration::from_millis(200);
    conn.set_timeouts(timeouts);

    let handle = conn.send_msg(&HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16));
    let deadline = Instant::now() + Duration::from_secs(2);
    while !conn.response(handle).done() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }

    std::thread::sleep(Duration::from_millis(600));
    assert!(
        !conn.response(handle).done(),
        "evicted handle reads as an empty report"
    );
    conn.disconnect();
}

#[test]
fn discovery_probes_and_reconnects() {
    let lb = Arc::new(LoopbackDriver::new());
    let conn = ConnectionBuilder::new()
        .with_driver(Box::new(Arc::clone(&lb)))
        .build();
    conn.set_timeouts(test_timeouts());

    let found = conn.discover(&[]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier, "loopback0");
    assert_eq!(found[0].identity, "RFSYNTH-LOOPBACK");
    assert!(!conn.is_open(), "discovery leaves the connection closed");

    // The same core reconnects cleanly afterwards.
    conn.connect(&found[0].identifier).unwrap();
    let resp = conn.send_msg_blocking(&HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16));
    assert!(resp.done());
    conn.disconnect();
}

#[test]
fn handles_are_issued_in_order_and_survive_until_terminal() {
    let (conn, _lb) = connect_loopback();
    let received = capture(&conn, MessageEvent::ResponseReceived);
    let mut handles = Vec::new();
    for i in 0..8 {
        let h = conn.send_msg(&HostReport::new(Action::CtlrReg, Direction::Read, i).with_len(2));
        assert_ne!(h, NULL_MESSAGE);
        handles.push(h);
    }
    let mut sorted = handles.clone();
    sorted.sort();
    assert_eq!(handles, sorted, "handles are monotone per send order");

    let events = wait_for(&received, 8, Duration::from_secs(3));
    let fired: Vec<i32> = events.iter().map(|e| e.param).collect();
    assert_eq!(fired, handles, "responses complete in send order");
    conn.disconnect();
}
