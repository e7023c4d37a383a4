// Report types and the framed wire codec shared by every transport.
//
// A frame on the control channel is:
//
//   START | action | flags | addr lo | addr hi | len lo | len hi | [context]
//         | payload (len bytes) | crc lo | crc hi
//
// The CRC-16 (CCITT-FALSE) covers every byte after the start byte and before
// the trailer. The context byte is only present when bit 7 of the action
// byte is set; a context of zero is never transmitted, which keeps
// encode/decode a round trip for all reports.

use derive_more::Display;

/// Maximum payload carried by one report.
pub const PAYLOAD_MAX: usize = 64;

/// Frame overhead when the context byte is present.
pub const OVERHEAD_MAX: usize = 10;

/// Largest possible frame, before any transport padding.
pub const FRAME_MAX: usize = PAYLOAD_MAX + OVERHEAD_MAX;

pub(crate) const START_BYTE: u8 = 0xA5;

const CONTEXT_FLAG: u8 = 0x80;

const FLAG_WRITE: u8 = 0x01;
const FLAG_TX_CRC: u8 = 0x02;
const FLAG_TX_TIMEOUT: u8 = 0x04;
const FLAG_GENERAL_ERROR: u8 = 0x08;
const FLAG_HARDWARE_ALARM: u8 = 0x10;

/// Operation codes understood by the controller. The code occupies the low
/// nibble of the action byte, so there is room for exactly these sixteen.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    #[default]
    CtlrSettings,
    CtlrReg,
    CtlrImage,
    CtlrImgIdx,
    CtlrImgDma,
    CtlrIntrEn,
    SynthReg,
    SynthEeprom,
    RfaAdc,
    RfaTemp,
    RfaEeprom,
    AodTemp,
    AodEeprom,
    ExtAdc,
    AsyncControl,
    AsyncDac,
}

impl Action {
    pub(crate) fn code(self) -> u8 {
        match self {
            Action::CtlrSettings => 0x0,
            Action::CtlrReg => 0x1,
            Action::CtlrImage => 0x2,
            Action::CtlrImgIdx => 0x3,
            Action::CtlrImgDma => 0x4,
            Action::CtlrIntrEn => 0x5,
            Action::SynthReg => 0x6,
            Action::SynthEeprom => 0x7,
            Action::RfaAdc => 0x8,
            Action::RfaTemp => 0x9,
            Action::RfaEeprom => 0xA,
            Action::AodTemp => 0xB,
            Action::AodEeprom => 0xC,
            Action::ExtAdc => 0xD,
            Action::AsyncControl => 0xE,
            Action::AsyncDac => 0xF,
        }
    }

    pub(crate) fn from_code(code: u8) -> Action {
        match code & 0x0F {
            0x0 => Action::CtlrSettings,
            0x1 => Action::CtlrReg,
            0x2 => Action::CtlrImage,
            0x3 => Action::CtlrImgIdx,
            0x4 => Action::CtlrImgDma,
            0x5 => Action::CtlrIntrEn,
            0x6 => Action::SynthReg,
            0x7 => Action::SynthEeprom,
            0x8 => Action::RfaAdc,
            0x9 => Action::RfaTemp,
            0xA => Action::RfaEeprom,
            0xB => Action::AodTemp,
            0xC => Action::AodEeprom,
            0xD => Action::ExtAdc,
            0xE => Action::AsyncControl,
            _ => Action::AsyncDac,
        }
    }
}

/// Whether a report reads from or writes to the addressed resource.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Read,
    Write,
}

fn crc_over(body: &[u8]) -> u16 {
    crc16::State::<crc16::CCITT_FALSE>::calculate(body)
}

/// An outbound request report.
///
/// `length` is distinct from the payload: a read request carries the number
/// of bytes wanted in `length` with an empty payload, while a write carries
/// `payload.len()` in `length`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostReport {
    pub action: Action,
    pub direction: Direction,
    pub address: u16,
    pub context: u8,
    pub length: u16,
    pub payload: Vec<u8>,
}

impl HostReport {
    pub fn new(action: Action, direction: Direction, address: u16) -> Self {
        Self {
            action,
            direction,
            address,
            context: 0,
            length: 0,
            payload: Vec::new(),
        }
    }

    /// Sets the length field without attaching a payload. Used for read
    /// requests to state how many bytes are wanted back.
    pub fn with_len(mut self, len: u16) -> Self {
        self.length = len;
        self
    }

    pub fn with_context(mut self, context: u8) -> Self {
        self.context = context;
        self
    }

    /// Attaches a payload and sets the length field to match. The codec
    /// truncates nothing; payloads longer than [`PAYLOAD_MAX`] are rejected
    /// at encode time.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.length = payload.len() as u16;
        self.payload = payload;
        self
    }

    /// Serialises the report into a wire frame. When `pad_to_word` is set
    /// the frame is zero-padded to a multiple of four bytes for transports
    /// whose data path is 32 bits wide.
    ///
    /// Returns `None` when the payload exceeds [`PAYLOAD_MAX`] or disagrees
    /// with the length field.
    pub fn encode(&self, pad_to_word: bool) -> Option<Vec<u8>> {
        if self.payload.len() > PAYLOAD_MAX {
            return None;
        }
        if !self.payload.is_empty() && self.payload.len() != self.length as usize {
            return None;
        }

        let mut body = Vec::with_capacity(FRAME_MAX);
        let mut action = self.action.code();
        if self.context != 0 {
            action |= CONTEXT_FLAG;
        }
        body.push(action);
        let mut flags = 0u8;
        if self.direction == Direction::Write {
            flags |= FLAG_WRITE;
        }
        body.push(flags);
        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&self.length.to_le_bytes());
        if self.context != 0 {
            body.push(self.context);
        }
        body.extend_from_slice(&self.payload);

        let crc = crc_over(&body);

        let mut frame = Vec::with_capacity(body.len() + 3);
        frame.push(START_BYTE);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_le_bytes());
        if pad_to_word {
            while frame.len() % 4 != 0 {
                frame.push(0);
            }
        }
        Some(frame)
    }

    /// Parses one host frame back into a report. Counterpart of [`encode`];
    /// mainly of use to test doubles that play the device side.
    ///
    /// [`encode`]: HostReport::encode
    pub fn decode(frame: &[u8]) -> Option<HostReport> {
        let (fields, payload) = split_frame(frame)?;
        Some(HostReport {
            action: fields.action,
            direction: fields.direction,
            address: fields.address,
            context: fields.context,
            length: fields.length,
            payload,
        })
    }
}

struct FrameFields {
    action: Action,
    direction: Direction,
    address: u16,
    context: u8,
    length: u16,
}

// Shared whole-frame splitter for the non-streaming decode paths.
fn split_frame(frame: &[u8]) -> Option<(FrameFields, Vec<u8>)> {
    if frame.len() < OVERHEAD_MAX - 1 || frame[0] != START_BYTE {
        return None;
    }
    let action_byte = frame[1];
    let has_context = action_byte & CONTEXT_FLAG != 0;
    let flags = frame[2];
    let address = u16::from_le_bytes([frame[3], frame[4]]);
    let length = u16::from_le_bytes([frame[5], frame[6]]) as usize;
    let mut at = 7;
    let context = if has_context {
        at += 1;
        frame[at - 1]
    } else {
        0
    };
    if length > PAYLOAD_MAX || frame.len() < at + length + 2 {
        return None;
    }
    let payload = frame[at..at + length].to_vec();
    at += length;
    let crc = u16::from_le_bytes([frame[at], frame[at + 1]]);
    if crc != crc_over(&frame[1..at]) {
        return None;
    }
    let direction = if flags & FLAG_WRITE != 0 {
        Direction::Write
    } else {
        Direction::Read
    };
    Some((
        FrameFields {
            action: Action::from_code(action_byte),
            direction,
            address,
            context,
            length: length as u16,
        },
        payload,
    ))
}

/// Parser states for the inbound stream. Advances one byte at a time and is
/// restartable through [`DeviceReport::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    Idle,
    Header,
    Fields,
    Payload,
    Crc,
    Done,
}

/// An inbound response report with its embedded stream parser.
///
/// Field layout mirrors [`HostReport`] plus the status bits the device sets
/// in the flags byte and the flags the parser itself raises
/// (`unexpected_char`, `rx_crc_error`, `done`).
#[derive(Debug, Clone, Default)]
pub struct DeviceReport {
    pub action: Action,
    pub direction: Direction,
    pub address: u16,
    pub context: u8,
    pub length: u16,
    payload: Vec<u8>,

    done: bool,
    unexpected_char: bool,
    rx_crc_error: bool,
    tx_crc_error: bool,
    tx_timeout: bool,
    general_error: bool,
    hardware_alarm: bool,

    state: ParseState,
    // Body bytes accumulated so far, for the trailer comparison.
    raw: Vec<u8>,
    has_context: bool,
    fields_seen: u8,
    crc_lo: Option<u8>,
}

impl DeviceReport {
    /// True once a whole frame has arrived, its CRC matched and the device
    /// flagged no error. The interlock alarm bit alone does not clear it.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Raised when a byte that is not a start byte arrives while the parser
    /// is idle. The parser stays idle; the supervisor decides what to do.
    pub fn unexpected_char(&self) -> bool {
        self.unexpected_char
    }

    /// CRC mismatch or malformed framing on the receive path.
    pub fn rx_crc_error(&self) -> bool {
        self.rx_crc_error
    }

    /// Device-reported CRC failure on the host-to-device leg.
    pub fn tx_crc_error(&self) -> bool {
        self.tx_crc_error
    }

    /// Device-reported timeout on the host-to-device leg.
    pub fn tx_timeout(&self) -> bool {
        self.tx_timeout
    }

    pub fn general_error(&self) -> bool {
        self.general_error
    }

    /// The interlock alarm bit. May decorate any response, including a
    /// successful one.
    pub fn hardware_alarm(&self) -> bool {
        self.hardware_alarm
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Little-endian 16-bit word at payload word index `i`.
    pub fn payload_u16(&self, i: usize) -> Option<u16> {
        let at = i * 2;
        let b = self.payload.get(at..at + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Advances the parser by one byte.
    ///
    /// A pure function of the byte sequence and starting state: feeding the
    /// same bytes in any grouping produces the same report. Once `Done` is
    /// reached further bytes are ignored, which also swallows any transport
    /// padding that trails the frame.
    pub fn parse_step(&mut self, byte: u8) {
        match self.state {
            ParseState::Idle => {
                if byte == START_BYTE {
                    self.raw.clear();
                    self.state = ParseState::Header;
                } else {
                    self.unexpected_char = true;
                }
            }
            ParseState::Header => {
                self.raw.push(byte);
                self.action = Action::from_code(byte);
                self.has_context = byte & CONTEXT_FLAG != 0;
                self.fields_seen = 0;
                self.state = ParseState::Fields;
            }
            ParseState::Fields => {
                self.raw.push(byte);
                match self.fields_seen {
                    0 => {
                        self.direction = if byte & FLAG_WRITE != 0 {
                            Direction::Write
                        } else {
                            Direction::Read
                        };
                        self.tx_crc_error = byte & FLAG_TX_CRC != 0;
                        self.tx_timeout = byte & FLAG_TX_TIMEOUT != 0;
                        self.general_error = byte & FLAG_GENERAL_ERROR != 0;
                        self.hardware_alarm = byte & FLAG_HARDWARE_ALARM != 0;
                    }
                    1 => self.address = byte as u16,
                    2 => self.address |= (byte as u16) << 8,
                    3 => self.length = byte as u16,
                    4 => self.length |= (byte as u16) << 8,
                    _ => self.context = byte,
                }
                self.fields_seen += 1;
                let wanted = if self.has_context { 6 } else { 5 };
                if self.fields_seen == wanted {
                    if self.length as usize > PAYLOAD_MAX {
                        // A length the protocol cannot produce. Treat the
                        // frame as corrupt rather than chase its payload.
                        self.rx_crc_error = true;
                        self.state = ParseState::Done;
                    } else if self.length > 0 {
                        self.state = ParseState::Payload;
                    } else {
                        self.crc_lo = None;
                        self.state = ParseState::Crc;
                    }
                }
            }
            ParseState::Payload => {
                self.raw.push(byte);
                self.payload.push(byte);
                if self.payload.len() == self.length as usize {
                    self.crc_lo = None;
                    self.state = ParseState::Crc;
                }
            }
            ParseState::Crc => match self.crc_lo {
                None => self.crc_lo = Some(byte),
                Some(lo) => {
                    let got = u16::from_le_bytes([lo, byte]);
                    if got == crc_over(&self.raw) {
                        // A device-flagged failure never counts as done,
                        // whatever shape the frame was in.
                        self.done =
                            !(self.tx_crc_error || self.tx_timeout || self.general_error);
                    } else {
                        self.rx_crc_error = true;
                    }
                    self.state = ParseState::Done;
                }
            },
            ParseState::Done => {}
        }
    }

    /// Returns the parser to a pristine idle state, discarding everything
    /// accumulated so far.
    pub fn reset(&mut self) {
        *self = DeviceReport::default();
    }

    /// Builds a complete device frame from parts. This is the device side of
    /// the codec; the crate itself only needs it for the loopback transport
    /// and tests, real hardware produces these frames in firmware.
    pub fn frame(
        action: Action,
        direction: Direction,
        address: u16,
        context: u8,
        status: StatusBits,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut body = Vec::with_capacity(FRAME_MAX);
        let mut action_byte = action.code();
        if context != 0 {
            action_byte |= CONTEXT_FLAG;
        }
        body.push(action_byte);
        let mut flags = 0u8;
        if direction == Direction::Write {
            flags |= FLAG_WRITE;
        }
        if status.tx_crc_error {
            flags |= FLAG_TX_CRC;
        }
        if status.tx_timeout {
            flags |= FLAG_TX_TIMEOUT;
        }
        if status.general_error {
            flags |= FLAG_GENERAL_ERROR;
        }
        if status.hardware_alarm {
            flags |= FLAG_HARDWARE_ALARM;
        }
        body.push(flags);
        body.extend_from_slice(&address.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        if context != 0 {
            body.push(context);
        }
        body.extend_from_slice(payload);
        let crc = crc_over(&body);
        let mut frame = Vec::with_capacity(body.len() + 3);
        frame.push(START_BYTE);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }
}

/// Device status bits for frame construction, see [`DeviceReport::frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusBits {
    pub tx_crc_error: bool,
    pub tx_timeout: bool,
    pub general_error: bool,
    pub hardware_alarm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse_all(bytes: &[u8]) -> DeviceReport {
        let mut rpt = DeviceReport::default();
        for &b in bytes {
            rpt.parse_step(b);
        }
        rpt
    }

    #[rstest]
    #[case(Action::CtlrSettings, Direction::Read, 0x0000, 0, vec![])]
    #[case(Action::CtlrReg, Direction::Write, 0x1234, 0, vec![1, 2, 3, 4])]
    #[case(Action::CtlrImage, Direction::Write, 0xFFFF, 0x02, vec![0xAA; 64])]
    #[case(Action::SynthReg, Direction::Read, 0x0001, 0xFF, vec![])]
    #[case(Action::AsyncDac, Direction::Write, 0x8000, 0, vec![0x00])]
    fn host_frame_round_trips(
        #[case] action: Action,
        #[case] direction: Direction,
        #[case] address: u16,
        #[case] context: u8,
        #[case] payload: Vec<u8>,
    ) {
        let rpt = HostReport::new(action, direction, address)
            .with_context(context)
            .with_payload(payload);
        let frame = rpt.encode(false).unwrap();
        assert_eq!(HostReport::decode(&frame), Some(rpt));
    }

    #[test]
    fn read_request_length_survives_round_trip() {
        let rpt = HostReport::new(Action::CtlrSettings, Direction::Read, 0).with_len(16);
        let frame = rpt.encode(false).unwrap();
        let back = HostReport::decode(&frame).unwrap();
        assert_eq!(back.length, 16);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let rpt = HostReport::new(Action::CtlrImage, Direction::Write, 0)
            .with_payload(vec![0; PAYLOAD_MAX + 1]);
        assert!(rpt.encode(false).is_none());
    }

    #[test]
    fn padded_frame_is_word_aligned_and_still_decodes() {
        let rpt = HostReport::new(Action::CtlrReg, Direction::Write, 7).with_payload(vec![9; 5]);
        let frame = rpt.encode(true).unwrap();
        assert_eq!(frame.len() % 4, 0);
        assert_eq!(HostReport::decode(&frame), Some(rpt));
    }

    #[test]
    fn parser_accepts_device_frame() {
        let frame = DeviceReport::frame(
            Action::CtlrSettings,
            Direction::Read,
            0x0010,
            0,
            StatusBits::default(),
            b"settings-payload",
        );
        let rpt = parse_all(&frame);
        assert!(rpt.done());
        assert_eq!(rpt.action, Action::CtlrSettings);
        assert_eq!(rpt.address, 0x0010);
        assert_eq!(rpt.payload(), b"settings-payload");
        assert!(!rpt.rx_crc_error());
    }

    #[test]
    fn parser_flags_unexpected_byte_and_stays_idle() {
        let mut rpt = DeviceReport::default();
        rpt.parse_step(0xFF);
        assert!(rpt.unexpected_char());
        assert_eq!(rpt.state(), ParseState::Idle);
    }

    #[test]
    fn crc_mismatch_reaches_done_with_error() {
        let mut frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Read,
            0,
            0,
            StatusBits::default(),
            &[1, 2, 3],
        );
        let last = frame.len() - 1;
        frame[last] ^= 0x55;
        let rpt = parse_all(&frame);
        assert!(!rpt.done());
        assert!(rpt.rx_crc_error());
        assert_eq!(rpt.state(), ParseState::Done);
    }

    #[test]
    fn status_bits_come_through_the_flags_byte() {
        let frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Write,
            0,
            0,
            StatusBits {
                general_error: true,
                hardware_alarm: true,
                ..Default::default()
            },
            &[],
        );
        let rpt = parse_all(&frame);
        assert!(rpt.general_error());
        assert!(rpt.hardware_alarm());
        assert!(!rpt.tx_crc_error());
        // A device-flagged error never reads as done.
        assert!(!rpt.done());
    }

    #[test]
    fn alarm_alone_does_not_clear_done() {
        let frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Read,
            0,
            0,
            StatusBits {
                hardware_alarm: true,
                ..Default::default()
            },
            &[1, 2],
        );
        let rpt = parse_all(&frame);
        assert!(rpt.done());
        assert!(rpt.hardware_alarm());
    }

    #[test]
    fn trailing_padding_is_ignored_after_done() {
        let mut frame = DeviceReport::frame(
            Action::CtlrImgIdx,
            Direction::Read,
            3,
            2,
            StatusBits::default(),
            &[7; 10],
        );
        frame.extend_from_slice(&[0, 0, 0]);
        let rpt = parse_all(&frame);
        assert!(rpt.done());
        assert_eq!(rpt.context, 2);
        assert_eq!(rpt.payload().len(), 10);
    }

    #[test]
    fn parse_is_independent_of_byte_grouping() {
        let frame = DeviceReport::frame(
            Action::RfaAdc,
            Direction::Read,
            0x55AA,
            9,
            StatusBits::default(),
            &[1, 2, 3, 4, 5],
        );
        let whole = parse_all(&frame);
        let mut split = DeviceReport::default();
        let (a, b) = frame.split_at(4);
        for &byte in a {
            split.parse_step(byte);
        }
        for &byte in b {
            split.parse_step(byte);
        }
        assert_eq!(whole.done(), split.done());
        assert_eq!(whole.address, split.address);
        assert_eq!(whole.payload(), split.payload());
    }

    #[test]
    fn reset_restarts_the_parser() {
        let frame = DeviceReport::frame(
            Action::CtlrReg,
            Direction::Read,
            1,
            0,
            StatusBits::default(),
            &[1],
        );
        let mut rpt = DeviceReport::default();
        for &b in &frame[..4] {
            rpt.parse_step(b);
        }
        rpt.reset();
        assert_eq!(rpt.state(), ParseState::Idle);
        for &b in &frame {
            rpt.parse_step(b);
        }
        assert!(rpt.done());
    }

    #[test]
    fn impossible_length_marks_frame_corrupt() {
        let mut body = vec![Action::CtlrReg.code(), 0];
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(PAYLOAD_MAX as u16 + 1).to_le_bytes());
        let mut frame = vec![START_BYTE];
        frame.extend_from_slice(&body);
        let rpt = parse_all(&frame);
        assert!(rpt.rx_crc_error());
        assert_eq!(rpt.state(), ParseState::Done);
    }
}
