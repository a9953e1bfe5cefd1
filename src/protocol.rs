use crate::fault::{FaultCode, FAULT_BUFFER_CAPACITY, NO_FAULT};
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// First byte of every response frame.
pub const RETURN_MARKER: u8 = 12;
/// Terminates a command frame; never valid as argument data.
pub const FRAME_SENTINEL: u8 = 0xFF;
pub const RESPONSE_FRAME_SIZE: usize = 8;
pub const RESPONSE_PAYLOAD_MAX: usize = RESPONSE_FRAME_SIZE - 2;
pub const MAX_COMMAND_ARGS: usize = 16;
pub const MAX_COMMAND_FRAME: usize = MAX_COMMAND_ARGS + 2;
/// Largest single read from the link.
pub const LINK_RX_LEN: usize = 255;
pub const ERROR_TRANSFER_FRAME_MAX: usize = FAULT_BUFFER_CAPACITY + 2;

pub const LINK_TEST_OPCODE: u8 = 0x6A;
pub const LINK_TEST_MESSAGE: [u8; 8] = [LINK_TEST_OPCODE, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];

const_assert!(MAX_COMMAND_FRAME <= LINK_RX_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("argument {index} is the frame sentinel")]
    SentinelInArgument { index: usize },
    #[error("{count} arguments exceed the frame limit")]
    TooManyArguments { count: usize },
    #[error("response length {0} outside 2..=8")]
    ResponseLength(usize),
    #[error("frame does not start with the expected marker")]
    BadMarker,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    CurrentSetup = 55,
    CurrentValidate = 56,
    CurrentStatus = 57,
    CurrentReset = 58,
    CurrentReadCurrent = 59,
    CurrentReadVoltage = 60,
    CurrentReadPower = 61,
    CurrentReadPeakPower = 62,
    CurrentReadLimit = 63,
    TempSetup = 64,
    TempValidate = 65,
    TempStatus = 66,
    TempReset = 67,
    TempRead = 68,
    TempReadLimit = 69,
    HubSetup = 70,
    HubValidate = 71,
    HubReset = 72,
    ErrorTransfer = 73,
    ImageConfig = 74,
    ImageCapture = 75,
    FileTransfer = 76,
    SyncTime = 77,
    Checksum = 78,
}

impl Opcode {
    pub const ALL: [Opcode; 24] = [
        Self::CurrentSetup,
        Self::CurrentValidate,
        Self::CurrentStatus,
        Self::CurrentReset,
        Self::CurrentReadCurrent,
        Self::CurrentReadVoltage,
        Self::CurrentReadPower,
        Self::CurrentReadPeakPower,
        Self::CurrentReadLimit,
        Self::TempSetup,
        Self::TempValidate,
        Self::TempStatus,
        Self::TempReset,
        Self::TempRead,
        Self::TempReadLimit,
        Self::HubSetup,
        Self::HubValidate,
        Self::HubReset,
        Self::ErrorTransfer,
        Self::ImageConfig,
        Self::ImageCapture,
        Self::FileTransfer,
        Self::SyncTime,
        Self::Checksum,
    ];

    /// Opcodes handled outside this controller; they answer with a format error.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::ImageConfig | Self::ImageCapture | Self::FileTransfer | Self::SyncTime | Self::Checksum
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|op| *op as u8 == value)
            .ok_or(FrameError::UnknownOpcode(value))
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

/// A decoded command: opcode plus up to [`MAX_COMMAND_ARGS`] arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: u8,
    args: Vec<u8, MAX_COMMAND_ARGS>,
    dropped: usize,
}

impl CommandFrame {
    pub fn new(opcode: impl Into<u8>, args: &[u8]) -> Result<Self, FrameError> {
        if let Some(index) = args.iter().position(|b| *b == FRAME_SENTINEL) {
            return Err(FrameError::SentinelInArgument { index });
        }
        let args = Vec::from_slice(args)
            .map_err(|()| FrameError::TooManyArguments { count: args.len() })?;
        Ok(Self {
            opcode: opcode.into(),
            args,
            dropped: 0,
        })
    }

    /// First byte is the opcode; arguments run to the sentinel or the end of
    /// the frame. Arguments past the array bound are dropped.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&opcode, rest) = frame.split_first().ok_or(FrameError::Empty)?;
        let mut args = Vec::new();
        let mut dropped = 0;
        for &byte in rest.iter().take_while(|b| **b != FRAME_SENTINEL) {
            if args.push(byte).is_err() {
                dropped += 1;
            }
        }
        Ok(Self {
            opcode,
            args,
            dropped,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8, MAX_COMMAND_FRAME> {
        let mut frame = Vec::new();
        // Capacity covers opcode, every argument and the sentinel.
        let _ = frame.push(self.opcode);
        let _ = frame.extend_from_slice(&self.args);
        let _ = frame.push(FRAME_SENTINEL);
        frame
    }

    #[must_use]
    pub const fn opcode(&self) -> u8 {
        self.opcode
    }

    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<u8> {
        self.args.get(index).copied()
    }

    /// Arguments discarded while decoding.
    #[must_use]
    pub const fn dropped_args(&self) -> usize {
        self.dropped
    }
}

/// `[RETURN_MARKER][status][payload...]`, at most [`RESPONSE_FRAME_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    bytes: Vec<u8, RESPONSE_FRAME_SIZE>,
}

impl ResponseFrame {
    /// Builds a frame of exactly `len` bytes. Payload beyond `len` is cut,
    /// a short payload is zero-padded.
    pub fn encode(echo: u8, status: u8, payload: &[u8], len: usize) -> Result<Self, FrameError> {
        if !(2..=RESPONSE_FRAME_SIZE).contains(&len) {
            return Err(FrameError::ResponseLength(len));
        }
        let mut bytes: Vec<u8, RESPONSE_FRAME_SIZE> = Vec::new();
        let _ = bytes.push(echo);
        let _ = bytes.push(status);
        for i in 0..len - 2 {
            let _ = bytes.push(payload.get(i).copied().unwrap_or(0));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn status(status: u8) -> Self {
        Self::with_payload(status, &[])
    }

    #[must_use]
    pub fn success() -> Self {
        Self::status(NO_FAULT)
    }

    #[must_use]
    pub fn format_error() -> Self {
        Self::status(FaultCode::format().narrow())
    }

    /// Success followed by a big-endian word.
    #[must_use]
    pub fn word(value: u16) -> Self {
        Self::with_payload(NO_FAULT, &value.to_be_bytes())
    }

    /// Fault codes starting in the status slot, or a bare success when empty.
    /// Codes beyond the frame budget are cut.
    #[must_use]
    pub fn codes(codes: &[u8]) -> Self {
        match codes.split_first() {
            None => Self::success(),
            Some((&first, rest)) => Self::with_payload(first, rest),
        }
    }

    fn with_payload(status: u8, payload: &[u8]) -> Self {
        let len = (payload.len() + 2).min(RESPONSE_FRAME_SIZE);
        let mut bytes: Vec<u8, RESPONSE_FRAME_SIZE> = Vec::new();
        let _ = bytes.push(RETURN_MARKER);
        let _ = bytes.push(status);
        let _ = bytes.extend_from_slice(&payload[..len - 2]);
        Self { bytes }
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < 2 || frame.len() > RESPONSE_FRAME_SIZE {
            return Err(FrameError::ResponseLength(frame.len()));
        }
        if frame[0] != RETURN_MARKER {
            return Err(FrameError::BadMarker);
        }
        let bytes = Vec::from_slice(frame).map_err(|()| FrameError::ResponseLength(frame.len()))?;
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn status_byte(&self) -> u8 {
        self.bytes[1]
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[2..]
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_byte() == NO_FAULT
    }

    /// The big-endian word of a successful read.
    #[must_use]
    pub fn word_value(&self) -> Option<u16> {
        match self.payload() {
            [hi, lo] if self.is_success() => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

impl fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseFrame({:02X?})", self.bytes.as_slice())
    }
}

/// `[ERROR_TRANSFER][count][code...]` with narrow fault codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTransferFrame {
    bytes: Vec<u8, ERROR_TRANSFER_FRAME_MAX>,
}

impl ErrorTransferFrame {
    #[must_use]
    pub fn encode(faults: &[FaultCode]) -> Self {
        let faults = &faults[..faults.len().min(FAULT_BUFFER_CAPACITY)];
        let mut bytes = Vec::new();
        let _ = bytes.push(Opcode::ErrorTransfer as u8);
        let _ = bytes.push(faults.len() as u8);
        for fault in faults {
            let _ = bytes.push(fault.narrow());
        }
        Self { bytes }
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        match frame {
            [op, count, codes @ ..] if *op == Opcode::ErrorTransfer as u8 => {
                let count = usize::from(*count);
                if codes.len() < count {
                    return Err(FrameError::ResponseLength(frame.len()));
                }
                let bytes = Vec::from_slice(&frame[..count + 2])
                    .map_err(|()| FrameError::ResponseLength(frame.len()))?;
                Ok(Self { bytes })
            }
            [_, _, ..] => Err(FrameError::BadMarker),
            _ => Err(FrameError::ResponseLength(frame.len())),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn count(&self) -> usize {
        usize::from(self.bytes[1])
    }

    #[must_use]
    pub fn codes(&self) -> &[u8] {
        &self.bytes[2..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceId;
    use crate::fault::FaultCategory;

    #[test]
    fn test_decode_stops_at_sentinel() {
        let frame = CommandFrame::decode(&[55, 2, FRAME_SENTINEL, 9, 9]).unwrap();
        assert_eq!(frame.opcode(), 55);
        assert_eq!(frame.args(), &[2]);
    }

    #[test]
    fn test_decode_without_sentinel_reads_to_end() {
        let frame = CommandFrame::decode(&[68, 3, 4]).unwrap();
        assert_eq!(frame.args(), &[3, 4]);
        assert_eq!(frame.dropped_args(), 0);
    }

    #[test]
    fn test_decode_drops_excess_arguments() {
        let mut raw = [1u8; MAX_COMMAND_ARGS + 5];
        raw[0] = 56;
        let frame = CommandFrame::decode(&raw).unwrap();
        assert_eq!(frame.args().len(), MAX_COMMAND_ARGS);
        assert_eq!(frame.dropped_args(), 4);
    }

    #[test]
    fn test_decode_empty_frame() {
        assert_eq!(CommandFrame::decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = CommandFrame::new(Opcode::CurrentReadPower, &[3, 0, 0x7F]).unwrap();
        let encoded = frame.encode();
        assert_eq!(encoded.last(), Some(&FRAME_SENTINEL));
        assert_eq!(CommandFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_new_rejects_sentinel_argument() {
        assert_eq!(
            CommandFrame::new(Opcode::TempRead, &[1, FRAME_SENTINEL]),
            Err(FrameError::SentinelInArgument { index: 1 })
        );
    }

    #[test]
    fn test_opcode_table() {
        assert_eq!(Opcode::try_from(55), Ok(Opcode::CurrentSetup));
        assert_eq!(Opcode::try_from(73), Ok(Opcode::ErrorTransfer));
        assert_eq!(Opcode::try_from(78), Ok(Opcode::Checksum));
        assert_eq!(Opcode::try_from(54), Err(FrameError::UnknownOpcode(54)));
        assert!(Opcode::SyncTime.is_reserved());
        assert!(!Opcode::HubReset.is_reserved());
    }

    #[test]
    fn test_response_length_is_explicit() {
        let frame = ResponseFrame::encode(RETURN_MARKER, 0, &[1, 2, 3], 4).unwrap();
        assert_eq!(frame.as_bytes(), &[RETURN_MARKER, 0, 1, 2]);

        let padded = ResponseFrame::encode(RETURN_MARKER, 0, &[], 5).unwrap();
        assert_eq!(padded.as_bytes(), &[RETURN_MARKER, 0, 0, 0, 0]);

        assert_eq!(
            ResponseFrame::encode(RETURN_MARKER, 0, &[], 9),
            Err(FrameError::ResponseLength(9))
        );
    }

    #[test]
    fn test_word_response() {
        let frame = ResponseFrame::word(0x1234);
        assert_eq!(frame.as_bytes(), &[RETURN_MARKER, NO_FAULT, 0x12, 0x34]);
        assert_eq!(frame.word_value(), Some(0x1234));
    }

    #[test]
    fn test_codes_response_fits_budget() {
        assert_eq!(ResponseFrame::codes(&[]).as_bytes(), &[RETURN_MARKER, NO_FAULT]);
        let many = [0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57];
        assert_eq!(ResponseFrame::codes(&many).as_bytes().len(), RESPONSE_FRAME_SIZE);
    }

    #[test]
    fn test_error_transfer_layout() {
        let faults = [
            FaultCode::device(FaultCategory::Verification, DeviceId::Temp2),
            FaultCode::link_test(),
        ];
        let frame = ErrorTransferFrame::encode(&faults);
        assert_eq!(frame.as_bytes(), &[73, 2, faults[0].narrow(), faults[1].narrow()]);
        assert_eq!(ErrorTransferFrame::parse(frame.as_bytes()).unwrap(), frame);
    }
}
