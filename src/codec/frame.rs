use std::fmt;

use crate::errors::{FrameError, FrameErrorKind};

use super::function::{FunctionCode, EXCEPTION_FLAG};

/// Framing in use on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Rtu,
    Tcp,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtu => write!(f, "rtu"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x07 => Some(Self::NegativeAcknowledge),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::ServerDeviceFailure => "Server device failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server device busy",
            Self::NegativeAcknowledge => "Negative acknowledge",
            Self::MemoryParityError => "Memory parity error",
            Self::GatewayPathUnavailable => "Gateway path unavailable",
            Self::GatewayTargetFailed => "Gateway target device failed to respond",
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        code as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} ({})", *self as u8, self.description())
    }
}

/// A decoded frame, valid or not.
///
/// Malformed traffic is retained rather than discarded: the raw bytes stay
/// attached and `invalid_reason` names what went wrong, so diagnostic
/// surfaces can show exactly what was on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// MBAP transaction id; `None` on RTU.
    pub transaction_id: Option<u16>,
    pub unit_id: u8,
    pub function: u8,
    /// PDU payload after the function byte, CRC excluded.
    pub payload: Vec<u8>,
    /// Always true for TCP; computed for RTU.
    pub crc_valid: bool,
    pub valid: bool,
    pub invalid_reason: Option<FrameErrorKind>,
    /// Bytes exactly as captured on the wire.
    pub raw: Vec<u8>,
}

impl Frame {
    pub(crate) fn malformed(reason: FrameErrorKind, raw: Vec<u8>) -> Self {
        let unit_id = raw.first().copied().unwrap_or(0);
        let function = raw.get(1).copied().unwrap_or(0);
        Self {
            transaction_id: None,
            unit_id,
            function,
            payload: if raw.len() > 2 {
                raw[2..].to_vec()
            } else {
                Vec::new()
            },
            crc_valid: false,
            valid: false,
            invalid_reason: Some(reason),
            raw,
        }
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    pub fn function_code(&self) -> FunctionCode {
        FunctionCode::new(self.function)
    }

    /// Turns an invalid frame into the matching [`FrameError`], carrying
    /// the captured bytes. `None` for valid frames.
    pub fn to_error(&self) -> Option<FrameError> {
        match self.invalid_reason? {
            FrameErrorKind::Crc => {
                let body = &self.raw[..self.raw.len().saturating_sub(2)];
                let received = match self.raw.len() {
                    n if n >= 2 => u16::from_le_bytes([self.raw[n - 2], self.raw[n - 1]]),
                    _ => 0,
                };
                Some(FrameError::Crc {
                    calculated: super::crc::crc16(body),
                    received,
                    frame_data: self.raw.clone(),
                })
            }
            FrameErrorKind::Truncated => Some(FrameError::truncated(
                "frame boundary before a complete frame",
                self.raw.clone(),
            )),
            FrameErrorKind::Oversize => Some(FrameError::oversize(
                "frame exceeds the protocol maximum",
                self.raw.clone(),
            )),
            FrameErrorKind::UnknownFunction => Some(FrameError::UnknownFunction {
                function: self.function,
                frame_data: self.raw.clone(),
            }),
        }
    }
}

/// Packs coil/discrete states LSB-first into response/request data bytes.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// A parsed Modbus request.
///
/// `address`/`quantity` are the first two big-endian words of the payload
/// when the function code carries addressing; for the single-write codes the
/// `quantity` word is the written value. `tail` is everything after those
/// four bytes (byte count and data for the multi-write codes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
    pub tail: Vec<u8>,
    /// Raw PDU payload as received, for codes without addressing.
    pub payload: Vec<u8>,
}

impl Request {
    /// Builds a read request for `quantity` entries at `address`.
    pub fn read(unit_id: u8, function: FunctionCode, address: u16, quantity: u16) -> Self {
        Self {
            unit_id,
            function: function.value(),
            address,
            quantity,
            tail: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Parses a request PDU. Never fails: codes without addressing keep the
    /// payload opaque and report address/quantity as zero.
    pub fn parse(unit_id: u8, function: u8, payload: &[u8]) -> Self {
        let code = FunctionCode::new(function);
        if code.has_addressing() && payload.len() >= 4 {
            Self {
                unit_id,
                function,
                address: u16::from_be_bytes([payload[0], payload[1]]),
                quantity: u16::from_be_bytes([payload[2], payload[3]]),
                tail: payload[4..].to_vec(),
                payload: payload.to_vec(),
            }
        } else {
            Self {
                unit_id,
                function,
                address: 0,
                quantity: 0,
                tail: Vec::new(),
                payload: payload.to_vec(),
            }
        }
    }

    pub fn from_frame(frame: &Frame) -> Self {
        Self::parse(frame.unit_id, frame.function, &frame.payload)
    }

    pub fn function_code(&self) -> FunctionCode {
        FunctionCode::new(self.function)
    }

    /// Re-encodes the PDU payload, reflecting any field mutations made by
    /// hooks (address remapping and the like).
    pub fn encode_payload(&self) -> Vec<u8> {
        if self.function_code().has_addressing() {
            let mut out = Vec::with_capacity(4 + self.tail.len());
            out.extend_from_slice(&self.address.to_be_bytes());
            out.extend_from_slice(&self.quantity.to_be_bytes());
            out.extend_from_slice(&self.tail);
            out
        } else {
            self.payload.clone()
        }
    }
}

/// A parsed Modbus response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    /// Function code with the exception flag stripped.
    pub function: u8,
    pub payload: Vec<u8>,
    pub is_exception: bool,
    pub exception_code: Option<ExceptionCode>,
}

impl Response {
    pub fn new(unit_id: u8, function: u8, payload: Vec<u8>) -> Self {
        Self {
            unit_id,
            function: function & !EXCEPTION_FLAG,
            payload,
            is_exception: false,
            exception_code: None,
        }
    }

    /// Builds the exception response matching `function`.
    pub fn exception(unit_id: u8, function: u8, code: ExceptionCode) -> Self {
        Self {
            unit_id,
            function: function & !EXCEPTION_FLAG,
            payload: vec![code as u8],
            is_exception: true,
            exception_code: Some(code),
        }
    }

    /// Builds the exception response matching `request`.
    pub fn exception_for(request: &Request, code: ExceptionCode) -> Self {
        Self::exception(request.unit_id, request.function, code)
    }

    pub fn from_frame(frame: &Frame) -> Self {
        if frame.is_exception() {
            let code = frame
                .payload
                .first()
                .and_then(|&c| ExceptionCode::from_u8(c))
                .unwrap_or(ExceptionCode::ServerDeviceFailure);
            Self::exception(frame.unit_id, frame.function, code)
        } else {
            Self::new(frame.unit_id, frame.function, frame.payload.clone())
        }
    }

    /// Function byte as it appears on the wire.
    pub fn wire_function(&self) -> u8 {
        if self.is_exception {
            self.function | EXCEPTION_FLAG
        } else {
            self.function
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parse_and_reencode() {
        let payload = [0xA0, 0x28, 0x00, 0x01]; // address 41000, quantity 1
        let req = Request::parse(1, 0x03, &payload);
        assert_eq!(req.address, 41000);
        assert_eq!(req.quantity, 1);
        assert_eq!(req.encode_payload(), payload);
    }

    #[test]
    fn test_request_address_remap() {
        let mut req = Request::parse(1, 0x03, &[0xA0, 0x28, 0x00, 0x01]);
        req.address -= 1000;
        assert_eq!(req.encode_payload(), vec![0x9C, 0x40, 0x00, 0x01]);
    }

    #[test]
    fn test_multi_write_tail_preserved() {
        // FC16, address 10, 2 registers, 4 data bytes
        let payload = [0x00, 0x0A, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78];
        let req = Request::parse(1, 0x10, &payload);
        assert_eq!(req.address, 10);
        assert_eq!(req.quantity, 2);
        assert_eq!(req.tail, vec![0x04, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(req.encode_payload(), payload);
    }

    #[test]
    fn test_pack_bits_lsb_first() {
        assert_eq!(pack_bits(&[true, false, true]), vec![0b101]);
        let mut bits = vec![false; 10];
        bits[0] = true;
        bits[9] = true;
        assert_eq!(pack_bits(&bits), vec![0x01, 0x02]);
    }

    #[test]
    fn test_exception_response() {
        let req = Request::parse(7, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        let resp = Response::exception_for(&req, ExceptionCode::IllegalDataAddress);
        assert!(resp.is_exception);
        assert_eq!(resp.wire_function(), 0x83);
        assert_eq!(resp.payload, vec![0x02]);
    }

    #[test]
    fn test_response_from_exception_frame() {
        let frame = Frame {
            transaction_id: None,
            unit_id: 1,
            function: 0x83,
            payload: vec![0x02],
            crc_valid: true,
            valid: true,
            invalid_reason: None,
            raw: vec![],
        };
        let resp = Response::from_frame(&frame);
        assert!(resp.is_exception);
        assert_eq!(resp.exception_code, Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(resp.function, 0x03);
    }
}
