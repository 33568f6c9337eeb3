//! MBAP framing for Modbus TCP.

use crate::errors::FrameErrorKind;

use super::frame::Frame;

/// MBAP header: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal MBAP `length` field: unit + function + 252 payload bytes.
pub const MAX_MBAP_LENGTH: usize = 254;

/// Parsed MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    /// Bytes still to read after the header: function code + payload.
    pub fn remaining(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// Encodes a full MBAP frame.
///
/// `txn_hi ‖ txn_lo ‖ 00 00 ‖ len_hi ‖ len_lo ‖ unit ‖ function ‖ payload`
/// with `len = 2 + |payload|` (unit and function bytes included).
pub fn encode(transaction_id: u16, unit_id: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let length = (2 + payload.len()) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + payload.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.push(function);
    frame.extend_from_slice(payload);
    frame
}

/// Permissive decode of a complete MBAP frame as captured off the socket.
///
/// Short reads (socket closed or silent mid-frame) come back as `truncated`
/// frames with whatever bytes were collected; a `length` field beyond the
/// protocol maximum is flagged `oversize`. TCP has no checksum, so
/// `crc_valid` is true on any structurally complete frame.
pub fn decode(buf: &[u8]) -> Frame {
    if buf.len() < MBAP_HEADER_LEN + 1 {
        return Frame::malformed(FrameErrorKind::Truncated, buf.to_vec());
    }

    let header = MbapHeader::parse(buf[..MBAP_HEADER_LEN].try_into().expect("checked above"));

    if header.length as usize > MAX_MBAP_LENGTH {
        return Frame::malformed(FrameErrorKind::Oversize, buf.to_vec());
    }
    if buf.len() < MBAP_HEADER_LEN + header.remaining() {
        let mut frame = Frame::malformed(FrameErrorKind::Truncated, buf.to_vec());
        frame.transaction_id = Some(header.transaction_id);
        frame.unit_id = header.unit_id;
        frame.function = buf.get(MBAP_HEADER_LEN).copied().unwrap_or(0);
        return frame;
    }

    let end = MBAP_HEADER_LEN + header.remaining();
    Frame {
        transaction_id: Some(header.transaction_id),
        unit_id: header.unit_id,
        function: buf[MBAP_HEADER_LEN],
        payload: buf[MBAP_HEADER_LEN + 1..end].to_vec(),
        crc_valid: true,
        valid: true,
        invalid_reason: None,
        raw: buf[..end].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(0x0102, 0x11, 0x03, &[0x00, 0x64, 0x00, 0x01]);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x64, 0x00, 0x01]
        );
    }

    #[test]
    fn test_round_trip() {
        let encoded = encode(7, 1, 0x03, &[0x02, 0x41, 0x20]);
        let frame = decode(&encoded);
        assert!(frame.valid);
        assert!(frame.crc_valid);
        assert_eq!(frame.transaction_id, Some(7));
        assert_eq!(frame.unit_id, 1);
        assert_eq!(frame.function, 0x03);
        assert_eq!(frame.payload, vec![0x02, 0x41, 0x20]);
    }

    #[test]
    fn test_truncated_body() {
        let mut encoded = encode(7, 1, 0x03, &[0x02, 0x41, 0x20]);
        encoded.truncate(9);
        let frame = decode(&encoded);
        assert!(!frame.valid);
        assert_eq!(frame.invalid_reason, Some(FrameErrorKind::Truncated));
        assert_eq!(frame.transaction_id, Some(7));
        assert_eq!(frame.raw, encoded);
    }

    #[test]
    fn test_oversize_length_field() {
        let mut encoded = encode(7, 1, 0x03, &[0x00; 4]);
        encoded[4] = 0xFF;
        encoded[5] = 0xFF;
        let frame = decode(&encoded);
        assert!(!frame.valid);
        assert_eq!(frame.invalid_reason, Some(FrameErrorKind::Oversize));
    }

    #[test]
    fn test_header_parse() {
        let header = MbapHeader::parse(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x11]);
        assert_eq!(header.transaction_id, 42);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 0x11);
        assert_eq!(header.remaining(), 5);
    }
}
