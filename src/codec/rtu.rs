//! RTU framing: CRC-terminated frames delimited by silence on the wire.

use crate::errors::FrameErrorKind;

use super::crc::crc16;
use super::frame::Frame;

/// Largest legal RTU frame: unit + function + 252 payload bytes + CRC.
pub const MAX_RTU_FRAME: usize = 256;

/// Encodes an RTU frame: `unit ‖ function ‖ payload ‖ crc_lo ‖ crc_hi`.
pub fn encode(unit_id: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(unit_id);
    frame.push(function);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Permissive decode of one RTU frame.
///
/// The buffer is whatever accumulated between two silence gaps; it is always
/// turned into a [`Frame`], flagged invalid on CRC mismatch, truncation or
/// oversize rather than dropped.
pub fn decode(buf: &[u8]) -> Frame {
    if buf.len() < 4 {
        return Frame::malformed(FrameErrorKind::Truncated, buf.to_vec());
    }
    if buf.len() > MAX_RTU_FRAME {
        return Frame::malformed(FrameErrorKind::Oversize, buf.to_vec());
    }

    let body = &buf[..buf.len() - 2];
    let calculated = crc16(body);
    let received = u16::from_le_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
    let crc_valid = calculated == received;

    Frame {
        transaction_id: None,
        unit_id: buf[0],
        function: buf[1],
        payload: body[2..].to_vec(),
        crc_valid,
        valid: crc_valid,
        invalid_reason: if crc_valid {
            None
        } else {
            Some(FrameErrorKind::Crc)
        },
        raw: buf.to_vec(),
    }
}
