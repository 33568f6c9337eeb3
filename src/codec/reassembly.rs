//! Heuristic RTU reassembly for passive listening.
//!
//! A raw RS-485 tap sees both directions of the bus interleaved, with no
//! addressing help and no reliable silence gaps once the capture buffers in
//! the OS. The scanner slides over the byte stream, predicts candidate frame
//! lengths from the function-code table, and accepts a frame only when its
//! trailing CRC checks out; otherwise the start position advances by one.

use crate::errors::FrameErrorKind;

use super::crc::crc16;
use super::frame::Frame;
use super::function::{FunctionCode, EXCEPTION_FLAG};
use super::rtu;

/// Incremental sliding-window frame scanner.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered without a confirmed frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feeds captured bytes and returns every frame confirmed so far.
    ///
    /// Skipped garbage between confirmed frames is emitted as invalid
    /// frames so nothing disappears from the capture.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some((start, len)) = self.scan() {
            if start > 0 {
                frames.push(Frame::malformed(
                    FrameErrorKind::Truncated,
                    self.buf[..start].to_vec(),
                ));
            }
            frames.push(rtu::decode(&self.buf[start..start + len]));
            self.buf.drain(..start + len);
        }

        // Nothing beyond the maximum frame size can still become valid.
        while self.buf.len() > rtu::MAX_RTU_FRAME {
            let tail = self.buf.split_off(rtu::MAX_RTU_FRAME);
            let head = std::mem::replace(&mut self.buf, tail);
            frames.push(Frame::malformed(FrameErrorKind::Oversize, head));
        }

        frames
    }

    /// Declares a frame boundary (inter-byte gap observed): whatever is
    /// buffered is decoded permissively and the buffer reset.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.buf.is_empty() {
            return None;
        }
        let buf = std::mem::take(&mut self.buf);
        Some(rtu::decode(&buf))
    }

    fn scan(&self) -> Option<(usize, usize)> {
        for start in 0..self.buf.len().saturating_sub(3) {
            let window = &self.buf[start..];
            for len in candidate_lengths(window) {
                if len < 4 || len > window.len() {
                    continue;
                }
                let calculated = crc16(&window[..len - 2]);
                let received = u16::from_le_bytes([window[len - 2], window[len - 1]]);
                if calculated == received {
                    return Some((start, len));
                }
            }
        }
        None
    }
}

/// Candidate frame lengths (CRC included) for a window starting at a
/// presumed unit-id byte.
fn candidate_lengths(window: &[u8]) -> Vec<usize> {
    let mut candidates = Vec::with_capacity(4);
    let function = match window.get(1) {
        Some(&f) => f,
        None => return candidates,
    };

    if function & EXCEPTION_FLAG != 0 {
        // unit + function + exception code + crc
        candidates.push(5);
        return candidates;
    }

    let code = FunctionCode::new(function);
    match code {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            // Request is fixed; response length comes from the byte count.
            candidates.push(8);
            if let Some(&count) = window.get(2) {
                candidates.push(3 + count as usize + 2);
            }
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            // Request and echo response share the same shape.
            candidates.push(8);
        }
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            candidates.push(8);
            if let Some(&count) = window.get(6) {
                candidates.push(7 + count as usize + 2);
            }
        }
        FunctionCode::ReadWriteMultipleRegisters => {
            if let Some(&count) = window.get(9) {
                candidates.push(10 + count as usize + 2);
            }
            if let Some(&count) = window.get(2) {
                candidates.push(3 + count as usize + 2);
            }
        }
        _ => {}
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}
