use thiserror::Error;

use super::FrameErrorKind;

/// A malformed frame, always captured along with its raw bytes.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("CRC error: calculated={calculated:04X}, received={received:04X}, frame={}", hex::encode(frame_data))]
    Crc {
        calculated: u16,
        received: u16,
        frame_data: Vec<u8>,
    },

    #[error("Truncated frame: {details} ({} bytes captured)", frame_data.len())]
    Truncated {
        details: String,
        frame_data: Vec<u8>,
    },

    #[error("Oversize frame: {details} ({} bytes captured)", frame_data.len())]
    Oversize {
        details: String,
        frame_data: Vec<u8>,
    },

    #[error("Unknown function code {function:#04X}, frame={}", hex::encode(frame_data))]
    UnknownFunction { function: u8, frame_data: Vec<u8> },
}

impl FrameError {
    pub fn truncated(details: impl Into<String>, frame_data: Vec<u8>) -> Self {
        Self::Truncated {
            details: details.into(),
            frame_data,
        }
    }

    pub fn oversize(details: impl Into<String>, frame_data: Vec<u8>) -> Self {
        Self::Oversize {
            details: details.into(),
            frame_data,
        }
    }

    pub fn kind(&self) -> FrameErrorKind {
        match self {
            Self::Crc { .. } => FrameErrorKind::Crc,
            Self::Truncated { .. } => FrameErrorKind::Truncated,
            Self::Oversize { .. } => FrameErrorKind::Oversize,
            Self::UnknownFunction { .. } => FrameErrorKind::UnknownFunction,
        }
    }

    /// Bytes exactly as captured, for diagnostic surfaces.
    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            Self::Crc { frame_data, .. }
            | Self::Truncated { frame_data, .. }
            | Self::Oversize { frame_data, .. }
            | Self::UnknownFunction { frame_data, .. } => frame_data,
        }
    }
}
