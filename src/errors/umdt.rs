use std::time::Duration;

use thiserror::Error;

use crate::codec::ExceptionCode;

use super::{ConfigError, ConnectionError, FrameError, ScriptError, TransportError};

/// Top-level error of the UMDT core.
///
/// Every failure a front-end can observe maps onto one of these variants;
/// the discriminants are stable and `exit_code` gives the CLI mapping.
#[derive(Error, Debug)]
pub enum UmdtError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeout after {after:?}")]
    Timeout { after: Duration },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Cancelled")]
    Cancelled,
}

impl UmdtError {
    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::InvalidArgument(details.into())
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Process exit code for the CLI surfaces.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::Config(_) => 2,
            Self::Transport(_) | Self::Connection(_) => 3,
            Self::Exception(_) => 4,
            Self::Timeout { .. } => 5,
            Self::Frame(_) | Self::Script(_) | Self::Cancelled => 1,
        }
    }
}
