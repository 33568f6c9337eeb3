use std::time::Duration;

use thiserror::Error;

use super::{IoOperation, SerialErrorKind};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port error: {kind} on {port} - {details}")]
    Serial {
        kind: SerialErrorKind,
        port: String,
        details: String,
        #[source]
        source: Option<serialport::Error>,
    },

    #[error("I/O error: {operation} failed - {details}")]
    Io {
        operation: IoOperation,
        details: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No frame within {limit:?}")]
    Timeout { limit: Duration },

    #[error("Transport is not open")]
    NotConnected,

    #[error("Transport closed by peer")]
    Closed,

    #[error("Send forbidden on passive transport")]
    SendForbidden,
}

impl TransportError {
    pub fn io(operation: IoOperation, details: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            details: details.into(),
            source,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout { limit }
    }

    /// Whether the underlying channel is gone and a reconnect is required.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::NotConnected | Self::Io { .. })
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => TransportError::Serial {
                kind: SerialErrorKind::OpenFailed,
                port: err.to_string(),
                details: "Device not found".into(),
                source: Some(err),
            },
            serialport::ErrorKind::InvalidInput => TransportError::Serial {
                kind: SerialErrorKind::ConfigurationFailed,
                port: err.to_string(),
                details: "Invalid configuration".into(),
                source: Some(err),
            },
            serialport::ErrorKind::Io(io_err) => TransportError::Io {
                operation: match io_err {
                    std::io::ErrorKind::TimedOut => IoOperation::Read,
                    std::io::ErrorKind::WriteZero => IoOperation::Write,
                    _ => IoOperation::Configure,
                },
                details: io_err.to_string(),
                source: std::io::Error::new(io_err, err.description),
            },
            _ => TransportError::Serial {
                kind: SerialErrorKind::OpenFailed,
                port: err.to_string(),
                details: err.to_string(),
                source: Some(err),
            },
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
            kind => TransportError::Io {
                operation: match kind {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                        IoOperation::Read
                    }
                    std::io::ErrorKind::WriteZero => IoOperation::Write,
                    std::io::ErrorKind::ConnectionRefused => IoOperation::Connect,
                    _ => IoOperation::Configure,
                },
                details: err.to_string(),
                source: err,
            },
        }
    }
}
