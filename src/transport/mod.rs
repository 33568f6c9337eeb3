//! Byte transports: a uniform async channel over TCP or serial.
//!
//! Transports deal in raw frame bytes only; permissive decoding into
//! [`Frame`](crate::codec::Frame)s happens above them. A partial frame
//! followed by silence is returned as-is so the decoder can flag it
//! `truncated` instead of losing it.

mod endpoint;
mod passive;
mod serial;
mod tcp;

use std::time::Duration;

use async_trait::async_trait;

pub use endpoint::{Endpoint, SerialEndpoint, TcpEndpoint};
pub use passive::PassiveTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use crate::codec::Framing;
use crate::errors::TransportError;
use crate::events::EventBus;

/// Timeouts applied by a transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Bound on connection establishment.
    pub connect_timeout: Duration,
    /// Default bound on one request/response exchange.
    pub request_timeout: Duration,
}

impl TransportOptions {
    /// Aggressive settings for combinatorial probing, so one dead
    /// combination cannot stall the sweep.
    pub fn fast_fail() -> Self {
        Self {
            connect_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// A connected byte channel carrying Modbus frames.
///
/// Reconnection is the caller's concern: after `closed` or an error the
/// transport stays down until `open` is called again.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits up to `timeout` for one frame boundary and returns the raw
    /// bytes collected. Partial frames are returned, not discarded;
    /// `Timeout` is only raised when nothing at all arrived.
    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn framing(&self) -> Framing;

    fn is_open(&self) -> bool;

    fn describe(&self) -> String;
}

/// Opens a transport for `endpoint` and returns it connected.
pub async fn connect(
    endpoint: &Endpoint,
    options: TransportOptions,
    events: EventBus,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut transport: Box<dyn Transport> = match endpoint {
        Endpoint::Tcp(tcp) => Box::new(TcpTransport::new(tcp.clone(), options, events)),
        Endpoint::Serial(serial) => Box::new(SerialTransport::new(serial.clone(), options, events)),
    };
    transport.open().await?;
    Ok(transport)
}
