use std::io::Read;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::debug;

use crate::codec::Framing;
use crate::errors::{IoOperation, TransportError};
use crate::events::{EventBus, EventKind};

use super::{SerialEndpoint, Transport, TransportOptions};

/// Modbus RTU serial transport.
///
/// The port is opened blocking with its read timeout doubling as the
/// inter-byte gap detector: a read that times out after at least one byte
/// arrived marks the end of a frame. Individual reads return within the
/// gap interval, so the blocking calls stay short enough for the
/// cooperative scheduler.
pub struct SerialTransport {
    endpoint: SerialEndpoint,
    options: TransportOptions,
    events: EventBus,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(endpoint: SerialEndpoint, options: TransportOptions, events: EventBus) -> Self {
        Self {
            endpoint,
            options,
            events,
            port: None,
        }
    }

    /// Serial timeouts below 1 ms are unreliable across platforms.
    fn gap_timeout(&self) -> Duration {
        self.endpoint
            .effective_inter_byte_timeout()
            .max(Duration::from_millis(1))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let port = serialport::new(&self.endpoint.path, self.endpoint.baud_rate)
            .data_bits(self.endpoint.data_bits.into())
            .parity(self.endpoint.parity.into())
            .stop_bits(self.endpoint.stop_bits.into())
            .timeout(self.options.request_timeout)
            .open()?;

        debug!("Opened serial port {}", self.endpoint);
        self.events.publish(EventKind::Connection {
            peer: self.endpoint.path.clone(),
            connected: true,
        });
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            self.events.publish(EventKind::Connection {
                peer: self.endpoint.path.clone(),
                connected: false,
            });
        }
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(bytes)
            .map_err(|e| TransportError::io(IoOperation::Write, "serial write", e))?;
        port.flush()
            .map_err(|e| TransportError::io(IoOperation::Flush, "serial flush", e))?;
        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let gap = self.gap_timeout();
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let mut frame = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];

        // First byte may take the whole request timeout; after that, a gap
        // longer than 3.5 char times ends the frame.
        port.set_timeout(timeout)
            .map_err(|e| TransportError::from(e))?;

        loop {
            match port.read(&mut chunk) {
                Ok(0) => {
                    self.port = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() == n {
                        port.set_timeout(gap).map_err(TransportError::from)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if frame.is_empty() {
                        return Err(TransportError::timeout(timeout));
                    }
                    // Silence gap: frame boundary.
                    return Ok(frame);
                }
                Err(e) => {
                    return Err(TransportError::io(IoOperation::Read, "serial read", e));
                }
            }
        }
    }

    fn framing(&self) -> Framing {
        Framing::Rtu
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_open_port() {
        let endpoint = SerialEndpoint::new("/dev/null-umdt-test", 9600);
        let mut transport = SerialTransport::new(
            endpoint,
            TransportOptions::default(),
            EventBus::default(),
        );

        assert!(!transport.is_open());
        assert!(matches!(
            transport.send(&[0x01]).await.unwrap_err(),
            TransportError::NotConnected
        ));
        assert!(matches!(
            transport
                .receive_frame(Duration::from_millis(10))
                .await
                .unwrap_err(),
            TransportError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let endpoint = SerialEndpoint::new("/dev/umdt-no-such-port", 9600);
        let mut transport = SerialTransport::new(
            endpoint,
            TransportOptions::default(),
            EventBus::default(),
        );
        assert!(transport.open().await.is_err());
    }

    #[test]
    fn test_gap_timeout_floor() {
        let endpoint = SerialEndpoint::new("/dev/ttyUSB0", 115_200);
        let transport = SerialTransport::new(
            endpoint,
            TransportOptions::default(),
            EventBus::default(),
        );
        assert!(transport.gap_timeout() >= Duration::from_millis(1));
    }
}
