use std::time::Duration;

use async_trait::async_trait;

use crate::codec::Framing;
use crate::errors::TransportError;

use super::Transport;

/// Read-only decorator for sniffer mode.
///
/// Guarantees electrical passivity: `send` always fails, everything else
/// passes through to the wrapped transport.
pub struct PassiveTransport {
    inner: Box<dyn Transport>,
}

impl PassiveTransport {
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Transport for PassiveTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn send(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::SendForbidden)
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.inner.receive_frame(timeout).await
    }

    fn framing(&self) -> Framing {
        self.inner.framing()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn describe(&self) -> String {
        format!("passive {}", self.inner.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::transport::{TcpEndpoint, TcpTransport, TransportOptions};

    #[tokio::test]
    async fn test_send_is_forbidden() {
        let inner = TcpTransport::new(
            TcpEndpoint::new("127.0.0.1", 1),
            TransportOptions::default(),
            EventBus::default(),
        );
        let mut passive = PassiveTransport::new(Box::new(inner));

        assert!(matches!(
            passive.send(&[0x01, 0x03]).await.unwrap_err(),
            TransportError::SendForbidden
        ));
        assert_eq!(passive.framing(), Framing::Tcp);
        assert!(passive.describe().starts_with("passive"));
    }
}
