use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::codec::{Framing, MbapHeader, MBAP_HEADER_LEN};
use crate::errors::{IoOperation, TransportError};
use crate::events::{EventBus, EventKind};

use super::{TcpEndpoint, Transport, TransportOptions};

/// How a bounded read ended.
enum ReadEnd {
    Complete,
    TimedOut,
    Closed,
}

/// Modbus TCP client transport.
pub struct TcpTransport {
    endpoint: TcpEndpoint,
    options: TransportOptions,
    events: EventBus,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(endpoint: TcpEndpoint, options: TransportOptions, events: EventBus) -> Self {
        Self {
            endpoint,
            options,
            events,
            stream: None,
        }
    }

    /// Reads until `buf` holds `want` bytes, the deadline passes, or the
    /// peer closes. Partial data stays in `buf` either way.
    async fn read_until(
        stream: &mut TcpStream,
        buf: &mut Vec<u8>,
        want: usize,
        deadline: Instant,
    ) -> Result<ReadEnd, TransportError> {
        let mut chunk = [0u8; 260];
        while buf.len() < want {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadEnd::TimedOut);
            }
            let take = (want - buf.len()).min(chunk.len());
            let slice = &mut chunk[..take];
            match timeout(remaining, stream.read(slice)).await {
                Err(_) => return Ok(ReadEnd::TimedOut),
                Ok(Ok(0)) => return Ok(ReadEnd::Closed),
                Ok(Ok(n)) => buf.extend_from_slice(&slice[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(ReadEnd::Complete)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = self.endpoint.address();
        let stream = timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::timeout(self.options.connect_timeout))??;

        stream.set_nodelay(true).map_err(|e| {
            TransportError::io(IoOperation::Configure, "Failed to set TCP_NODELAY", e)
        })?;

        debug!("Connected to {}", addr);
        self.events.publish(EventKind::Connection {
            peer: addr,
            connected: true,
        });
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            self.events.publish(EventKind::Connection {
                peer: self.endpoint.address(),
                connected: false,
            });
        }
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(MBAP_HEADER_LEN + 8);

        // MBAP header first, then exactly the advertised body.
        match Self::read_until(stream, &mut buf, MBAP_HEADER_LEN, deadline).await? {
            ReadEnd::Complete => {}
            ReadEnd::TimedOut if buf.is_empty() => {
                return Err(TransportError::timeout(timeout));
            }
            ReadEnd::Closed if buf.is_empty() => {
                self.stream = None;
                self.events.publish(EventKind::Connection {
                    peer: self.endpoint.address(),
                    connected: false,
                });
                return Err(TransportError::Closed);
            }
            // Partial header: hand it up for a `truncated` capture.
            _ => return Ok(buf),
        }

        let header = MbapHeader::parse(buf[..MBAP_HEADER_LEN].try_into().expect("header read"));
        let want = MBAP_HEADER_LEN + header.remaining();
        match Self::read_until(stream, &mut buf, want, deadline).await? {
            ReadEnd::Complete | ReadEnd::TimedOut => {}
            ReadEnd::Closed => self.stream = None,
        }
        Ok(buf)
    }

    fn framing(&self) -> Framing {
        Framing::Tcp
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use tokio::net::TcpListener;

    async fn serve_one(respond_with: Vec<u8>) -> TcpEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 260];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&respond_with).await.unwrap();
            // Keep the socket alive long enough for the client to read.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        TcpEndpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_complete_frame_round_trip() {
        let response = codec::tcp::encode(1, 1, 0x03, &[0x02, 0x41, 0x20]);
        let endpoint = serve_one(response.clone()).await;

        let mut transport =
            TcpTransport::new(endpoint, TransportOptions::default(), EventBus::default());
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let request = codec::tcp::encode(1, 1, 0x03, &[0x00, 0x64, 0x00, 0x01]);
        transport.send(&request).await.unwrap();

        let frame = transport
            .receive_frame(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(frame, response);

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_partial_frame_returned_truncated() {
        // Server advertises 6 body bytes but sends only 2.
        let mut response = codec::tcp::encode(1, 1, 0x03, &[0x02, 0x41, 0x20]);
        response.truncate(9);
        let endpoint = serve_one(response.clone()).await;

        let mut transport =
            TcpTransport::new(endpoint, TransportOptions::default(), EventBus::default());
        transport.open().await.unwrap();
        transport
            .send(&codec::tcp::encode(1, 1, 0x03, &[0x00, 0x64, 0x00, 0x01]))
            .await
            .unwrap();

        let bytes = transport
            .receive_frame(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(bytes, response);

        let frame = codec::tcp::decode(&bytes);
        assert!(!frame.valid);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = TcpEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport =
            TcpTransport::new(endpoint, TransportOptions::default(), EventBus::default());
        transport.open().await.unwrap();

        let err = transport
            .receive_frame(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening.
        let endpoint = TcpEndpoint::new("127.0.0.1", 1);
        let mut transport =
            TcpTransport::new(endpoint, TransportOptions::fast_fail(), EventBus::default());
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_send_when_closed() {
        let endpoint = TcpEndpoint::new("127.0.0.1", 1);
        let mut transport =
            TcpTransport::new(endpoint, TransportOptions::default(), EventBus::default());
        let err = transport.send(&[0x00]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
