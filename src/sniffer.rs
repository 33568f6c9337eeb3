//! Passive bus listening.
//!
//! Wraps a transport in the read-only decorator and turns whatever appears
//! on the wire into decoded frames: MBAP streams decode deterministically,
//! raw RTU taps go through the sliding-window reassembler. Every frame —
//! valid or not — is published on the event bus and optionally captured.

use std::time::Duration;

use tracing::debug;

use crate::codec::{self, Frame, FrameScanner, Framing};
use crate::errors::{TransportError, UmdtError};
use crate::events::{EventBus, EventKind};
use crate::pcap::{Direction, PcapWriter, ProtocolHint};
use crate::transport::{PassiveTransport, Transport};

/// A passive tap on a Modbus link.
pub struct Sniffer {
    transport: PassiveTransport,
    scanner: FrameScanner,
    events: EventBus,
    pcap: Option<PcapWriter>,
}

impl Sniffer {
    /// Takes ownership of `transport`, forcing it read-only.
    pub fn new(transport: Box<dyn Transport>, events: EventBus, pcap: Option<PcapWriter>) -> Self {
        Self {
            transport: PassiveTransport::new(transport),
            scanner: FrameScanner::new(),
            events,
            pcap,
        }
    }

    fn hint(&self) -> ProtocolHint {
        match self.transport.framing() {
            Framing::Rtu => ProtocolHint::ModbusRtu,
            Framing::Tcp => ProtocolHint::ModbusTcp,
        }
    }

    /// Waits up to `timeout` for traffic and returns the frames recovered
    /// from it. An empty result just means a quiet wire.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<Frame>, UmdtError> {
        let bytes = match self.transport.receive_frame(timeout).await {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout { .. }) => {
                // Silence: close out anything the scanner still holds.
                return Ok(self.scanner.flush().into_iter().collect());
            }
            Err(e) => return Err(e.into()),
        };

        let frames = match self.transport.framing() {
            Framing::Tcp => vec![codec::tcp::decode(&bytes)],
            Framing::Rtu => {
                // The transport already delimits by silence, but a shared
                // RS-485 tap can still glue both directions together; the
                // scanner splits them back apart.
                let mut frames = self.scanner.push(&bytes);
                frames.extend(self.scanner.flush());
                frames
            }
        };

        for frame in &frames {
            debug!(
                "Sniffed frame: unit={} function={:#04X} valid={}",
                frame.unit_id, frame.function, frame.valid
            );
            if let Some(pcap) = &self.pcap {
                if let Err(e) = pcap
                    .append(Direction::Unknown, self.hint(), &frame.raw)
                    .await
                {
                    tracing::warn!("Sniffer capture write failed: {}", e);
                }
            }
            self.publish(frame);
        }

        Ok(frames)
    }

    fn publish(&self, frame: &Frame) {
        if !frame.valid {
            if let Some(error) = frame.to_error() {
                self.events.publish(EventKind::Error {
                    message: error.to_string(),
                    raw: Some(frame.raw.clone()),
                });
            }
            return;
        }
        if frame.is_exception() || looks_like_response(frame) {
            let response = codec::Response::from_frame(frame);
            self.events.publish(EventKind::Response {
                unit_id: response.unit_id,
                function: response.function,
                is_exception: response.is_exception,
                exception_code: response.exception_code,
                raw: frame.raw.clone(),
            });
        } else {
            self.events.publish(EventKind::Request {
                unit_id: frame.unit_id,
                function: frame.function,
                raw: frame.raw.clone(),
            });
        }
    }
}

/// Read responses carry a byte count that requests never have; without
/// pairing state this heuristic is the best a passive tap can do.
fn looks_like_response(frame: &Frame) -> bool {
    match frame.function {
        0x01..=0x04 => frame
            .payload
            .first()
            .is_some_and(|&count| frame.payload.len() == 1 + count as usize),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::ScriptedTransport;

    #[tokio::test]
    async fn test_rtu_tap_splits_glued_traffic() {
        let mut transport = ScriptedTransport::new(Framing::Rtu);
        // Request and response captured as one chunk.
        let mut glued = codec::rtu::encode(1, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        glued.extend(codec::rtu::encode(1, 0x03, &[0x02, 0x41, 0x20]));
        transport.push_reply(Ok(glued));

        let bus = EventBus::default();
        let mut sniffer = Sniffer::new(Box::new(transport), bus.clone(), None);
        let mut sub = bus.subscribe();

        let frames = sniffer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.valid));

        match sub.recv().await.unwrap().kind {
            EventKind::Request { function, .. } => assert_eq!(function, 0x03),
            other => panic!("unexpected event: {:?}", other),
        }
        match sub.recv().await.unwrap().kind {
            EventKind::Response { function, .. } => assert_eq!(function, 0x03),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupt_traffic_surfaces_as_error_events() {
        let mut transport = ScriptedTransport::new(Framing::Rtu);
        let mut corrupt = codec::rtu::encode(1, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        corrupt[2] ^= 0xFF;
        transport.push_reply(Ok(corrupt.clone()));

        let bus = EventBus::default();
        let mut sniffer = Sniffer::new(Box::new(transport), bus.clone(), None);
        let mut sub = bus.subscribe();

        let frames = sniffer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].valid);

        match sub.recv().await.unwrap().kind {
            EventKind::Error { raw, .. } => assert_eq!(raw.unwrap(), corrupt),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quiet_wire_yields_nothing() {
        let transport = ScriptedTransport::new(Framing::Rtu);
        let mut sniffer = Sniffer::new(Box::new(transport), EventBus::default(), None);
        let frames = sniffer.poll(Duration::from_millis(10)).await.unwrap();
        assert!(frames.is_empty());
    }
}
