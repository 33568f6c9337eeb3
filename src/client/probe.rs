//! Combinatorial endpoint probing.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::codec::{self, Framing, RegisterKind, Request};
use crate::events::EventBus;
use crate::transport::{self, Endpoint, TransportOptions};

/// The probe search space: every endpoint is tried with every unit id.
#[derive(Debug, Clone)]
pub struct ProbeParams {
    pub endpoints: Vec<Endpoint>,
    pub unit_ids: Vec<u8>,
    pub kind: RegisterKind,
    pub target_register: u16,
    /// Fast-fail bound per combination.
    pub timeout: Duration,
    /// Concurrent endpoints in flight.
    pub fanout: usize,
}

impl ProbeParams {
    pub fn new(endpoints: Vec<Endpoint>, unit_ids: Vec<u8>) -> Self {
        Self {
            endpoints,
            unit_ids,
            kind: RegisterKind::Holding,
            target_register: 0,
            timeout: Duration::from_millis(100),
            fanout: 16,
        }
    }
}

/// A combination that answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub endpoint: Endpoint,
    pub unit_id: u8,
}

/// Sweeps the Cartesian product and returns the live combinations.
///
/// A combination is alive iff a structurally valid Modbus reply — data or
/// exception — arrives within the fast-fail timeout. Connection failures,
/// timeouts and frame garbage all count as dead. Endpoints run concurrently
/// up to `fanout`; unit ids within one endpoint share its transport and are
/// tried in sequence, which keeps serial buses single-master.
pub async fn probe(params: &ProbeParams, events: &EventBus) -> Vec<ProbeTarget> {
    let options = TransportOptions {
        connect_timeout: params.timeout,
        request_timeout: params.timeout,
    };

    stream::iter(params.endpoints.clone())
        .map(|endpoint| {
            let events = events.clone();
            async move { probe_endpoint(endpoint, params, options, events).await }
        })
        .buffer_unordered(params.fanout.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
}

async fn probe_endpoint(
    endpoint: Endpoint,
    params: &ProbeParams,
    options: TransportOptions,
    events: EventBus,
) -> Vec<ProbeTarget> {
    let mut transport = match transport::connect(&endpoint, options, events).await {
        Ok(transport) => transport,
        Err(e) => {
            debug!("Probe: {} unreachable: {}", endpoint, e);
            return Vec::new();
        }
    };

    let mut alive = Vec::new();
    for &unit_id in &params.unit_ids {
        let request = Request::read(
            unit_id,
            params.kind.read_function(),
            params.target_register,
            1,
        );
        let payload = request.encode_payload();
        let raw = match transport.framing() {
            Framing::Rtu => codec::rtu::encode(unit_id, request.function, &payload),
            Framing::Tcp => codec::tcp::encode(unit_id as u16, unit_id, request.function, &payload),
        };

        if transport.send(&raw).await.is_err() {
            continue;
        }

        let is_alive = match transport.receive_frame(params.timeout).await {
            Ok(bytes) => {
                let frame = match transport.framing() {
                    Framing::Rtu => codec::rtu::decode(&bytes),
                    Framing::Tcp => codec::tcp::decode(&bytes),
                };
                // Exceptions prove a live endpoint just as well as data.
                frame.valid
            }
            Err(_) => false,
        };

        if is_alive {
            info!("Probe: {} unit {} is alive", endpoint, unit_id);
            alive.push(ProbeTarget {
                endpoint: endpoint.clone(),
                unit_id,
            });
        }
    }

    let _ = transport.close().await;
    alive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpEndpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal endpoint that always answers exception 0x02.
    async fn exception_server() -> TcpEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 260];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n < 8 {
                            break;
                        }
                        let txn = [buf[0], buf[1]];
                        let unit = buf[6];
                        let function = buf[7];
                        let reply = crate::codec::tcp::encode(
                            u16::from_be_bytes(txn),
                            unit,
                            function | 0x80,
                            &[0x02],
                        );
                        if socket.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        TcpEndpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_exception_counts_as_alive_closed_port_does_not() {
        let live = exception_server().await;
        let dead = TcpEndpoint::new("127.0.0.1", 1);

        let params = ProbeParams::new(
            vec![Endpoint::Tcp(live.clone()), Endpoint::Tcp(dead)],
            vec![1],
        );
        let alive = probe(&params, &EventBus::default()).await;

        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].endpoint, Endpoint::Tcp(live));
        assert_eq!(alive[0].unit_id, 1);
    }

    #[tokio::test]
    async fn test_unit_matrix_expansion() {
        let live = exception_server().await;
        let params = ProbeParams::new(vec![Endpoint::Tcp(live)], vec![1, 2, 3]);
        let alive = probe(&params, &EventBus::default()).await;
        assert_eq!(alive.len(), 3);
    }
}
