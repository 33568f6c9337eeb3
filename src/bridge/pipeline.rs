//! The per-request relay pipeline.

use tracing::{debug, warn};

use crate::bus::BusPriority;
use crate::codec::{self, ExceptionCode, Frame, Framing, Request, Response};
use crate::connection::BackoffStrategy;
use crate::errors::{TransportError, UmdtError};
use crate::events::{EventKind, FaultKind};
use crate::pcap::{Direction, ProtocolHint};
use crate::script::ChainOutcome;

use super::session::SessionState;
use super::Bridge;

fn hint(framing: Framing) -> ProtocolHint {
    match framing {
        Framing::Rtu => ProtocolHint::ModbusRtu,
        Framing::Tcp => ProtocolHint::ModbusTcp,
    }
}

impl Bridge {
    /// Relays one upstream frame through the hook pipeline and the
    /// downstream transport. Returns the encoded upstream reply, or `None`
    /// when nothing must be sent (invalid frame, hook drop, fault drop).
    pub(crate) async fn relay(&self, session: &mut SessionState, frame: Frame) -> Option<Vec<u8>> {
        let upstream_hint = hint(session.upstream_framing);
        self.pcap
            .record_upstream(Direction::Inbound, upstream_hint, &frame.raw)
            .await;

        if !frame.valid {
            if let Some(error) = frame.to_error() {
                self.events.publish(EventKind::Error {
                    message: format!("upstream {}: {}", session.peer, error),
                    raw: Some(frame.raw.clone()),
                });
            }
            return None;
        }

        self.events.publish(EventKind::Request {
            unit_id: frame.unit_id,
            function: frame.function,
            raw: frame.raw.clone(),
        });

        let upstream_txn = frame.transaction_id;
        let request = Request::from_frame(&frame);

        // Ingress, then egress; either may rewrite, answer or swallow.
        let request = match self.scripts.run_ingress(request).await {
            ChainOutcome::Continue(request) => request,
            ChainOutcome::Exception(code) => {
                let request = Request::from_frame(&frame);
                let response = Response::exception_for(&request, code);
                return self
                    .respond_upstream(session, upstream_txn, &request, response)
                    .await;
            }
            ChainOutcome::Drop => return None,
        };
        let request = match self.scripts.run_egress(request.clone()).await {
            ChainOutcome::Continue(request) => request,
            ChainOutcome::Exception(code) => {
                let response = Response::exception_for(&request, code);
                return self
                    .respond_upstream(session, upstream_txn, &request, response)
                    .await;
            }
            ChainOutcome::Drop => return None,
        };

        let response = self.exchange_downstream(session, upstream_txn, &request).await;

        // Supplemental fault profile on the relayed reply.
        let profile = self.faults.snapshot();
        if self.faults.roll_drop(&profile) {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::Drop,
            });
            return None;
        }
        if !profile.latency.is_zero() {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::Latency,
            });
            tokio::time::sleep(profile.latency).await;
        }
        let mut response = response;
        if self.faults.flip_bits(&profile, &mut response.payload) > 0 {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::BitFlip,
            });
        }

        // Downstream-facing observation, then the upstream-facing one.
        let response = match self.scripts.run_response(response).await {
            ChainOutcome::Continue(response) => response,
            ChainOutcome::Exception(code) => Response::exception_for(&request, code),
            ChainOutcome::Drop => return None,
        };

        self.respond_upstream(session, upstream_txn, &request, response)
            .await
    }

    /// Runs the upstream-response hook, encodes in the upstream framing
    /// with the master's own transaction id, and records the capture.
    async fn respond_upstream(
        &self,
        session: &mut SessionState,
        upstream_txn: Option<u16>,
        request: &Request,
        response: Response,
    ) -> Option<Vec<u8>> {
        let response = match self.scripts.run_upstream_response(response).await {
            ChainOutcome::Continue(response) => response,
            ChainOutcome::Exception(code) => Response::exception_for(request, code),
            ChainOutcome::Drop => return None,
        };

        let reply = match session.upstream_framing {
            Framing::Tcp => codec::tcp::encode(
                upstream_txn.unwrap_or(0),
                response.unit_id,
                response.wire_function(),
                &response.payload,
            ),
            Framing::Rtu => codec::rtu::encode(
                response.unit_id,
                response.wire_function(),
                &response.payload,
            ),
        };

        self.events.publish(EventKind::Response {
            unit_id: response.unit_id,
            function: response.function,
            is_exception: response.is_exception,
            exception_code: response.exception_code,
            raw: reply.clone(),
        });
        self.pcap
            .record_upstream(Direction::Outbound, hint(session.upstream_framing), &reply)
            .await;

        Some(reply)
    }

    /// One downstream exchange under the bus coordinator.
    ///
    /// Any way the downstream fails to produce a usable reply in time —
    /// timeout, transport loss, CRC garbage — collapses to gateway
    /// exception 0x0B, so the master is never left hanging.
    async fn exchange_downstream(
        &self,
        session: &mut SessionState,
        upstream_txn: Option<u16>,
        request: &Request,
    ) -> Response {
        let payload = request.encode_payload();
        let _guard = self.bus.acquire(BusPriority::Operator).await;
        let mut transport = self.downstream.lock().await;
        let downstream_framing = transport.framing();
        let downstream_hint = hint(downstream_framing);

        let raw = match downstream_framing {
            Framing::Rtu => codec::rtu::encode(request.unit_id, request.function, &payload),
            Framing::Tcp => {
                let txn = session.txn.register(upstream_txn);
                codec::tcp::encode(txn, request.unit_id, request.function, &payload)
            }
        };

        debug!("Relaying downstream: {:02X?}", raw);
        self.pcap
            .record_downstream(Direction::Outbound, downstream_hint, &raw)
            .await;

        if let Err(e) = self.send_with_reconnect(&mut transport, &raw).await {
            warn!("Downstream send failed: {}", e);
            self.events.publish(EventKind::Error {
                message: format!("downstream send failed: {}", e),
                raw: None,
            });
            return Response::exception_for(request, ExceptionCode::GatewayTargetFailed);
        }

        let bytes = match transport.receive_frame(self.config.request_timeout).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("No downstream response: {}", e);
                self.events.publish(EventKind::Error {
                    message: format!("downstream response missing: {}", e),
                    raw: None,
                });
                return Response::exception_for(request, ExceptionCode::GatewayTargetFailed);
            }
        };

        self.pcap
            .record_downstream(Direction::Inbound, downstream_hint, &bytes)
            .await;

        let frame = match downstream_framing {
            Framing::Rtu => codec::rtu::decode(&bytes),
            Framing::Tcp => codec::tcp::decode(&bytes),
        };

        if let Some(error) = frame.to_error() {
            self.events.publish(EventKind::Error {
                message: format!("downstream frame error: {}", error),
                raw: Some(frame.raw.clone()),
            });
            return Response::exception_for(request, ExceptionCode::GatewayTargetFailed);
        }

        if downstream_framing == Framing::Tcp {
            if let Some(txn) = frame.transaction_id {
                session.txn.resolve(txn);
            }
        }

        Response::from_frame(&frame)
    }

    /// Sends, reopening the downstream with exponential backoff when the
    /// link is gone.
    async fn send_with_reconnect(
        &self,
        transport: &mut Box<dyn crate::transport::Transport>,
        raw: &[u8],
    ) -> Result<(), UmdtError> {
        match transport.send(raw).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_disconnect() => return Err(e.into()),
            Err(e) => {
                warn!("Downstream link lost ({}), reconnecting", e);
            }
        }

        let mut backoff = BackoffStrategy::new(self.config.backoff.clone());
        while let Some(interval) = backoff.next_backoff() {
            tokio::time::sleep(interval).await;
            match transport.open().await {
                Ok(()) => {
                    debug!("Downstream reconnected");
                    transport.send(raw).await?;
                    return Ok(());
                }
                Err(e) => warn!("Downstream reconnect failed: {}", e),
            }
        }

        Err(UmdtError::Transport(TransportError::Closed))
    }
}
