//! Address-space sweeps.

use tracing::{debug, info};

use crate::bus::BusPriority;
use crate::codec::{ExceptionCode, RegisterKind, MAX_REGISTERS_PER_REQUEST};
use crate::errors::UmdtError;

use super::ModbusClient;

/// Parameters of a register sweep.
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub unit_id: u8,
    pub kind: RegisterKind,
    pub start: u16,
    pub end: u16,
    /// Registers per bulk read; a failed batch is retried per address.
    pub batch: u16,
}

impl ScanParams {
    pub fn new(unit_id: u8, kind: RegisterKind, start: u16, end: u16) -> Self {
        Self {
            unit_id,
            kind,
            start,
            end,
            batch: 1,
        }
    }
}

/// A populated address discovered by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    pub address: u16,
    pub value: u16,
}

impl ModbusClient {
    /// Sweeps `[start, end]`, returning the addresses that answered.
    ///
    /// Runs at scanner priority, so a concurrent foreground operation
    /// preempts the sweep between reads. `IllegalDataAddress` replies mean
    /// "nothing mapped here" and are skipped silently; every other failure
    /// aborts the sweep.
    pub async fn scan(&self, params: &ScanParams) -> Result<Vec<ScanHit>, UmdtError> {
        if params.start > params.end {
            return Err(UmdtError::invalid_argument(
                "scan start must not exceed end",
            ));
        }
        let batch = params
            .batch
            .clamp(1, MAX_REGISTERS_PER_REQUEST);

        let mut hits = Vec::new();
        let mut address = params.start;
        loop {
            let remaining = u32::from(params.end) - u32::from(address) + 1;
            let quantity = (remaining.min(u32::from(batch))) as u16;

            match self.read_batch(params, address, quantity).await {
                Ok(values) => {
                    for (offset, value) in values.into_iter().enumerate() {
                        hits.push(ScanHit {
                            address: address + offset as u16,
                            value,
                        });
                    }
                    info!(
                        "Scan hit: {} {}..{} answered",
                        params.kind,
                        address,
                        address + quantity - 1
                    );
                }
                Err(UmdtError::Exception(ExceptionCode::IllegalDataAddress)) if quantity > 1 => {
                    // Some address inside the batch is unmapped; probe the
                    // batch one address at a time.
                    for single in address..address.saturating_add(quantity) {
                        match self.read_batch(params, single, 1).await {
                            Ok(values) => hits.push(ScanHit {
                                address: single,
                                value: values[0],
                            }),
                            Err(UmdtError::Exception(ExceptionCode::IllegalDataAddress)) => {
                                debug!("No {} register at {}", params.kind, single);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(UmdtError::Exception(ExceptionCode::IllegalDataAddress)) => {
                    debug!("No {} register at {}", params.kind, address);
                }
                Err(e) => return Err(e),
            }

            match address.checked_add(quantity) {
                Some(next) if next <= params.end => address = next,
                _ => break,
            }
        }

        Ok(hits)
    }

    async fn read_batch(
        &self,
        params: &ScanParams,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, UmdtError> {
        if params.kind.is_bit() {
            let bits = self
                .read_bits(
                    params.unit_id,
                    params.kind,
                    address,
                    quantity,
                    BusPriority::Scanner,
                )
                .await?;
            Ok(bits.into_iter().map(u16::from).collect())
        } else {
            self.read_words(
                params.unit_id,
                params.kind,
                address,
                quantity,
                BusPriority::Scanner,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testutil::ScriptedTransport;
    use super::*;
    use crate::codec::{self, Framing};
    use crate::events::EventBus;

    #[tokio::test]
    async fn test_scan_skips_unmapped_addresses() {
        let mut transport = ScriptedTransport::new(Framing::Rtu);
        // Address 0 answers, 1 is unmapped, 2 answers.
        transport.push_reply(Ok(codec::rtu::encode(1, 0x03, &[0x02, 0x00, 0x2A])));
        transport.push_reply(Ok(codec::rtu::encode(1, 0x83, &[0x02])));
        transport.push_reply(Ok(codec::rtu::encode(1, 0x03, &[0x02, 0x00, 0x07])));

        let client = super::super::ModbusClient::from_transport(
            Box::new(transport),
            Duration::from_millis(100),
            EventBus::default(),
        );

        let params = ScanParams::new(1, RegisterKind::Holding, 0, 2);
        let hits = client.scan(&params).await.unwrap();
        assert_eq!(
            hits,
            vec![
                ScanHit {
                    address: 0,
                    value: 42
                },
                ScanHit {
                    address: 2,
                    value: 7
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_batch_falls_back_to_singles() {
        let mut transport = ScriptedTransport::new(Framing::Rtu);
        // Batched read of 0..=2 fails, then per-address: 0 ok, 1 unmapped, 2 ok.
        transport.push_reply(Ok(codec::rtu::encode(1, 0x83, &[0x02])));
        transport.push_reply(Ok(codec::rtu::encode(1, 0x03, &[0x02, 0x00, 0x01])));
        transport.push_reply(Ok(codec::rtu::encode(1, 0x83, &[0x02])));
        transport.push_reply(Ok(codec::rtu::encode(1, 0x03, &[0x02, 0x00, 0x03])));

        let client = super::super::ModbusClient::from_transport(
            Box::new(transport),
            Duration::from_millis(100),
            EventBus::default(),
        );

        let mut params = ScanParams::new(1, RegisterKind::Holding, 0, 2);
        params.batch = 3;
        let hits = client.scan(&params).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].address, 0);
        assert_eq!(hits[1].address, 2);
    }

    #[tokio::test]
    async fn test_scan_surfaces_other_exceptions() {
        let mut transport = ScriptedTransport::new(Framing::Rtu);
        transport.push_reply(Ok(codec::rtu::encode(1, 0x83, &[0x04])));

        let client = super::super::ModbusClient::from_transport(
            Box::new(transport),
            Duration::from_millis(100),
            EventBus::default(),
        );

        let params = ScanParams::new(1, RegisterKind::Holding, 0, 0);
        assert!(matches!(
            client.scan(&params).await.unwrap_err(),
            UmdtError::Exception(ExceptionCode::ServerDeviceFailure)
        ));
    }
}
