//! The Modbus client engine: read/write/monitor/scan/probe.

mod decode;
mod monitor;
mod probe;
mod scan;
mod write;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

pub use decode::{decode_registers, decode_value, Endianness, ValueView};
pub use monitor::{Monitor, MonitorSample};
pub use probe::{probe, ProbeParams, ProbeTarget};
pub use scan::{ScanHit, ScanParams};
pub use write::{WriteRequest, WriteValue};

use crate::bus::{BusCoordinator, BusPriority};
use crate::codec::{
    self, Framing, FunctionCode, RegisterKind, Request, Response, MAX_REGISTERS_PER_REQUEST,
};
use crate::errors::{FrameError, TransportError, UmdtError};
use crate::events::{EventBus, EventKind};
use crate::transport::{self, Endpoint, Transport, TransportOptions};

/// Protocol limit on coils per read request.
const MAX_BITS_PER_REQUEST: u16 = 2000;

/// Parameters of a `read` operation.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub unit_id: u8,
    pub kind: RegisterKind,
    pub address: u16,
    /// Number of logical values; each consumes two registers when `long`.
    pub count: u16,
    pub long: bool,
    pub endian: Endianness,
}

impl ReadRequest {
    pub fn new(unit_id: u8, kind: RegisterKind, address: u16, count: u16) -> Self {
        Self {
            unit_id,
            kind,
            address,
            count,
            long: false,
            endian: Endianness::Big,
        }
    }

    fn register_count(&self) -> Result<u16, UmdtError> {
        if self.count == 0 {
            return Err(UmdtError::invalid_argument("count must be at least 1"));
        }
        let per_value = if self.long { 2u16 } else { 1 };
        let registers = self
            .count
            .checked_mul(per_value)
            .ok_or_else(|| UmdtError::invalid_argument("count overflows the address space"))?;

        let limit = if self.kind.is_bit() {
            if self.long {
                return Err(UmdtError::invalid_argument(
                    "bit tables have no 32-bit values",
                ));
            }
            MAX_BITS_PER_REQUEST
        } else {
            MAX_REGISTERS_PER_REQUEST
        };
        if registers > limit {
            return Err(UmdtError::invalid_argument(format!(
                "{} registers exceeds the limit of {} per request",
                registers, limit
            )));
        }
        if u32::from(self.address) + u32::from(registers) > 0x1_0000 {
            return Err(UmdtError::invalid_argument(
                "address range exceeds the 16-bit address space",
            ));
        }
        Ok(registers)
    }
}

/// Transport-agnostic Modbus master.
///
/// The transport is owned exclusively; all wire access funnels through the
/// bus coordinator so foreground operations and background scanners never
/// interleave mid-frame.
pub struct ModbusClient {
    transport: Mutex<Box<dyn Transport>>,
    bus: Arc<BusCoordinator>,
    events: EventBus,
    request_timeout: Duration,
    next_txn: AtomicU16,
}

impl ModbusClient {
    /// Connects to `endpoint` and wraps the transport in a client.
    pub async fn connect(
        endpoint: &Endpoint,
        options: TransportOptions,
        events: EventBus,
    ) -> Result<Arc<Self>, UmdtError> {
        let transport = transport::connect(endpoint, options, events.clone()).await?;
        Ok(Self::from_transport(
            transport,
            options.request_timeout,
            events,
        ))
    }

    /// Wraps an already-open transport (tests, passive taps).
    pub fn from_transport(
        transport: Box<dyn Transport>,
        request_timeout: Duration,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(transport),
            bus: BusCoordinator::new(),
            events,
            request_timeout,
            next_txn: AtomicU16::new(1),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn bus(&self) -> &Arc<BusCoordinator> {
        &self.bus
    }

    pub async fn close(&self) -> Result<(), UmdtError> {
        let mut transport = self.transport.lock().await;
        transport.close().await?;
        Ok(())
    }

    /// One request/response exchange under the bus lock.
    ///
    /// Modbus exceptions come back as data here; the public operations
    /// decide whether they are errors.
    pub(crate) async fn transaction(
        &self,
        request: &Request,
        priority: BusPriority,
    ) -> Result<Response, UmdtError> {
        let payload = request.encode_payload();
        let _guard = self.bus.acquire(priority).await;
        let mut transport = self.transport.lock().await;

        let raw = match transport.framing() {
            Framing::Rtu => codec::rtu::encode(request.unit_id, request.function, &payload),
            Framing::Tcp => {
                let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
                codec::tcp::encode(txn, request.unit_id, request.function, &payload)
            }
        };

        self.events.publish(EventKind::Request {
            unit_id: request.unit_id,
            function: request.function,
            raw: raw.clone(),
        });
        debug!("Sending request: {:02X?}", raw);

        transport.send(&raw).await?;

        let bytes = match transport.receive_frame(self.request_timeout).await {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout { limit }) => {
                return Err(UmdtError::timeout(limit));
            }
            Err(e) => return Err(e.into()),
        };

        let frame = match transport.framing() {
            Framing::Rtu => codec::rtu::decode(&bytes),
            Framing::Tcp => codec::tcp::decode(&bytes),
        };

        if let Some(error) = frame.to_error() {
            // The raw bytes and the decode attempt go to observers either
            // way; a diagnostic tool must be able to show them.
            self.events.publish(EventKind::Error {
                message: error.to_string(),
                raw: Some(frame.raw.clone()),
            });
            return Err(error.into());
        }

        let response = Response::from_frame(&frame);
        self.events.publish(EventKind::Response {
            unit_id: response.unit_id,
            function: response.function,
            is_exception: response.is_exception,
            exception_code: response.exception_code,
            raw: frame.raw,
        });
        Ok(response)
    }

    fn exception_to_error(response: &Response) -> Result<(), UmdtError> {
        match response.exception_code {
            Some(code) if response.is_exception => Err(UmdtError::Exception(code)),
            _ => Ok(()),
        }
    }

    /// Reads raw registers (words) without value decoding.
    pub(crate) async fn read_words(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        address: u16,
        registers: u16,
        priority: BusPriority,
    ) -> Result<Vec<u16>, UmdtError> {
        let request = Request::read(unit_id, kind.read_function(), address, registers);
        let response = self.transaction(&request, priority).await?;
        Self::exception_to_error(&response)?;
        parse_word_payload(&response, registers)
    }

    /// Reads coil/discrete states without value decoding.
    pub(crate) async fn read_bits(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
        priority: BusPriority,
    ) -> Result<Vec<bool>, UmdtError> {
        let request = Request::read(unit_id, kind.read_function(), address, count);
        let response = self.transaction(&request, priority).await?;
        Self::exception_to_error(&response)?;
        parse_bit_payload(&response, count)
    }

    /// Reads `count` logical values and decodes them per the endian mode.
    pub async fn read(&self, params: &ReadRequest) -> Result<Vec<ValueView>, UmdtError> {
        let registers = params.register_count()?;

        if params.kind.is_bit() {
            let bits = self
                .read_bits(
                    params.unit_id,
                    params.kind,
                    params.address,
                    registers,
                    BusPriority::Operator,
                )
                .await?;
            return Ok(bits.into_iter().map(bit_view).collect());
        }

        let words = self
            .read_words(
                params.unit_id,
                params.kind,
                params.address,
                registers,
                BusPriority::Operator,
            )
            .await?;
        decode_registers(&words, params.long, params.endian)
    }

    /// Writes one value, emitting the pre-flight summary first.
    pub async fn write(&self, params: &WriteRequest) -> Result<(), UmdtError> {
        if !params.kind.is_writable() {
            return Err(UmdtError::invalid_argument(format!(
                "{} registers are read-only",
                params.kind
            )));
        }

        let (function, payload) = match (&params.value, params.kind) {
            (WriteValue::Bits(bits), RegisterKind::Coil) => encode_coil_write(params, bits)?,
            (WriteValue::Bits(_), kind) => {
                return Err(UmdtError::invalid_argument(format!(
                    "coil values cannot be written to {} registers",
                    kind
                )));
            }
            (_, RegisterKind::Coil) => {
                return Err(UmdtError::invalid_argument(
                    "coil writes take boolean values",
                ));
            }
            _ => {
                let registers = params.encode_registers()?;
                self.events.publish(EventKind::WritePreflight {
                    address: params.address,
                    registers: registers.clone(),
                    interpretation: params.interpretation(),
                });
                encode_register_write(params, &registers)
            }
        };

        let request = Request::parse(params.unit_id, function.value(), &payload);
        let response = self.transaction(&request, BusPriority::Operator).await?;
        Self::exception_to_error(&response)
    }
}

fn bit_view(bit: bool) -> ValueView {
    ValueView {
        endian: Endianness::Big,
        bytes: vec![u8::from(bit)],
        hex: format!("{:X}", u8::from(bit)),
        uint: u64::from(bit),
        int: i64::from(bit),
        float32: None,
        float16: None,
    }
}

fn encode_coil_write(
    params: &WriteRequest,
    bits: &[bool],
) -> Result<(FunctionCode, Vec<u8>), UmdtError> {
    match bits {
        [] => Err(UmdtError::invalid_argument("no coil values given")),
        [bit] => {
            let mut payload = params.address.to_be_bytes().to_vec();
            payload.extend_from_slice(if *bit { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            Ok((FunctionCode::WriteSingleCoil, payload))
        }
        bits => {
            let data = codec::pack_bits(bits);
            let mut payload = Vec::with_capacity(5 + data.len());
            payload.extend_from_slice(&params.address.to_be_bytes());
            payload.extend_from_slice(&(bits.len() as u16).to_be_bytes());
            payload.push(data.len() as u8);
            payload.extend_from_slice(&data);
            Ok((FunctionCode::WriteMultipleCoils, payload))
        }
    }
}

fn encode_register_write(params: &WriteRequest, registers: &[u16]) -> (FunctionCode, Vec<u8>) {
    match registers {
        [value] => {
            let mut payload = params.address.to_be_bytes().to_vec();
            payload.extend_from_slice(&value.to_be_bytes());
            (FunctionCode::WriteSingleRegister, payload)
        }
        registers => {
            let mut payload = Vec::with_capacity(5 + registers.len() * 2);
            payload.extend_from_slice(&params.address.to_be_bytes());
            payload.extend_from_slice(&(registers.len() as u16).to_be_bytes());
            payload.push((registers.len() * 2) as u8);
            for register in registers {
                payload.extend_from_slice(&register.to_be_bytes());
            }
            (FunctionCode::WriteMultipleRegisters, payload)
        }
    }
}

fn parse_word_payload(response: &Response, registers: u16) -> Result<Vec<u16>, UmdtError> {
    let payload = &response.payload;
    let expected = registers as usize * 2;
    if payload.len() < 1 + expected || payload[0] as usize != expected {
        return Err(FrameError::truncated(
            "register payload shorter than advertised",
            payload.clone(),
        )
        .into());
    }
    Ok(payload[1..1 + expected]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn parse_bit_payload(response: &Response, count: u16) -> Result<Vec<bool>, UmdtError> {
    let payload = &response.payload;
    let expected = (count as usize).div_ceil(8);
    if payload.len() < 1 + expected || (payload[0] as usize) < expected {
        return Err(FrameError::truncated(
            "bit payload shorter than advertised",
            payload.clone(),
        )
        .into());
    }
    Ok((0..count as usize)
        .map(|i| payload[1 + i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// The `decode` entry point: interprets one or two raw registers in every
/// byte order, no connection required.
pub fn decode_table(registers: &[u16]) -> Result<Vec<ValueView>, UmdtError> {
    decode_value(registers, Endianness::All)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::codec::Framing;
    use crate::errors::TransportError;
    use crate::transport::Transport;

    /// Scripted in-memory transport: pops one canned reply per request.
    pub struct ScriptedTransport {
        pub framing: Framing,
        pub sent: Vec<Vec<u8>>,
        pub replies: VecDeque<Result<Vec<u8>, TransportError>>,
        pub open: bool,
    }

    impl ScriptedTransport {
        pub fn new(framing: Framing) -> Self {
            Self {
                framing,
                sent: Vec::new(),
                replies: VecDeque::new(),
                open: true,
            }
        }

        pub fn push_reply(&mut self, reply: Result<Vec<u8>, TransportError>) {
            self.replies.push_back(reply);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&mut self) -> Result<(), TransportError> {
            self.open = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.open = false;
            Ok(())
        }

        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.replies
                .pop_front()
                .unwrap_or(Err(TransportError::Timeout { limit: timeout }))
        }

        fn framing(&self) -> Framing {
            self.framing
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::ScriptedTransport;
    use super::*;
    use crate::codec::ExceptionCode;

    fn client_with(
        framing: Framing,
        replies: Vec<Result<Vec<u8>, TransportError>>,
    ) -> Arc<ModbusClient> {
        let mut transport = ScriptedTransport::new(framing);
        for reply in replies {
            transport.push_reply(reply);
        }
        ModbusClient::from_transport(
            Box::new(transport),
            Duration::from_millis(100),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_read_float32_big_endian() {
        // Device reports 0x4120 0x0000 at address 100: 10.0f32.
        let reply = codec::rtu::encode(1, 0x03, &[0x04, 0x41, 0x20, 0x00, 0x00]);
        let client = client_with(Framing::Rtu, vec![Ok(reply)]);

        let mut params = ReadRequest::new(1, RegisterKind::Holding, 100, 1);
        params.long = true;
        params.endian = Endianness::Big;

        let views = client.read(&params).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].float32, Some(10.0));
    }

    #[tokio::test]
    async fn test_read_exception_surfaces() {
        let reply = codec::rtu::encode(1, 0x83, &[0x02]);
        let client = client_with(Framing::Rtu, vec![Ok(reply)]);

        let params = ReadRequest::new(1, RegisterKind::Holding, 0, 1);
        let err = client.read(&params).await.unwrap_err();
        assert!(matches!(
            err,
            UmdtError::Exception(ExceptionCode::IllegalDataAddress)
        ));
    }

    #[tokio::test]
    async fn test_read_crc_failure_surfaces_with_bytes() {
        let mut reply = codec::rtu::encode(1, 0x03, &[0x02, 0x12, 0x34]);
        reply[3] ^= 0x01;
        let client = client_with(Framing::Rtu, vec![Ok(reply.clone())]);
        let mut events = client.events().subscribe();

        let params = ReadRequest::new(1, RegisterKind::Holding, 0, 1);
        let err = client.read(&params).await.unwrap_err();
        match err {
            UmdtError::Frame(frame_err) => assert_eq!(frame_err.raw_bytes(), &reply[..]),
            other => panic!("expected frame error, got {:?}", other),
        }

        // Request event, then the error event with the raw capture.
        let mut saw_error = false;
        while let Some(event) = events.try_recv() {
            if let EventKind::Error { raw, .. } = event.kind {
                assert_eq!(raw.as_deref(), Some(&reply[..]));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_read_count_limit() {
        let client = client_with(Framing::Rtu, vec![]);
        let params = ReadRequest::new(1, RegisterKind::Holding, 0, 126);
        assert!(matches!(
            client.read(&params).await.unwrap_err(),
            UmdtError::InvalidArgument(_)
        ));

        let mut params = ReadRequest::new(1, RegisterKind::Holding, 0, 63);
        params.long = true;
        assert!(matches!(
            client.read(&params).await.unwrap_err(),
            UmdtError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_read_coils() {
        // 10 coils, bits 0 and 9 set.
        let reply = codec::rtu::encode(1, 0x01, &[0x02, 0x01, 0x02]);
        let client = client_with(Framing::Rtu, vec![Ok(reply)]);

        let params = ReadRequest::new(1, RegisterKind::Coil, 0, 10);
        let views = client.read(&params).await.unwrap();
        assert_eq!(views.len(), 10);
        assert_eq!(views[0].uint, 1);
        assert_eq!(views[1].uint, 0);
        assert_eq!(views[9].uint, 1);
    }

    #[tokio::test]
    async fn test_write_single_register_uses_fc06() {
        let reply = codec::tcp::encode(1, 1, 0x06, &[0x00, 0x0A, 0x04, 0xD2]);
        let client = client_with(Framing::Tcp, vec![Ok(reply)]);
        let mut events = client.events().subscribe();

        let params = WriteRequest::single(
            1,
            RegisterKind::Holding,
            10,
            WriteValue::Integer(1234),
        );
        client.write(&params).await.unwrap();

        // Pre-flight summary precedes the request on the bus.
        let first = events.try_recv().unwrap();
        match first.kind {
            EventKind::WritePreflight {
                address, registers, ..
            } => {
                assert_eq!(address, 10);
                assert_eq!(registers, vec![1234]);
            }
            other => panic!("expected preflight first, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_float32_uses_fc16() {
        let reply = codec::tcp::encode(1, 1, 0x10, &[0x00, 0x64, 0x00, 0x02]);
        let client = client_with(Framing::Tcp, vec![Ok(reply)]);

        let mut params = WriteRequest::single(
            1,
            RegisterKind::Holding,
            100,
            WriteValue::Float(10.0),
        );
        params.long = true;
        client.write(&params).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_to_input_register_rejected() {
        let client = client_with(Framing::Tcp, vec![]);
        let params = WriteRequest::single(
            1,
            RegisterKind::Input,
            0,
            WriteValue::Integer(1),
        );
        assert!(matches!(
            client.write(&params).await.unwrap_err(),
            UmdtError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let client = client_with(Framing::Tcp, vec![]);
        let params = ReadRequest::new(1, RegisterKind::Holding, 0, 1);
        assert!(matches!(
            client.read(&params).await.unwrap_err(),
            UmdtError::Timeout { .. }
        ));
    }

    #[test]
    fn test_decode_table_entry_point() {
        let views = decode_table(&[0x4120, 0x0000]).unwrap();
        assert_eq!(views.len(), 4);
        assert_eq!(views[0].float32, Some(10.0));
    }
}
