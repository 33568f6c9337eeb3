pub mod bridge;
pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod logging;
pub mod pcap;
pub mod script;
pub mod server;
pub mod sniffer;
pub mod transport;

pub use bridge::Bridge;
pub use bus::{BusCoordinator, BusGuard, BusPriority};
pub use client::{
    decode_table, probe, Endianness, ModbusClient, Monitor, ProbeParams, ProbeTarget, ReadRequest,
    ScanParams, ValueView, WriteRequest, WriteValue,
};
pub use codec::{ExceptionCode, Frame, Framing, FunctionCode, RegisterKind, Request, Response};
pub use config::{AppConfig, BridgeConfig, DeviceConfig, LoggingConfig, MockServerConfig};
pub use config::{DataBits, Parity, StopBits};
pub use connection::{BackoffStrategy, ConnectionGuard, ConnectionManager};
pub use errors::{
    ConfigError, ConnectionError, FrameError, FrameErrorKind, IoOperation, ScriptError,
    SerialErrorKind, TransportError, UmdtError,
};
pub use events::{Event, EventBus, EventKind, EventSubscriber, FaultKind};
pub use logging::setup_logging;
pub use pcap::{Direction, DualPcap, PcapWriter, ProtocolHint};
pub use script::{
    BridgeScript, HookOutcome, ScalarValue, ScriptCtx, ScriptRegistry, ServerScript,
};
pub use server::{FaultProfile, MockServer, Rule, StoreValue};
pub use sniffer::Sniffer;
pub use transport::{Endpoint, SerialEndpoint, TcpEndpoint, Transport, TransportOptions};
