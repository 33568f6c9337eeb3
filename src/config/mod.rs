mod app;
mod backoff;
mod bridge;
mod connection;
mod device;
mod logging;
mod server;
mod types;

pub use app::Config as AppConfig;
pub use backoff::Config as BackoffConfig;
pub use bridge::Config as BridgeConfig;
pub use connection::Config as ConnectionConfig;
pub use device::{
    DeviceConfig, FaultConfig, GroupConfig, InitialValue, RuleConfig, RuleMode, ScriptConfig,
};
pub use logging::Config as LoggingConfig;
pub use server::Config as MockServerConfig;
pub use types::{DataBits, Parity, StopBits};
