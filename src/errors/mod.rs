mod config;
mod connection;
mod frame;
mod kinds;
mod script;
mod transport;
mod umdt;

pub use kinds::FrameErrorKind;
pub use kinds::IoOperation;
pub use kinds::SerialErrorKind;

pub use config::ConfigError;
pub use connection::ConnectionError;
pub use frame::FrameError;
pub use script::ScriptError;
pub use transport::TransportError;
pub use umdt::UmdtError;
