mod frame_error;
mod io_operation;
mod serial_error;

pub use frame_error::FrameErrorKind;
pub use io_operation::IoOperation;
pub use serial_error::SerialErrorKind;
