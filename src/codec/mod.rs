//! Modbus frame codec: CRC, RTU and MBAP framing, permissive decoding.

mod crc;
mod frame;
mod function;
mod reassembly;
pub mod rtu;
pub mod tcp;

pub use crc::{crc16, verify_crc};
pub use frame::{pack_bits, ExceptionCode, Frame, Framing, Request, Response};
pub use function::{
    guess_response_size, FunctionCode, RegisterKind, EXCEPTION_FLAG, MAX_REGISTERS_PER_REQUEST,
};
pub use reassembly::FrameScanner;
pub use tcp::{MbapHeader, MBAP_HEADER_LEN};
