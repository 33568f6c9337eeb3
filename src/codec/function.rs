use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit set on the function byte of exception responses.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Hard protocol limit on registers per read/write request.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// The Modbus function codes UMDT understands.
///
/// Anything else is carried as [`FunctionCode::Other`] so malformed or
/// vendor-specific traffic still flows through the capture paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// `01` Read Coils.
    ReadCoils,
    /// `02` Read Discrete Inputs.
    ReadDiscreteInputs,
    /// `03` Read Holding Registers.
    ReadHoldingRegisters,
    /// `04` Read Input Registers.
    ReadInputRegisters,
    /// `05` Write Single Coil.
    WriteSingleCoil,
    /// `06` Write Single Register.
    WriteSingleRegister,
    /// `15` (`0x0F`) Write Multiple Coils.
    WriteMultipleCoils,
    /// `16` (`0x10`) Write Multiple Registers.
    WriteMultipleRegisters,
    /// `23` (`0x17`) Read/Write Multiple Registers.
    ReadWriteMultipleRegisters,
    /// `43` (`0x2B`) Encapsulated Interface Transport (device identification).
    EncapsulatedInterface,
    /// Any other code.
    Other(u8),
}

impl FunctionCode {
    pub const fn new(value: u8) -> Self {
        match value & !EXCEPTION_FLAG {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            0x17 => Self::ReadWriteMultipleRegisters,
            0x2B => Self::EncapsulatedInterface,
            code => Self::Other(code),
        }
    }

    pub const fn value(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::ReadWriteMultipleRegisters => 0x17,
            Self::EncapsulatedInterface => 0x2B,
            Self::Other(code) => code,
        }
    }

    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Whether the PDU payload starts with a 2-byte address followed by a
    /// 2-byte quantity (or value, for the single-write codes).
    pub const fn has_addressing(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
                | Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
                | Self::ReadWriteMultipleRegisters
        )
    }

    /// Expected RTU request frame length for fixed-length requests, CRC
    /// included. `None` for variable-length and vendor codes.
    pub const fn fixed_request_len(self) -> Option<usize> {
        match self {
            Self::ReadCoils
            | Self::ReadDiscreteInputs
            | Self::ReadHoldingRegisters
            | Self::ReadInputRegisters
            | Self::WriteSingleCoil
            | Self::WriteSingleRegister => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.value())
    }
}

/// Estimates the size of an RTU response frame (CRC included) from the
/// function code and the requested quantity.
///
/// Used to bound waits on slow serial links and by the heuristic
/// reassembler to pick candidate frame lengths.
pub fn guess_response_size(function: u8, quantity: u16) -> usize {
    match FunctionCode::new(function) {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            // One status bit per coil, rounded up to whole bytes.
            let data_bytes = (quantity as usize).div_ceil(8);
            1 + 1 + 1 + data_bytes + 2
        }
        FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters
        | FunctionCode::ReadWriteMultipleRegisters => {
            let data_bytes = (quantity as usize) * 2;
            1 + 1 + 1 + data_bytes + 2
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 1 + 1 + 2 + 2 + 2,
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            1 + 1 + 2 + 2 + 2
        }
        // Device identification and vendor codes have no usable bound.
        _ => 256,
    }
}

/// The four Modbus data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterKind {
    /// Function code used to read this table.
    pub const fn read_function(self) -> FunctionCode {
        match self {
            Self::Coil => FunctionCode::ReadCoils,
            Self::Discrete => FunctionCode::ReadDiscreteInputs,
            Self::Holding => FunctionCode::ReadHoldingRegisters,
            Self::Input => FunctionCode::ReadInputRegisters,
        }
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Holding | Self::Coil)
    }

    /// One bit per entry (coils, discrete inputs) vs one 16-bit word.
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }

    /// Data table a request function code operates on, if any.
    pub const fn of_function(function: FunctionCode) -> Option<Self> {
        match function {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => Some(Self::Coil),
            FunctionCode::ReadDiscreteInputs => Some(Self::Discrete),
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters
            | FunctionCode::ReadWriteMultipleRegisters => Some(Self::Holding),
            FunctionCode::ReadInputRegisters => Some(Self::Input),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Holding => write!(f, "holding"),
            Self::Input => write!(f, "input"),
            Self::Coil => write!(f, "coil"),
            Self::Discrete => write!(f, "discrete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_codes() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10, 0x17, 0x2B] {
            assert_eq!(FunctionCode::new(code).value(), code);
            assert!(FunctionCode::new(code).is_known());
        }
        assert_eq!(FunctionCode::new(0x41), FunctionCode::Other(0x41));
    }

    #[test]
    fn test_exception_flag_stripped() {
        assert_eq!(FunctionCode::new(0x83), FunctionCode::ReadHoldingRegisters);
    }

    #[test]
    fn test_response_size_estimates() {
        // 10 registers: addr + fc + count + 20 data + crc
        assert_eq!(guess_response_size(0x03, 10), 25);
        // 10 coils: 2 data bytes
        assert_eq!(guess_response_size(0x01, 10), 7);
        assert_eq!(guess_response_size(0x06, 1), 8);
        assert_eq!(guess_response_size(0x10, 4), 8);
    }

    #[test]
    fn test_register_kind_mapping() {
        assert_eq!(
            RegisterKind::Holding.read_function(),
            FunctionCode::ReadHoldingRegisters
        );
        assert_eq!(
            RegisterKind::of_function(FunctionCode::WriteMultipleCoils),
            Some(RegisterKind::Coil)
        );
        assert!(RegisterKind::Holding.is_writable());
        assert!(!RegisterKind::Input.is_writable());
        assert!(RegisterKind::Discrete.is_bit());
    }
}
