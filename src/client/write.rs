//! Write-side value normalization and register encoding.

use crate::codec::RegisterKind;
use crate::errors::UmdtError;

use super::decode::{f32_to_f16, permute16, permute32, Endianness};

/// A normalized value to write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Integer(i64),
    Float(f64),
    Bits(Vec<bool>),
}

impl WriteValue {
    /// Parses user input: decimal or `0x…` hex for integers; hex is
    /// rejected for floats.
    pub fn parse(input: &str, float: bool) -> Result<Self, UmdtError> {
        let input = input.trim();
        let is_hex = input.starts_with("0x") || input.starts_with("0X");

        if float {
            if is_hex {
                return Err(UmdtError::invalid_argument(
                    "hex input is not valid for float values",
                ));
            }
            let value = input
                .parse::<f64>()
                .map_err(|e| UmdtError::invalid_argument(format!("invalid float: {}", e)))?;
            return Ok(Self::Float(value));
        }

        let value = if is_hex {
            i64::from_str_radix(&input[2..], 16)
                .map_err(|e| UmdtError::invalid_argument(format!("invalid hex integer: {}", e)))?
        } else {
            input
                .parse::<i64>()
                .map_err(|e| UmdtError::invalid_argument(format!("invalid integer: {}", e)))?
        };
        Ok(Self::Integer(value))
    }
}

/// One register write, fully specified.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub unit_id: u8,
    pub kind: RegisterKind,
    pub address: u16,
    pub value: WriteValue,
    /// Value spans two registers.
    pub long: bool,
    /// Treat integer input as signed; implied by a negative value.
    pub signed: bool,
    pub endian: Endianness,
}

impl WriteRequest {
    pub fn single(unit_id: u8, kind: RegisterKind, address: u16, value: WriteValue) -> Self {
        Self {
            unit_id,
            kind,
            address,
            value,
            long: false,
            signed: false,
            endian: Endianness::Big,
        }
    }

    fn concrete_endian(&self) -> Result<Endianness, UmdtError> {
        match (self.endian, self.long) {
            (Endianness::All, _) => Err(UmdtError::invalid_argument(
                "writes need one concrete byte order, not `all`",
            )),
            (Endianness::MidBig | Endianness::MidLittle, false) => Err(
                UmdtError::invalid_argument("mid-endian orders need a two-register value"),
            ),
            (endian, _) => Ok(endian),
        }
    }

    /// Encodes the value into wire-order registers, validating range
    /// against the declared width and signedness.
    pub fn encode_registers(&self) -> Result<Vec<u16>, UmdtError> {
        let endian = self.concrete_endian()?;

        match (&self.value, self.long) {
            (WriteValue::Float(value), true) => {
                let wire = permute32((*value as f32).to_be_bytes(), endian);
                Ok(vec![
                    u16::from_be_bytes([wire[0], wire[1]]),
                    u16::from_be_bytes([wire[2], wire[3]]),
                ])
            }
            (WriteValue::Float(value), false) => {
                let bits = f32_to_f16(*value as f32);
                let wire = permute16(bits.to_be_bytes(), endian);
                Ok(vec![u16::from_be_bytes(wire)])
            }
            (WriteValue::Integer(value), true) => {
                let signed = self.signed || *value < 0;
                let raw: u32 = if signed {
                    i32::try_from(*value).map_err(|_| {
                        UmdtError::invalid_argument(format!(
                            "{} out of range for signed 32-bit",
                            value
                        ))
                    })? as u32
                } else {
                    u32::try_from(*value).map_err(|_| {
                        UmdtError::invalid_argument(format!(
                            "{} out of range for unsigned 32-bit",
                            value
                        ))
                    })?
                };
                let wire = permute32(raw.to_be_bytes(), endian);
                Ok(vec![
                    u16::from_be_bytes([wire[0], wire[1]]),
                    u16::from_be_bytes([wire[2], wire[3]]),
                ])
            }
            (WriteValue::Integer(value), false) => {
                let signed = self.signed || *value < 0;
                let raw: u16 = if signed {
                    i16::try_from(*value).map_err(|_| {
                        UmdtError::invalid_argument(format!(
                            "{} out of range for signed 16-bit",
                            value
                        ))
                    })? as u16
                } else {
                    u16::try_from(*value).map_err(|_| {
                        UmdtError::invalid_argument(format!(
                            "{} out of range for unsigned 16-bit",
                            value
                        ))
                    })?
                };
                let wire = permute16(raw.to_be_bytes(), endian);
                Ok(vec![u16::from_be_bytes(wire)])
            }
            (WriteValue::Bits(_), _) => Err(UmdtError::invalid_argument(
                "coil values do not encode into registers",
            )),
        }
    }

    /// Human-readable summary for the pre-flight event.
    pub fn interpretation(&self) -> String {
        match &self.value {
            WriteValue::Float(v) if self.long => format!("float32 {} ({})", v, self.endian),
            WriteValue::Float(v) => format!("float16 {} ({})", v, self.endian),
            WriteValue::Integer(v) if self.long => {
                let sign = if self.signed || *v < 0 { "int32" } else { "uint32" };
                format!("{} {} ({})", sign, v, self.endian)
            }
            WriteValue::Integer(v) => {
                let sign = if self.signed || *v < 0 { "int16" } else { "uint16" };
                format!("{} {} ({})", sign, v, self.endian)
            }
            WriteValue::Bits(bits) => format!("{} coil(s)", bits.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!(
            WriteValue::parse("1234", false).unwrap(),
            WriteValue::Integer(1234)
        );
        assert_eq!(
            WriteValue::parse("0x4120", false).unwrap(),
            WriteValue::Integer(0x4120)
        );
        assert_eq!(
            WriteValue::parse("-5", false).unwrap(),
            WriteValue::Integer(-5)
        );
        assert_eq!(
            WriteValue::parse("10.5", true).unwrap(),
            WriteValue::Float(10.5)
        );
    }

    #[test]
    fn test_hex_float_rejected() {
        assert!(WriteValue::parse("0x4120", true).is_err());
    }

    #[test]
    fn test_float32_registers_per_endian() {
        let mut req = WriteRequest::single(
            1,
            RegisterKind::Holding,
            100,
            WriteValue::Float(10.0),
        );
        req.long = true;

        req.endian = Endianness::Big;
        assert_eq!(req.encode_registers().unwrap(), vec![0x4120, 0x0000]);

        req.endian = Endianness::Little;
        assert_eq!(req.encode_registers().unwrap(), vec![0x0000, 0x2041]);

        req.endian = Endianness::MidBig;
        assert_eq!(req.encode_registers().unwrap(), vec![0x0000, 0x4120]);

        req.endian = Endianness::MidLittle;
        assert_eq!(req.encode_registers().unwrap(), vec![0x2041, 0x0000]);
    }

    #[test]
    fn test_float16_single_register() {
        let req = WriteRequest::single(
            1,
            RegisterKind::Holding,
            5,
            WriteValue::Float(10.0),
        );
        assert_eq!(req.encode_registers().unwrap(), vec![0x4900]);
    }

    #[test]
    fn test_negative_implies_signed() {
        let req = WriteRequest::single(
            1,
            RegisterKind::Holding,
            0,
            WriteValue::Integer(-1),
        );
        assert_eq!(req.encode_registers().unwrap(), vec![0xFFFF]);
    }

    #[test]
    fn test_signed_range_enforced() {
        let mut req = WriteRequest::single(
            1,
            RegisterKind::Holding,
            0,
            WriteValue::Integer(40_000),
        );
        assert_eq!(req.encode_registers().unwrap(), vec![40_000]);

        req.signed = true;
        assert!(req.encode_registers().is_err());

        req.signed = false;
        req.value = WriteValue::Integer(70_000);
        assert!(req.encode_registers().is_err());
        req.long = true;
        assert_eq!(req.encode_registers().unwrap(), vec![0x0001, 0x1170]);
    }

    #[test]
    fn test_write_all_endian_rejected() {
        let mut req = WriteRequest::single(
            1,
            RegisterKind::Holding,
            0,
            WriteValue::Integer(1),
        );
        req.endian = Endianness::All;
        assert!(req.encode_registers().is_err());
    }
}
