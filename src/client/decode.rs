//! Endian-aware register decoding.
//!
//! Multi-register values on real devices come in four byte orders; the
//! decoder produces every numeric interpretation of a register window so a
//! diagnostician can spot the right one by eye.

use serde::{Deserialize, Serialize};

use crate::errors::UmdtError;

/// Byte order for multi-register values.
///
/// Names follow the field-device convention for a 32-bit value spanning two
/// registers with wire bytes `A B C D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endianness {
    /// `ABCD`
    Big,
    /// `DCBA`
    Little,
    /// `CDAB`
    MidBig,
    /// `BADC`
    MidLittle,
    /// Produce every permutation.
    All,
}

impl Endianness {
    const PERMUTATIONS: [Endianness; 4] = [
        Endianness::Big,
        Endianness::Little,
        Endianness::MidBig,
        Endianness::MidLittle,
    ];

    /// Concrete orders this mode expands to.
    pub fn expand(self, long: bool) -> Vec<Endianness> {
        match (self, long) {
            (Endianness::All, true) => Self::PERMUTATIONS.to_vec(),
            (Endianness::All, false) => vec![Endianness::Big, Endianness::Little],
            (endian, _) => vec![endian],
        }
    }
}

impl std::fmt::Display for Endianness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Big => write!(f, "big"),
            Self::Little => write!(f, "little"),
            Self::MidBig => write!(f, "mid-big"),
            Self::MidLittle => write!(f, "mid-little"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Reorders the wire bytes `A B C D` of a two-register window.
pub fn permute32(bytes: [u8; 4], endian: Endianness) -> [u8; 4] {
    let [a, b, c, d] = bytes;
    match endian {
        Endianness::Big | Endianness::All => [a, b, c, d],
        Endianness::Little => [d, c, b, a],
        Endianness::MidBig => [c, d, a, b],
        Endianness::MidLittle => [b, a, d, c],
    }
}

/// Reorders the wire bytes `A B` of a single register.
pub fn permute16(bytes: [u8; 2], endian: Endianness) -> [u8; 2] {
    let [a, b] = bytes;
    match endian {
        Endianness::Little => [b, a],
        _ => [a, b],
    }
}

/// IEEE 754 half precision → single precision.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = u32::from((bits >> 10) & 0x1F);
    let mantissa = u32::from(bits & 0x03FF);

    let magnitude = match (exponent, mantissa) {
        (0, 0) => 0,
        (0, m) => {
            // Subnormal: renormalize into the f32 exponent range.
            let shift = m.leading_zeros() - 21;
            let m = (m << (shift + 1)) & 0x03FF;
            ((113 - shift) << 23) | (m << 13)
        }
        (0x1F, 0) => 0xFF << 23,
        (0x1F, m) => (0xFF << 23) | (m << 13),
        (e, m) => ((e + 112) << 23) | (m << 13),
    };

    f32::from_bits(sign | magnitude)
}

/// Single precision → half precision, round-to-nearest-even.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x007F_FFFF;

    if exponent == 0xFF {
        // Infinity or NaN; keep a mantissa bit for NaN.
        let payload = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | payload;
    }

    let unbiased = exponent - 127;
    if unbiased > 15 {
        return sign | 0x7C00; // overflow to infinity
    }
    if unbiased >= -14 {
        let half_exp = ((unbiased + 15) as u16) << 10;
        let half_man = (mantissa >> 13) as u16;
        let round = (mantissa >> 12) & 1;
        return (sign | half_exp | half_man) + round as u16;
    }
    if unbiased >= -24 {
        // Subnormal range: value becomes mantissa-only times 2^-24.
        let shift = (-1 - unbiased) as u32;
        let full = mantissa | 0x0080_0000;
        let half_man = (full >> shift) as u16;
        let round = ((full >> (shift - 1)) & 1) as u16;
        return (sign | half_man) + round;
    }
    sign // underflow to zero
}

/// Every numeric reading of a register window in one byte order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueView {
    pub endian: Endianness,
    pub bytes: Vec<u8>,
    pub hex: String,
    pub uint: u64,
    pub int: i64,
    /// Present for two-register windows.
    pub float32: Option<f32>,
    /// Present for single-register windows.
    pub float16: Option<f32>,
}

impl ValueView {
    fn from_u16(word: [u8; 2], endian: Endianness) -> Self {
        let value = u16::from_be_bytes(word);
        Self {
            endian,
            bytes: word.to_vec(),
            hex: format!("{:04X}", value),
            uint: u64::from(value),
            int: i64::from(value as i16),
            float32: None,
            float16: Some(f16_to_f32(value)),
        }
    }

    fn from_u32(bytes: [u8; 4], endian: Endianness) -> Self {
        let value = u32::from_be_bytes(bytes);
        Self {
            endian,
            bytes: bytes.to_vec(),
            hex: format!("{:08X}", value),
            uint: u64::from(value),
            int: i64::from(value as i32),
            float32: Some(f32::from_bits(value)),
            float16: None,
        }
    }
}

/// Decodes one logical value from its wire registers.
///
/// `regs` holds one register (16-bit values) or two (32-bit); `All`
/// expands to every byte order.
pub fn decode_value(regs: &[u16], endian: Endianness) -> Result<Vec<ValueView>, UmdtError> {
    match regs {
        [word] => {
            let wire = word.to_be_bytes();
            endian
                .expand(false)
                .into_iter()
                .map(|e| match e {
                    Endianness::Big | Endianness::Little => {
                        Ok(ValueView::from_u16(permute16(wire, e), e))
                    }
                    other => Err(UmdtError::invalid_argument(format!(
                        "endian {} needs two registers",
                        other
                    ))),
                })
                .collect()
        }
        [hi, lo] => {
            let wire = [
                hi.to_be_bytes()[0],
                hi.to_be_bytes()[1],
                lo.to_be_bytes()[0],
                lo.to_be_bytes()[1],
            ];
            Ok(endian
                .expand(true)
                .into_iter()
                .map(|e| ValueView::from_u32(permute32(wire, e), e))
                .collect())
        }
        _ => Err(UmdtError::invalid_argument(
            "a logical value spans one or two registers",
        )),
    }
}

/// Decodes a run of registers read off the wire into logical values.
pub fn decode_registers(
    regs: &[u16],
    long: bool,
    endian: Endianness,
) -> Result<Vec<ValueView>, UmdtError> {
    let step = if long { 2 } else { 1 };
    if regs.len() % step != 0 {
        return Err(UmdtError::invalid_argument(
            "register count does not divide into 32-bit values",
        ));
    }

    let mut views = Vec::with_capacity(regs.len() / step);
    for window in regs.chunks_exact(step) {
        views.extend(decode_value(window, endian)?);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutations_distinct() {
        let bytes = [0x41, 0x20, 0x00, 0x01];
        let mut seen: Vec<[u8; 4]> = Endianness::PERMUTATIONS
            .iter()
            .map(|&e| permute32(bytes, e))
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_float32_big_endian() {
        // 0x4120_0000 is 10.0f32.
        let views = decode_value(&[0x4120, 0x0000], Endianness::Big).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].float32, Some(10.0));
        assert_eq!(views[0].hex, "41200000");
    }

    #[test]
    fn test_decode_all_permutation_table() {
        let views = decode_value(&[0x4120, 0x0000], Endianness::All).unwrap();
        assert_eq!(views.len(), 4);
        assert_eq!(views[0].endian, Endianness::Big);
        assert_eq!(views[0].float32, Some(10.0));
        assert_eq!(views[1].endian, Endianness::Little);
        assert_eq!(views[1].bytes, vec![0x00, 0x00, 0x20, 0x41]);
        assert_eq!(views[2].endian, Endianness::MidBig);
        assert_eq!(views[2].bytes, vec![0x00, 0x00, 0x41, 0x20]);
        assert_eq!(views[3].endian, Endianness::MidLittle);
        assert_eq!(views[3].bytes, vec![0x20, 0x41, 0x00, 0x00]);
        // Every view also carries the integer rows.
        assert_eq!(views[0].uint, 0x4120_0000);
        assert_eq!(views[0].int, 0x4120_0000);
    }

    #[test]
    fn test_single_register_views() {
        let views = decode_value(&[0x8001], Endianness::All).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].uint, 0x8001);
        assert_eq!(views[0].int, -32767);
        assert_eq!(views[1].endian, Endianness::Little);
        assert_eq!(views[1].uint, 0x0180);
    }

    #[test]
    fn test_mid_endian_needs_two_registers() {
        assert!(decode_value(&[0x1234], Endianness::MidBig).is_err());
    }

    #[test]
    fn test_decode_register_run() {
        let regs = [0x4120, 0x0000, 0x4248, 0x0000];
        let views = decode_registers(&regs, true, Endianness::Big).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].float32, Some(10.0));
        assert_eq!(views[1].float32, Some(50.0));
    }

    #[test]
    fn test_f16_round_trip() {
        for value in [0.0f32, 1.0, -2.5, 10.0, 65504.0, 0.00006103515625] {
            let bits = f32_to_f16(value);
            assert_eq!(f16_to_f32(bits), value, "value {}", value);
        }
    }

    #[test]
    fn test_f16_known_bit_patterns() {
        assert_eq!(f16_to_f32(0x3C00), 1.0);
        assert_eq!(f16_to_f32(0xC000), -2.0);
        assert_eq!(f16_to_f32(0x4900), 10.0);
        assert_eq!(f16_to_f32(0x7C00), f32::INFINITY);
        assert!(f16_to_f32(0x7E00).is_nan());
        assert_eq!(f32_to_f16(10.0), 0x4900);
    }

    #[test]
    fn test_f16_overflow_saturates_to_infinity() {
        assert_eq!(f32_to_f16(1.0e6), 0x7C00);
        assert_eq!(f32_to_f16(-1.0e6), 0xFC00);
    }
}
