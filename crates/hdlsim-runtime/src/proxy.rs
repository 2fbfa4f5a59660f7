//! State proxy: typed reads and writes over the shared linear memory.
//!
//! Every variable reads and writes through the representation its storage
//! size dictates: u8/u16/u32/u64 for scalar containers, a big integer
//! (little-endian 32-bit chunks) for wide logic, and a byte view for arrays.
//! Writes are masked to the declared width, driven by the destination.

use hdlsim_codegen::LayoutEntry;
use hdlsim_ir::DataType;
use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::error::{RuntimeError, SimResult};

/// A value crossing the proxy boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Big(BigUint),
    Bytes(Vec<u8>),
}

impl SignalValue {
    /// The value as a u64 (wide values truncate to their low 64 bits;
    /// arrays have no integer form).
    pub fn as_u64(&self) -> u64 {
        match self {
            SignalValue::U8(v) => *v as u64,
            SignalValue::U16(v) => *v as u64,
            SignalValue::U32(v) => *v as u64,
            SignalValue::U64(v) => *v,
            SignalValue::Big(b) => b.iter_u64_digits().next().unwrap_or(0),
            SignalValue::Bytes(_) => 0,
        }
    }

    /// The value as a big integer (arrays read little-endian).
    pub fn to_big(&self) -> BigUint {
        match self {
            SignalValue::Big(b) => b.clone(),
            SignalValue::Bytes(bytes) => BigUint::from_bytes_le(bytes),
            other => BigUint::from(other.as_u64()),
        }
    }
}

impl From<u64> for SignalValue {
    fn from(v: u64) -> Self {
        SignalValue::U64(v)
    }
}

impl From<u32> for SignalValue {
    fn from(v: u32) -> Self {
        SignalValue::U32(v)
    }
}

impl From<u8> for SignalValue {
    fn from(v: u8) -> Self {
        SignalValue::U8(v)
    }
}

impl From<BigUint> for SignalValue {
    fn from(v: BigUint) -> Self {
        SignalValue::Big(v)
    }
}

/// Read one variable at `base + entry.offset` from the memory image.
pub fn read(entry: &LayoutEntry, base: u32, mem: &[u8]) -> SignalValue {
    let at = (base + entry.offset) as usize;
    let bytes = &mem[at..at + entry.size as usize];
    match &entry.dtype {
        DataType::Array { .. } => SignalValue::Bytes(bytes.to_vec()),
        DataType::Logic { .. } => match entry.size {
            1 => SignalValue::U8(bytes[0]),
            2 => SignalValue::U16(u16::from_le_bytes(bytes.try_into().unwrap())),
            4 => SignalValue::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
            8 => SignalValue::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
            _ => {
                let mut big = BigUint::from_bytes_le(bytes);
                big &= width_mask(entry.dtype.width());
                SignalValue::Big(big)
            }
        },
    }
}

/// Write one variable, masking to the declared width.
pub fn write(
    entry: &LayoutEntry,
    base: u32,
    mem: &mut [u8],
    value: &SignalValue,
) -> SimResult<()> {
    let at = (base + entry.offset) as usize;
    let size = entry.size as usize;
    let dst = &mut mem[at..at + size];

    if let DataType::Array { .. } = entry.dtype {
        return match value {
            SignalValue::Bytes(bytes) if bytes.len() == size => {
                dst.copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(RuntimeError::InvalidValue(entry.name.clone())),
        };
    }

    let width = entry.dtype.width();
    match entry.size {
        1 | 2 | 4 | 8 => {
            let mut v = match value {
                SignalValue::Big(b) => b.to_u64().ok_or_else(|| {
                    RuntimeError::InvalidValue(entry.name.clone())
                })?,
                other => other.as_u64(),
            };
            if width < 64 {
                v &= (1u64 << width) - 1;
            }
            dst.copy_from_slice(&v.to_le_bytes()[..size]);
            Ok(())
        }
        _ => {
            // Wide logic: break into little-endian u32 chunks.
            let mut big = value.to_big();
            big &= width_mask(width);
            let bytes = big.to_bytes_le();
            dst[..bytes.len()].copy_from_slice(&bytes);
            dst[bytes.len()..].fill(0);
            Ok(())
        }
    }
}

fn width_mask(width: u32) -> BigUint {
    (BigUint::from(1u8) << width) - 1u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdlsim_codegen::{compile, SimConfig};
    use hdlsim_ir::build::{logic, ModuleBuilder};

    fn entry_for(width: u32) -> LayoutEntry {
        let m = ModuleBuilder::new("t").signal("x", logic(width)).build();
        let compiled = compile(&m, None, &SimConfig::default()).unwrap();
        compiled.layout.lookup("x").unwrap().clone()
    }

    #[test]
    fn narrow_write_masks_to_width() {
        let e = entry_for(5);
        let mut mem = vec![0u8; 64];
        write(&e, 0, &mut mem, &SignalValue::U64(0xFF)).unwrap();
        assert_eq!(read(&e, 0, &mem), SignalValue::U8(0x1F));
    }

    #[test]
    fn u64_round_trip() {
        let e = entry_for(64);
        let mut mem = vec![0u8; 64];
        write(&e, 0, &mut mem, &SignalValue::U64(u64::MAX)).unwrap();
        assert_eq!(read(&e, 0, &mem), SignalValue::U64(u64::MAX));
    }

    #[test]
    fn wide_write_chunks_little_endian() {
        let e = entry_for(96);
        let mut mem = vec![0u8; 64];
        let v = BigUint::parse_bytes(b"112233445566778899aabbcc", 16).unwrap();
        write(&e, 0, &mut mem, &SignalValue::Big(v.clone())).unwrap();
        let at = e.offset as usize;
        // Low chunk first.
        assert_eq!(
            u32::from_le_bytes(mem[at..at + 4].try_into().unwrap()),
            0x99aabbcc
        );
        assert_eq!(read(&e, 0, &mem), SignalValue::Big(v));
    }

    #[test]
    fn wide_write_masks_to_width() {
        let e = entry_for(65);
        let mut mem = vec![0u8; 64];
        // Bit 70 falls outside the declared width; bit 64 survives.
        let v = (BigUint::from(1u8) << 70) + (BigUint::from(1u8) << 64) + 3u8;
        write(&e, 0, &mut mem, &SignalValue::Big(v)).unwrap();
        let expect = (BigUint::from(1u8) << 64) + 3u8;
        assert_eq!(read(&e, 0, &mem), SignalValue::Big(expect));
    }
}
