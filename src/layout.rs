//! On-disk byte layout helpers.
//!
//! Raw pointers have no business living in persistent structures, so
//! nothing in this crate ever reinterprets mapped bytes as
//! a `#[repr(C)]` struct through a pointer cast. Every persistent field
//! is read and written at an explicit byte offset through these little-
//! endian accessors, grounded on the header-encoding style of
//! `open-nexus-OS`'s `statefs` (`JOURNAL_MAGIC`, LE length/opcode
//! fields framed by hand rather than transmuted).

use crate::error::{Result, SlsError};

#[inline]
pub fn read_u64(buf: &[u8], offset: u64) -> Result<u64> {
    let o = offset as usize;
    let bytes = buf
        .get(o..o + 8)
        .ok_or_else(|| SlsError::Invalid(format!("read_u64 out of range at {offset:#x}")))?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

#[inline]
pub fn write_u64(buf: &mut [u8], offset: u64, value: u64) -> Result<()> {
    let o = offset as usize;
    let bytes = buf
        .get_mut(o..o + 8)
        .ok_or_else(|| SlsError::Invalid(format!("write_u64 out of range at {offset:#x}")))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_i64(buf: &[u8], offset: u64) -> Result<i64> {
    read_u64(buf, offset).map(|v| v as i64)
}

#[inline]
pub fn write_i64(buf: &mut [u8], offset: u64, value: i64) -> Result<()> {
    write_u64(buf, offset, value as u64)
}

#[inline]
pub fn read_u32(buf: &[u8], offset: u64) -> Result<u32> {
    let o = offset as usize;
    let bytes = buf
        .get(o..o + 4)
        .ok_or_else(|| SlsError::Invalid(format!("read_u32 out of range at {offset:#x}")))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

#[inline]
pub fn write_u32(buf: &mut [u8], offset: u64, value: u32) -> Result<()> {
    let o = offset as usize;
    let bytes = buf
        .get_mut(o..o + 4)
        .ok_or_else(|| SlsError::Invalid(format!("write_u32 out of range at {offset:#x}")))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_u8(buf: &[u8], offset: u64) -> Result<u8> {
    buf.get(offset as usize)
        .copied()
        .ok_or_else(|| SlsError::Invalid(format!("read_u8 out of range at {offset:#x}")))
}

#[inline]
pub fn write_u8(buf: &mut [u8], offset: u64, value: u8) -> Result<()> {
    let slot = buf
        .get_mut(offset as usize)
        .ok_or_else(|| SlsError::Invalid(format!("write_u8 out of range at {offset:#x}")))?;
    *slot = value;
    Ok(())
}

#[inline]
pub fn read_u16(buf: &[u8], offset: u64) -> Result<u16> {
    let o = offset as usize;
    let bytes = buf
        .get(o..o + 2)
        .ok_or_else(|| SlsError::Invalid(format!("read_u16 out of range at {offset:#x}")))?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

#[inline]
pub fn write_u16(buf: &mut [u8], offset: u64, value: u16) -> Result<()> {
    let o = offset as usize;
    let bytes = buf
        .get_mut(o..o + 2)
        .ok_or_else(|| SlsError::Invalid(format!("write_u16 out of range at {offset:#x}")))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read an unsigned integer whose width in bytes is given at runtime
/// (1, 2, 4, or 8), needed by the checkpoint engine's invariants,
/// which describe a field's width as data rather than as a Rust type.
pub fn read_uint_sized(buf: &[u8], offset: u64, width: u64) -> Result<u64> {
    match width {
        1 => read_u8(buf, offset).map(|v| v as u64),
        2 => read_u16(buf, offset).map(|v| v as u64),
        4 => read_u32(buf, offset).map(|v| v as u64),
        8 => read_u64(buf, offset),
        _ => Err(SlsError::Invalid(format!("unsupported field width {width}"))),
    }
}

pub fn write_uint_sized(buf: &mut [u8], offset: u64, width: u64, value: u64) -> Result<()> {
    match width {
        1 => write_u8(buf, offset, value as u8),
        2 => write_u16(buf, offset, value as u16),
        4 => write_u32(buf, offset, value as u32),
        8 => write_u64(buf, offset, value),
        _ => Err(SlsError::Invalid(format!("unsupported field width {width}"))),
    }
}

/// Read a signed integer whose width in bytes is given at runtime,
/// sign-extending from that width to `i64`.
pub fn read_int_sized(buf: &[u8], offset: u64, width: u64) -> Result<i64> {
    let raw = read_uint_sized(buf, offset, width)?;
    let shift = (8 - width) * 8;
    Ok(((raw << shift) as i64) >> shift)
}

pub fn write_int_sized(buf: &mut [u8], offset: u64, width: u64, value: i64) -> Result<()> {
    write_uint_sized(buf, offset, width, value as u64)
}

/// The all-ones sentinel used on-disk for "void"/absent offsets, sized
/// to the field width. At API boundaries this is converted to
/// `Option<u64>` or `Tri::Void`, never surfaced raw.
pub const VOID_OFFSET: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrip() {
        let mut buf = vec![0u8; 16];
        write_u64(&mut buf, 4, 0xDEAD_BEEF_CAFE_u64).unwrap();
        assert_eq!(read_u64(&buf, 4).unwrap(), 0xDEAD_BEEF_CAFE_u64);
    }

    #[test]
    fn out_of_range_is_invalid() {
        let buf = vec![0u8; 4];
        assert!(read_u64(&buf, 0).is_err());
    }

    #[test]
    fn sized_int_sign_extends() {
        let mut buf = vec![0u8; 8];
        write_int_sized(&mut buf, 0, 4, -5).unwrap();
        assert_eq!(read_int_sized(&buf, 0, 4).unwrap(), -5);
        write_int_sized(&mut buf, 0, 1, -1).unwrap();
        assert_eq!(read_int_sized(&buf, 0, 1).unwrap(), -1);
    }

    #[test]
    fn sized_uint_roundtrips_every_width() {
        let mut buf = vec![0u8; 8];
        for (width, value) in [(1u64, 200u64), (2, 60000), (4, 4_000_000_000), (8, u64::MAX)] {
            write_uint_sized(&mut buf, 0, width, value).unwrap();
            assert_eq!(read_uint_sized(&buf, 0, width).unwrap(), value);
        }
    }
}
