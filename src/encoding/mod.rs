//! # Fixed-Width Integer Encoding
//!
//! Little-endian, bounds-checked integer codecs shared by every on-disk
//! format in the engine (meta page, free list, node headers, log entries).
//! All multi-byte fields in voledb files are little-endian regardless of the
//! host, so a file written on one machine opens on any other.
//!
//! Writers fail with `InsufficientBuffer` and readers with `CorruptedBuffer`
//! when the slice is too short; the caller decides whether that means a
//! programming error or a truncated file.

use eyre::Result;

use crate::error::StoreError;

pub const U64_SIZE: usize = 8;
pub const U16_SIZE: usize = 2;

pub fn put_u64(buf: &mut [u8], value: u64) -> Result<()> {
    if buf.len() < U64_SIZE {
        eyre::bail!(StoreError::InsufficientBuffer(format!(
            "need {} bytes to encode u64, have {}",
            U64_SIZE,
            buf.len()
        )));
    }
    buf[..U64_SIZE].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn get_u64(buf: &[u8]) -> Result<u64> {
    if buf.len() < U64_SIZE {
        eyre::bail!(StoreError::CorruptedBuffer(format!(
            "need {} bytes to decode u64, have {}",
            U64_SIZE,
            buf.len()
        )));
    }
    let mut raw = [0u8; U64_SIZE];
    raw.copy_from_slice(&buf[..U64_SIZE]);
    Ok(u64::from_le_bytes(raw))
}

pub fn put_u16(buf: &mut [u8], value: u16) -> Result<()> {
    if buf.len() < U16_SIZE {
        eyre::bail!(StoreError::InsufficientBuffer(format!(
            "need {} bytes to encode u16, have {}",
            U16_SIZE,
            buf.len()
        )));
    }
    buf[..U16_SIZE].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn get_u16(buf: &[u8]) -> Result<u16> {
    if buf.len() < U16_SIZE {
        eyre::bail!(StoreError::CorruptedBuffer(format!(
            "need {} bytes to decode u16, have {}",
            U16_SIZE,
            buf.len()
        )));
    }
    let mut raw = [0u8; U16_SIZE];
    raw.copy_from_slice(&buf[..U16_SIZE]);
    Ok(u16::from_le_bytes(raw))
}
