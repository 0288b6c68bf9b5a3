//! Key-value item codec.
//!
//! An item is one key/value record inside a node. Immutable once built;
//! replacing a key's value constructs a new item.
//!
//! ## Wire Format
//!
//! ```text
//! [8-byte key length][8-byte value length][key bytes][value bytes]
//! ```

use eyre::Result;

use crate::encoding::{get_u64, put_u64, U64_SIZE};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Item {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn byte_length(&self) -> usize {
        2 * U64_SIZE + self.key.len() + self.value.len()
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.byte_length();
        if buf.len() < needed {
            eyre::bail!(StoreError::InsufficientBuffer(format!(
                "item needs {} bytes, have {}",
                needed,
                buf.len()
            )));
        }
        put_u64(&mut buf[0..], self.key.len() as u64)?;
        put_u64(&mut buf[U64_SIZE..], self.value.len() as u64)?;
        let mut offset = 2 * U64_SIZE;
        buf[offset..offset + self.key.len()].copy_from_slice(&self.key);
        offset += self.key.len();
        buf[offset..offset + self.value.len()].copy_from_slice(&self.value);
        Ok(needed)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 * U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "item header needs {} bytes, have {}",
                2 * U64_SIZE,
                buf.len()
            )));
        }
        let key_len = get_u64(&buf[0..])? as usize;
        let value_len = get_u64(&buf[U64_SIZE..])? as usize;

        let remaining = buf.len() - 2 * U64_SIZE;
        if remaining < key_len + value_len {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "item declares {} payload bytes but only {} remain",
                key_len + value_len,
                remaining
            )));
        }
        let key_start = 2 * U64_SIZE;
        let value_start = key_start + key_len;
        Ok(Self {
            key: buf[key_start..value_start].to_vec(),
            value: buf[value_start..value_start + value_len].to_vec(),
        })
    }
}
