//! # Log Entry Codec
//!
//! One record in the write-ahead log. PUT and REMOVE carry a key (and value
//! for PUT); START and COMMIT are empty markers bracketing the entries of
//! one committed transaction, so that on reopen a trailing batch with no
//! COMMIT can be recognized and discarded.
//!
//! ## Wire Format
//!
//! ```text
//! [1-byte tag][8-byte key length][8-byte value length]
//! [key bytes][value bytes][8-byte CRC64]
//! ```
//!
//! The checksum covers everything before it (CRC-64/ECMA-182). A mismatch
//! reads as `CorruptedBuffer`, which the log reader treats as the end of the
//! valid log: the normal signature of a torn append.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;

use crate::encoding::{get_u64, put_u64, U64_SIZE};
use crate::error::StoreError;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const TAG_PUT: u8 = 0;
const TAG_REMOVE: u8 = 1;
const TAG_START: u8 = 2;
const TAG_COMMIT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Start,
    Commit,
}

impl LogEntry {
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            LogEntry::Put { key, .. } | LogEntry::Remove { key } => Some(key),
            LogEntry::Start | LogEntry::Commit => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, LogEntry::Start | LogEntry::Commit)
    }

    fn tag(&self) -> u8 {
        match self {
            LogEntry::Put { .. } => TAG_PUT,
            LogEntry::Remove { .. } => TAG_REMOVE,
            LogEntry::Start => TAG_START,
            LogEntry::Commit => TAG_COMMIT,
        }
    }

    fn payload(&self) -> (&[u8], &[u8]) {
        match self {
            LogEntry::Put { key, value } => (key.as_slice(), value.as_slice()),
            LogEntry::Remove { key } => (key.as_slice(), &[]),
            LogEntry::Start | LogEntry::Commit => (&[], &[]),
        }
    }

    pub fn byte_length(&self) -> usize {
        let (key, value) = self.payload();
        1 + 3 * U64_SIZE + key.len() + value.len()
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.byte_length();
        if buf.len() < needed {
            eyre::bail!(StoreError::InsufficientBuffer(format!(
                "log entry needs {} bytes, have {}",
                needed,
                buf.len()
            )));
        }
        let (key, value) = self.payload();
        buf[0] = self.tag();
        put_u64(&mut buf[1..], key.len() as u64)?;
        put_u64(&mut buf[1 + U64_SIZE..], value.len() as u64)?;
        let mut offset = 1 + 2 * U64_SIZE;
        buf[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        buf[offset..offset + value.len()].copy_from_slice(value);
        offset += value.len();

        let checksum = CRC64.checksum(&buf[..offset]);
        put_u64(&mut buf[offset..], checksum)?;
        Ok(needed)
    }

    /// Decode one entry from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let header = 1 + 2 * U64_SIZE;
        if buf.len() < header + U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "log entry header needs {} bytes, have {}",
                header + U64_SIZE,
                buf.len()
            )));
        }
        let tag = buf[0];
        let key_len = get_u64(&buf[1..])? as usize;
        let value_len = get_u64(&buf[1 + U64_SIZE..])? as usize;

        let total = header + key_len + value_len + U64_SIZE;
        if buf.len() < total {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "log entry declares {} bytes but only {} remain",
                total,
                buf.len()
            )));
        }
        let payload_end = header + key_len + value_len;
        let stored_crc = get_u64(&buf[payload_end..])?;
        if CRC64.checksum(&buf[..payload_end]) != stored_crc {
            eyre::bail!(StoreError::CorruptedBuffer(
                "log entry checksum mismatch".into()
            ));
        }

        let key = buf[header..header + key_len].to_vec();
        let value = buf[header + key_len..payload_end].to_vec();
        let entry = match tag {
            TAG_PUT => LogEntry::Put { key, value },
            TAG_REMOVE => LogEntry::Remove { key },
            TAG_START => LogEntry::Start,
            TAG_COMMIT => LogEntry::Commit,
            other => {
                eyre::bail!(StoreError::CorruptedBuffer(format!(
                    "unknown log entry tag {:#04x}",
                    other
                )));
            }
        };
        Ok((entry, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn put_entry_roundtrip() {
        let entry = LogEntry::Put {
            key: b"BMW".to_vec(),
            value: b"X6".to_vec(),
        };
        let mut buf = vec![0u8; entry.byte_length()];
        entry.serialize(&mut buf).unwrap();

        let (decoded, consumed) = LogEntry::deserialize(&buf).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn remove_entry_roundtrip() {
        let entry = LogEntry::Remove {
            key: b"Mercedes".to_vec(),
        };
        let mut buf = vec![0u8; entry.byte_length()];
        entry.serialize(&mut buf).unwrap();

        let (decoded, _) = LogEntry::deserialize(&buf).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn markers_have_no_key() {
        for entry in [LogEntry::Start, LogEntry::Commit] {
            assert!(entry.is_marker());
            assert_eq!(entry.key(), None);

            let mut buf = vec![0u8; entry.byte_length()];
            entry.serialize(&mut buf).unwrap();
            let (decoded, _) = LogEntry::deserialize(&buf).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn flipped_bit_fails_the_checksum() {
        let entry = LogEntry::Put {
            key: b"key".to_vec(),
            value: b"value".to_vec(),
        };
        let mut buf = vec![0u8; entry.byte_length()];
        entry.serialize(&mut buf).unwrap();
        buf[20] ^= 0x01;

        let err = LogEntry::deserialize(&buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptedBuffer(_))
        ));
    }

    #[test]
    fn truncated_entry_is_corrupted() {
        let entry = LogEntry::Put {
            key: b"key".to_vec(),
            value: b"value".to_vec(),
        };
        let mut buf = vec![0u8; entry.byte_length()];
        entry.serialize(&mut buf).unwrap();

        let err = LogEntry::deserialize(&buf[..buf.len() - 3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptedBuffer(_))
        ));
    }

    #[test]
    fn consecutive_entries_decode_by_consumed_length() {
        let first = LogEntry::Put {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        };
        let second = LogEntry::Remove { key: b"b".to_vec() };

        let mut buf = vec![0u8; first.byte_length() + second.byte_length()];
        first.serialize(&mut buf).unwrap();
        second
            .serialize(&mut buf[first.byte_length()..])
            .unwrap();

        let (d1, used) = LogEntry::deserialize(&buf).unwrap();
        let (d2, _) = LogEntry::deserialize(&buf[used..]).unwrap();
        assert_eq!(d1, first);
        assert_eq!(d2, second);
    }
}
