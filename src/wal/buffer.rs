//! # Write-Ahead Buffer
//!
//! Staging area that spares the tree a multi-page mutation for every small
//! write. `put`/`remove` append a log entry to an in-memory list and to the
//! append-only `<path>.log` file; a reverse index (key → ordered entry
//! positions) lets `find` answer from the most recent entry without touching
//! the tree. When the buffer is full the caller replays everything into the
//! tree and clears both copies.
//!
//! ## File Layout
//!
//! ```text
//! Offset  Size  Contents
//! ------  ----  -----------------------------------------
//! 0       8     magic b"VOLELOG\0"
//! 8       8     data_end: file offset one past the last committed entry
//! 16      16    reserved
//! 32      ...   serialized entries, back to back
//! ```
//!
//! `data_end` is rewritten (and flushed) after each append, so a crash
//! between an entry write and its header update just leaves ignorable bytes
//! past the recorded end.
//!
//! ## Transactional Framing
//!
//! A committed batch is bracketed by START/COMMIT markers. On reopen, a
//! trailing run belonging to a START with no matching COMMIT is discarded
//! and the file truncated back to the last complete transaction boundary. A
//! checksum failure while decoding reads as the end of the valid log.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::StoreError;

use super::LogEntry;

pub const LOG_MAGIC: &[u8; 8] = b"VOLELOG\0";
pub const LOG_FILE_HEADER_SIZE: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct LogFileHeader {
    magic: [u8; 8],
    data_end: u64,
    _reserved: [u8; 16],
}

impl LogFileHeader {
    fn new(data_end: u64) -> Self {
        Self {
            magic: *LOG_MAGIC,
            data_end,
            _reserved: [0; 16],
        }
    }
}

#[derive(Debug)]
pub struct WriteAheadBuffer {
    path: PathBuf,
    file: Option<File>,
    data_end: u64,
    entries: Vec<LogEntry>,
    index: HashMap<Vec<u8>, Vec<usize>>,
    max_buffered_entries: usize,
}

impl WriteAheadBuffer {
    pub fn open(path: &Path, max_buffered_entries: usize) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path, max_buffered_entries)
        } else {
            Self::create(path, max_buffered_entries)
        }
    }

    fn create(path: &Path, max_buffered_entries: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create log file at {:?}", path))?;

        let mut buffer = Self {
            path: path.to_path_buf(),
            file: Some(file),
            data_end: LOG_FILE_HEADER_SIZE as u64,
            entries: Vec::new(),
            index: HashMap::new(),
            max_buffered_entries,
        };
        buffer.write_header()?;
        debug!(path = ?path, "created log file");
        Ok(buffer)
    }

    fn open_existing(path: &Path, max_buffered_entries: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open log file at {:?}", path))?;

        let mut raw = [0u8; LOG_FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.read_exact(&mut raw)
            .map_err(|e| StoreError::File(format!("log header read failed: {}", e)))?;
        let header = LogFileHeader::read_from_bytes(&raw)
            .map_err(|e| eyre::eyre!("invalid log file header: {:?}", e))?;
        if header.magic != *LOG_MAGIC {
            eyre::bail!(StoreError::File(
                "magic word mismatch: not a voledb log file".into()
            ));
        }

        let file_len = file
            .metadata()
            .map_err(|e| StoreError::File(format!("log metadata read failed: {}", e)))?
            .len();
        let data_end = header.data_end.min(file_len).max(LOG_FILE_HEADER_SIZE as u64);

        let mut data = vec![0u8; (data_end - LOG_FILE_HEADER_SIZE as u64) as usize];
        file.seek(SeekFrom::Start(LOG_FILE_HEADER_SIZE as u64))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.read_exact(&mut data)
            .map_err(|e| StoreError::File(format!("log read failed: {}", e)))?;

        // Decode entries until the recorded end; a bad checksum or short
        // entry means a torn append and ends the scan.
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut cursor = 0usize;
        while cursor < data.len() {
            match LogEntry::deserialize(&data[cursor..]) {
                Ok((entry, used)) => {
                    offsets.push(LOG_FILE_HEADER_SIZE as u64 + cursor as u64);
                    entries.push(entry);
                    cursor += used;
                }
                Err(_) => {
                    warn!(
                        offset = LOG_FILE_HEADER_SIZE + cursor,
                        "log tail failed validation; treating as end of log"
                    );
                    break;
                }
            }
        }
        let mut valid_end = LOG_FILE_HEADER_SIZE as u64 + cursor as u64;

        // Discard a trailing batch whose START never saw its COMMIT.
        let mut open_start = None;
        for (i, entry) in entries.iter().enumerate() {
            match entry {
                LogEntry::Start => open_start = Some(i),
                LogEntry::Commit => open_start = None,
                _ => {}
            }
        }
        if let Some(start_index) = open_start {
            warn!(
                discarded = entries.len() - start_index,
                "discarding incomplete trailing transaction from log"
            );
            valid_end = offsets[start_index];
            entries.truncate(start_index);
        }

        let mut buffer = Self {
            path: path.to_path_buf(),
            file: Some(file),
            data_end: valid_end,
            entries,
            index: HashMap::new(),
            max_buffered_entries,
        };
        for (i, entry) in buffer.entries.iter().enumerate() {
            if let Some(key) = entry.key() {
                buffer.index.entry(key.to_vec()).or_default().push(i);
            }
        }
        buffer.truncate_file(valid_end)?;
        buffer.write_header()?;

        debug!(path = ?path, entries = buffer.entries.len(), "opened log file");
        Ok(buffer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_buffered_entries
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Answer a lookup from the most recent entry affecting `key`:
    /// `Some(Some(value))` for a PUT, `Some(None)` for a shadowing REMOVE,
    /// `None` when the buffer knows nothing about the key.
    pub fn find(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        let positions = self.index.get(key)?;
        let last = *positions.last()?;
        match &self.entries[last] {
            LogEntry::Put { value, .. } => Some(Some(value.as_slice())),
            LogEntry::Remove { .. } => Some(None),
            LogEntry::Start | LogEntry::Commit => None,
        }
    }

    /// Buffer a PUT. `tree_has_space` is the caller's free-page check; a
    /// full buffer or an exhausted page store refuses the append, which
    /// forces a flush.
    pub fn try_put(&mut self, tree_has_space: bool, key: &[u8], value: &[u8]) -> Result<bool> {
        if !tree_has_space || self.is_full() {
            return Ok(false);
        }
        self.append_entry(LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        Ok(true)
    }

    /// Buffer a REMOVE under the same admission rules as `try_put`.
    pub fn try_remove(&mut self, tree_has_space: bool, key: &[u8]) -> Result<bool> {
        if !tree_has_space || self.is_full() {
            return Ok(false);
        }
        self.append_entry(LogEntry::Remove { key: key.to_vec() })?;
        Ok(true)
    }

    /// Append a PUT regardless of capacity. Used for the operation that
    /// overflows the buffer: it joins the log ahead of the forced flush so
    /// the coalesced replay keeps its value.
    pub fn force_put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append_entry(LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Append a REMOVE regardless of capacity.
    pub fn force_remove(&mut self, key: &[u8]) -> Result<()> {
        self.append_entry(LogEntry::Remove { key: key.to_vec() })
    }

    /// Append one committed transaction as a framed START..COMMIT batch.
    /// Commits are always accepted; the capacity check does not apply.
    pub fn push_transaction_logs(&mut self, batch: &[LogEntry]) -> Result<()> {
        self.append_entry(LogEntry::Start)?;
        for entry in batch {
            if entry.is_marker() {
                continue;
            }
            self.append_entry(entry.clone())?;
        }
        self.append_entry(LogEntry::Commit)
    }

    /// Drop everything, memory and disk. Called after a replay lands the
    /// buffered entries in the tree.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.index.clear();
        self.data_end = LOG_FILE_HEADER_SIZE as u64;
        self.truncate_file(self.data_end)?;
        self.write_header()
    }

    pub fn close(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| {
            eyre::Report::new(StoreError::File("log file is already closed".into()))
        })?;
        file.sync_all()
            .map_err(|e| StoreError::File(format!("log close failed: {}", e)))?;
        Ok(())
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<()> {
        let mut raw = vec![0u8; entry.byte_length()];
        entry.serialize(&mut raw)?;

        let offset = self.data_end;
        self.write_at(offset, &raw)?;
        self.data_end += raw.len() as u64;
        self.write_header()?;

        if let Some(key) = entry.key() {
            self.index
                .entry(key.to_vec())
                .or_default()
                .push(self.entries.len());
        }
        self.entries.push(entry);
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = LogFileHeader::new(self.data_end);
        let raw = header.as_bytes().to_vec();
        self.write_at(0, &raw)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            eyre::Report::new(StoreError::File("log file is closed".into()))
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.write_all(data)
            .map_err(|e| StoreError::File(format!("log write failed: {}", e)))?;
        file.sync_data()
            .map_err(|e| StoreError::File(format!("log flush failed: {}", e)))?;
        Ok(())
    }

    fn truncate_file(&mut self, len: u64) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            eyre::Report::new(StoreError::File("log file is closed".into()))
        })?;
        file.set_len(len)
            .map_err(|e| StoreError::File(format!("log truncate failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_buffer(dir: &std::path::Path, cap: usize) -> WriteAheadBuffer {
        WriteAheadBuffer::open(&dir.join("t.vole.log"), cap).unwrap()
    }

    #[test]
    fn put_then_find_answers_from_buffer() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 10);

        assert!(buffer.try_put(true, b"BMW", b"X6").unwrap());
        assert_eq!(buffer.find(b"BMW"), Some(Some(b"X6".as_slice())));
        assert_eq!(buffer.find(b"Mercedes"), None);
    }

    #[test]
    fn remove_shadows_an_earlier_put() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 10);

        buffer.try_put(true, b"BMW", b"X6").unwrap();
        buffer.try_remove(true, b"BMW").unwrap();

        assert_eq!(buffer.find(b"BMW"), Some(None));
    }

    #[test]
    fn full_buffer_refuses_appends() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 2);

        assert!(buffer.try_put(true, b"a", b"1").unwrap());
        assert!(buffer.try_put(true, b"b", b"2").unwrap());
        assert!(!buffer.try_put(true, b"c", b"3").unwrap());
        assert!(!buffer.try_remove(true, b"a").unwrap());
        assert!(buffer.is_full());
    }

    #[test]
    fn exhausted_page_store_refuses_appends() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 10);

        assert!(!buffer.try_put(false, b"a", b"1").unwrap());
        assert!(buffer.is_empty());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut buffer = open_buffer(dir.path(), 10);
            buffer.try_put(true, b"BMW", b"X6").unwrap();
            buffer.try_remove(true, b"Lada").unwrap();
            buffer.close().unwrap();
        }

        let buffer = open_buffer(dir.path(), 10);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.find(b"BMW"), Some(Some(b"X6".as_slice())));
        assert_eq!(buffer.find(b"Lada"), Some(None));
    }

    #[test]
    fn committed_transaction_is_framed() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 10);

        buffer
            .push_transaction_logs(&[
                LogEntry::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                },
                LogEntry::Remove { key: b"k2".to_vec() },
            ])
            .unwrap();

        assert_eq!(buffer.entries().first(), Some(&LogEntry::Start));
        assert_eq!(buffer.entries().last(), Some(&LogEntry::Commit));
        assert_eq!(buffer.find(b"k1"), Some(Some(b"v1".as_slice())));
    }

    #[test]
    fn capacity_does_not_apply_to_commits() {
        let dir = tempdir().unwrap();
        let mut buffer = open_buffer(dir.path(), 1);
        buffer.try_put(true, b"warm", b"up").unwrap();
        assert!(buffer.is_full());

        buffer
            .push_transaction_logs(&[LogEntry::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }])
            .unwrap();
        assert_eq!(buffer.find(b"k"), Some(Some(b"v".as_slice())));
    }

    #[test]
    fn reopen_discards_incomplete_trailing_transaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vole.log");
        {
            let mut buffer = WriteAheadBuffer::open(&path, 10).unwrap();
            buffer
                .push_transaction_logs(&[LogEntry::Put {
                    key: b"kept".to_vec(),
                    value: b"v".to_vec(),
                }])
                .unwrap();

            // Hand-append a START and one entry with no COMMIT, simulating a
            // crash mid-commit.
            buffer.append_entry(LogEntry::Start).unwrap();
            buffer
                .append_entry(LogEntry::Put {
                    key: b"lost".to_vec(),
                    value: b"v".to_vec(),
                })
                .unwrap();
            buffer.close().unwrap();
        }

        let buffer = WriteAheadBuffer::open(&path, 10).unwrap();
        assert_eq!(buffer.find(b"kept"), Some(Some(b"v".as_slice())));
        assert_eq!(buffer.find(b"lost"), None);
        assert_eq!(buffer.entries().last(), Some(&LogEntry::Commit));
    }

    #[test]
    fn reopen_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vole.log");
        let tail_start;
        {
            let mut buffer = WriteAheadBuffer::open(&path, 10).unwrap();
            buffer.try_put(true, b"good", b"entry").unwrap();
            tail_start = buffer.data_end;
            buffer.try_put(true, b"torn", b"entry").unwrap();
            buffer.close().unwrap();
        }

        // Corrupt the second entry's payload on disk.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(tail_start + 4)).unwrap();
            file.write_all(&[0xFF; 4]).unwrap();
        }

        let buffer = WriteAheadBuffer::open(&path, 10).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.find(b"good"), Some(Some(b"entry".as_slice())));
        assert_eq!(buffer.find(b"torn"), None);
    }

    #[test]
    fn clear_empties_memory_and_disk()  {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vole.log");
        {
            let mut buffer = WriteAheadBuffer::open(&path, 10).unwrap();
            buffer.try_put(true, b"BMW", b"X6").unwrap();
            buffer.clear().unwrap();
            assert!(buffer.is_empty());
            assert_eq!(buffer.find(b"BMW"), None);
            buffer.close().unwrap();
        }

        let reopened = WriteAheadBuffer::open(&path, 10).unwrap();
        assert!(reopened.is_empty());
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            LOG_FILE_HEADER_SIZE as u64
        );
    }
}
