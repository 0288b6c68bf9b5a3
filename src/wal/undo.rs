//! # Undo Log
//!
//! Pre-image capture for in-place tree mutation. Before the first page
//! write or allocation of a mutation, the current free-list page image is
//! snapshotted; afterwards every overwritten page has its prior on-disk
//! image captured (once per page, so the first image is the pre-mutation
//! one) and every fresh allocation is recorded. Captures are flushed to
//! `<path>.mlog` **before** the corresponding main-file write lands, so the
//! record is durable by the time it is needed.
//!
//! On success the captured state is discarded. On failure `restore` releases
//! the recorded allocations and rewrites every captured image back to its
//! page, returning the file to its pre-mutation state even though several
//! page writes may already have landed. A process crash leaves the mlog
//! populated; the next open replays `restore` before serving anything.
//!
//! ## File Layout (page-structured, table page size)
//!
//! ```text
//! Page    Contents
//! ------  -----------------------------------------------
//! 0       64-byte header (magic, page size, list/data page numbers)
//! 1       dirty-page-number list   [8 count][8 x count]
//! 2       new-allocation list      [8 count][8 x count]
//! 3+      captured page images, in capture order
//! ```
//!
//! ## Discipline
//!
//! Not safe for concurrent mutation; the transaction coordinator's
//! single-writer lock is assumed, as it is for the tree itself.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use tracing::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::encoding::{get_u64, put_u64, U64_SIZE};
use crate::error::StoreError;
use crate::storage::{Page, PageStore};

pub const UNDO_MAGIC: &[u8; 8] = b"VOLEMLG\0";
pub const UNDO_FILE_HEADER_SIZE: usize = 64;

const DIRTY_LIST_PAGE: u64 = 1;
const ALLOC_LIST_PAGE: u64 = 2;
const DATA_START_PAGE: u64 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct UndoFileHeader {
    magic: [u8; 8],
    page_size: u64,
    dirty_list_page: u64,
    alloc_list_page: u64,
    data_start_page: u64,
    _reserved: [u8; 24],
}

impl UndoFileHeader {
    fn new(page_size: u64) -> Self {
        Self {
            magic: *UNDO_MAGIC,
            page_size,
            dirty_list_page: DIRTY_LIST_PAGE,
            alloc_list_page: ALLOC_LIST_PAGE,
            data_start_page: DATA_START_PAGE,
            _reserved: [0; 24],
        }
    }
}

/// Serializable list of page numbers: `[8-byte count][8 bytes per entry]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageNumList {
    nums: Vec<u64>,
}

impl PageNumList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, page_num: u64) {
        self.nums.push(page_num);
    }

    pub fn contains(&self, page_num: u64) -> bool {
        self.nums.contains(&page_num)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.nums
    }

    pub fn len(&self) -> usize {
        self.nums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nums.is_empty()
    }

    pub fn clear(&mut self) {
        self.nums.clear();
    }

    pub fn byte_length(&self) -> usize {
        (1 + self.nums.len()) * U64_SIZE
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.byte_length();
        if buf.len() < needed {
            eyre::bail!(StoreError::InsufficientBuffer(format!(
                "page list needs {} bytes, have {}",
                needed,
                buf.len()
            )));
        }
        put_u64(&mut buf[0..], self.nums.len() as u64)?;
        let mut offset = U64_SIZE;
        for num in &self.nums {
            put_u64(&mut buf[offset..], *num)?;
            offset += U64_SIZE;
        }
        Ok(needed)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "page list header needs {} bytes, have {}",
                U64_SIZE,
                buf.len()
            )));
        }
        let count = get_u64(buf)? as usize;
        let remaining = buf.len() - U64_SIZE;
        if remaining < count * U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "page list declares {} entries but only {} bytes remain",
                count, remaining
            )));
        }
        let mut nums = Vec::with_capacity(count);
        let mut offset = U64_SIZE;
        for _ in 0..count {
            nums.push(get_u64(&buf[offset..])?);
            offset += U64_SIZE;
        }
        Ok(Self { nums })
    }
}

#[derive(Debug)]
pub struct UndoLog {
    path: PathBuf,
    page_size: usize,
    file: Option<File>,
    dirty_pages: PageNumList,
    new_pages: PageNumList,
    captured: HashSet<u64>,
    active: bool,
}

impl UndoLog {
    /// Open or create the undo file. `page_size` is the owning table's page
    /// size; an existing file must agree with it.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path, page_size)
        } else {
            Self::create(path, page_size)
        }
    }

    fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create undo file at {:?}", path))?;

        let mut undo = Self {
            path: path.to_path_buf(),
            page_size,
            file: Some(file),
            dirty_pages: PageNumList::new(),
            new_pages: PageNumList::new(),
            captured: HashSet::new(),
            active: false,
        };
        undo.write_header()?;
        undo.write_lists()?;
        debug!(path = ?path, "created undo file");
        Ok(undo)
    }

    fn open_existing(path: &Path, page_size: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open undo file at {:?}", path))?;

        let mut raw = [0u8; UNDO_FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.read_exact(&mut raw)
            .map_err(|e| StoreError::File(format!("undo header read failed: {}", e)))?;
        let header = UndoFileHeader::read_from_bytes(&raw)
            .map_err(|e| eyre::eyre!("invalid undo file header: {:?}", e))?;

        if header.magic != *UNDO_MAGIC {
            eyre::bail!(StoreError::File(
                "magic word mismatch: not a voledb undo file".into()
            ));
        }
        if header.page_size != page_size as u64 {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "undo file page size {} does not match table page size {}",
                header.page_size, page_size
            )));
        }
        if header.dirty_list_page != DIRTY_LIST_PAGE
            || header.alloc_list_page != ALLOC_LIST_PAGE
            || header.data_start_page != DATA_START_PAGE
        {
            eyre::bail!(StoreError::CorruptedBuffer(
                "undo file header declares an unexpected page layout".into()
            ));
        }

        let mut undo = Self {
            path: path.to_path_buf(),
            page_size,
            file: Some(file),
            dirty_pages: PageNumList::new(),
            new_pages: PageNumList::new(),
            captured: HashSet::new(),
            active: false,
        };
        undo.dirty_pages = PageNumList::deserialize(&undo.read_raw(DIRTY_LIST_PAGE)?)?;
        undo.new_pages = PageNumList::deserialize(&undo.read_raw(ALLOC_LIST_PAGE)?)?;
        for num in undo.dirty_pages.as_slice() {
            undo.captured.insert(*num);
        }
        for num in undo.new_pages.as_slice() {
            undo.captured.insert(*num);
        }
        debug!(
            path = ?path,
            dirty = undo.dirty_pages.len(),
            allocated = undo.new_pages.len(),
            "opened undo file"
        );
        Ok(undo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when a previous mutation left captured state behind, the signal
    /// that open-time recovery must run.
    pub fn has_captured_state(&self) -> bool {
        !self.dirty_pages.is_empty() || !self.new_pages.is_empty()
    }

    pub fn dirty_pages(&self) -> &PageNumList {
        &self.dirty_pages
    }

    pub fn new_pages(&self) -> &PageNumList {
        &self.new_pages
    }

    /// Mark the start of a mutation: the first call snapshots the free-list
    /// page so allocation state can always be rolled back. Idempotent until
    /// `clear`.
    pub fn begin<P: PageStore>(&mut self, store: &P) -> Result<()> {
        if self.active {
            return Ok(());
        }
        self.active = true;
        let free_list_page = store.read_page(store.free_list_page())?;
        self.save_page(&free_list_page)
    }

    /// Capture the prior image of a page about to be overwritten. Only the
    /// first capture per page per mutation is kept; pages allocated during
    /// this mutation need no image.
    pub fn save_page(&mut self, page: &Page) -> Result<()> {
        if self.captured.contains(&page.page_num()) {
            return Ok(());
        }
        if page.data().len() != self.page_size {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "captured image is {} bytes, page size is {}",
                page.data().len(),
                self.page_size
            )));
        }
        let slot = DATA_START_PAGE + self.dirty_pages.len() as u64;
        self.write_raw(slot, page.data())?;

        self.dirty_pages.push(page.page_num());
        self.write_list(DIRTY_LIST_PAGE)?;
        self.captured.insert(page.page_num());
        Ok(())
    }

    /// Record a page freshly allocated by this mutation; rollback releases
    /// it instead of restoring an image.
    pub fn record_allocation(&mut self, page_num: u64) -> Result<()> {
        if self.new_pages.contains(page_num) {
            return Ok(());
        }
        self.new_pages.push(page_num);
        self.write_list(ALLOC_LIST_PAGE)?;
        self.captured.insert(page_num);
        Ok(())
    }

    /// Unwind a partially applied mutation: release every recorded
    /// allocation, then rewrite every captured image back to its page. The
    /// free-list image was captured first, so it is also rewritten, which is
    /// what makes the releases themselves safe to over-apply.
    pub fn restore<P: PageStore>(&mut self, store: &P) -> Result<()> {
        for page_num in self.new_pages.as_slice() {
            store.release_page(*page_num)?;
        }
        let dirty: Vec<u64> = self.dirty_pages.as_slice().to_vec();
        for (slot, page_num) in dirty.into_iter().enumerate() {
            let image = self.read_raw(DATA_START_PAGE + slot as u64)?;
            let page = Page::from_data(page_num, image);
            store.write_page(&page)?;
        }
        debug!(
            restored = self.dirty_pages.len(),
            released = self.new_pages.len(),
            "undo log restored pre-mutation state"
        );
        Ok(())
    }

    /// Discard all captured state after a successful mutation (or a
    /// completed restore).
    pub fn clear(&mut self) -> Result<()> {
        self.dirty_pages.clear();
        self.new_pages.clear();
        self.captured.clear();
        self.active = false;
        self.write_lists()
    }

    pub fn close(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| {
            eyre::Report::new(StoreError::File("undo file is already closed".into()))
        })?;
        file.sync_all()
            .map_err(|e| StoreError::File(format!("undo close failed: {}", e)))?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = UndoFileHeader::new(self.page_size as u64);
        let mut buf = vec![0u8; self.page_size];
        buf[..UNDO_FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.write_raw(0, &buf)
    }

    fn write_lists(&mut self) -> Result<()> {
        self.write_list(DIRTY_LIST_PAGE)?;
        self.write_list(ALLOC_LIST_PAGE)
    }

    fn write_list(&mut self, list_page: u64) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        match list_page {
            DIRTY_LIST_PAGE => self.dirty_pages.serialize(&mut buf)?,
            _ => self.new_pages.serialize(&mut buf)?,
        };
        self.write_raw(list_page, &buf)
    }

    fn write_raw(&mut self, page_num: u64, data: &[u8]) -> Result<()> {
        let offset = page_num * self.page_size as u64;
        let file = self.file.as_mut().ok_or_else(|| {
            eyre::Report::new(StoreError::File("undo file is closed".into()))
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.write_all(data)
            .map_err(|e| StoreError::File(format!("undo write failed: {}", e)))?;
        file.sync_data()
            .map_err(|e| StoreError::File(format!("undo flush failed: {}", e)))?;
        Ok(())
    }

    fn read_raw(&mut self, page_num: u64) -> Result<Vec<u8>> {
        let offset = page_num * self.page_size as u64;
        let mut data = vec![0u8; self.page_size];
        let file = self.file.as_mut().ok_or_else(|| {
            eyre::Report::new(StoreError::File("undo file is closed".into()))
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.read_exact(&mut data)
            .map_err(|e| StoreError::File(format!("undo read failed: {}", e)))?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::Pager;
    use tempfile::tempdir;

    fn fixture(dir: &std::path::Path) -> (Pager, UndoLog) {
        let settings = Settings {
            page_size: 1024,
            max_page: 64,
            ..Settings::default()
        };
        let pager = Pager::open(&dir.join("t.vole"), &settings).unwrap();
        let undo = UndoLog::open(&dir.join("t.vole.mlog"), 1024).unwrap();
        (pager, undo)
    }

    #[test]
    fn page_num_list_roundtrip() {
        let mut list = PageNumList::new();
        list.push(3);
        list.push(9);
        list.push(12);

        let mut buf = vec![0u8; list.byte_length()];
        list.serialize(&mut buf).unwrap();
        assert_eq!(PageNumList::deserialize(&buf).unwrap(), list);
    }

    #[test]
    fn page_num_list_rejects_truncated_buffer() {
        let mut list = PageNumList::new();
        list.push(1);
        list.push(2);

        let mut buf = vec![0u8; list.byte_length()];
        list.serialize(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);

        assert!(PageNumList::deserialize(&buf).is_err());
    }

    #[test]
    fn fresh_undo_log_has_no_captured_state() {
        let dir = tempdir().unwrap();
        let (_pager, undo) = fixture(dir.path());
        assert!(!undo.has_captured_state());
    }

    #[test]
    fn restore_rewrites_captured_images() {
        let dir = tempdir().unwrap();
        let (pager, mut undo) = fixture(dir.path());

        let page_num = pager.next_page().unwrap();
        let mut page = pager.allocate_empty_page();
        page.set_page_num(page_num);
        page.data_mut()[..5].copy_from_slice(b"prior");
        pager.write_page(&page).unwrap();

        undo.begin(&pager).unwrap();
        undo.save_page(&page).unwrap();

        let mut clobbered = pager.allocate_empty_page();
        clobbered.set_page_num(page_num);
        clobbered.data_mut()[..5].copy_from_slice(b"wreck");
        pager.write_page(&clobbered).unwrap();

        undo.restore(&pager).unwrap();
        undo.clear().unwrap();

        let read_back = pager.read_page(page_num).unwrap();
        assert_eq!(&read_back.data()[..5], b"prior");
        assert!(!undo.has_captured_state());
    }

    #[test]
    fn first_captured_image_wins() {
        let dir = tempdir().unwrap();
        let (pager, mut undo) = fixture(dir.path());

        let page_num = pager.next_page().unwrap();
        let mut original = pager.allocate_empty_page();
        original.set_page_num(page_num);
        original.data_mut()[..8].copy_from_slice(b"original");
        pager.write_page(&original).unwrap();

        undo.begin(&pager).unwrap();
        undo.save_page(&original).unwrap();

        // A second capture of the same page must not displace the first.
        let mut midway = original.clone();
        midway.data_mut()[..8].copy_from_slice(b"mid-way!");
        undo.save_page(&midway).unwrap();

        undo.restore(&pager).unwrap();
        let read_back = pager.read_page(page_num).unwrap();
        assert_eq!(&read_back.data()[..8], b"original");
    }

    #[test]
    fn restore_releases_recorded_allocations() {
        let dir = tempdir().unwrap();
        let (pager, mut undo) = fixture(dir.path());

        undo.begin(&pager).unwrap();
        let page_num = pager.next_page().unwrap();
        undo.record_allocation(page_num).unwrap();

        undo.restore(&pager).unwrap();
        undo.clear().unwrap();
        pager.reload().unwrap();

        // The allocation was unwound: the same page comes back first.
        assert_eq!(pager.next_page().unwrap(), page_num);
    }

    #[test]
    fn captured_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let mlog_path = dir.path().join("t.vole.mlog");
        let (pager, mut undo) = fixture(dir.path());

        let page_num = pager.next_page().unwrap();
        let mut page = pager.allocate_empty_page();
        page.set_page_num(page_num);
        pager.write_page(&page).unwrap();

        undo.begin(&pager).unwrap();
        undo.save_page(&page).unwrap();
        undo.record_allocation(7).unwrap();
        drop(undo);

        let reopened = UndoLog::open(&mlog_path, 1024).unwrap();
        assert!(reopened.has_captured_state());
        assert_eq!(reopened.new_pages().as_slice(), &[7]);
        // Free-list snapshot first, then the explicit capture.
        assert_eq!(reopened.dirty_pages().len(), 2);
        assert_eq!(reopened.dirty_pages().as_slice()[1], page_num);
    }

    #[test]
    fn reopen_rejects_mismatched_page_size() {
        let dir = tempdir().unwrap();
        let mlog_path = dir.path().join("t.vole.mlog");
        {
            let _ = UndoLog::open(&mlog_path, 1024).unwrap();
        }
        let err = UndoLog::open(&mlog_path, 2048).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptedBuffer(_))
        ));
    }
}
