//! # Page File Access Layer
//!
//! Owns the backing file handle and the page-size contract. Every transfer
//! is seek + exact-size read/write + flush, with each failure reported
//! distinctly as a `File` error; a short read past the end of the file is a
//! `File` error too, never silently zero-padded.
//!
//! The pager also owns the two records that live inside the file, the meta
//! page and the free list, and persists them at the points the engine
//! requires: meta on root change and close, free list on allocate, release
//! and close.
//!
//! ## Concurrency
//!
//! Concurrent callers share the single file handle; access is serialized by
//! a mutex held for the duration of one page transfer, never across a
//! logical multi-page operation. The meta record and free list each sit
//! behind their own mutex so read-only tree descents never contend with
//! allocation bookkeeping.
//!
//! ## Lifecycle
//!
//! `open` creates the file (meta + empty free list) when missing, or reads
//! and validates the meta page when present; the magic word rejects foreign
//! files before anything else is interpreted. `close` persists meta and free
//! list and drops the handle; later calls fail with a `File` error.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use super::{FreeList, Meta, Page, PageStore, META_PAGE_NUM};
use crate::config::{Settings, MIN_PAGE_SIZE};
use crate::error::StoreError;

#[derive(Debug)]
pub struct Pager {
    path: PathBuf,
    page_size: usize,
    file: Mutex<Option<File>>,
    meta: Mutex<Meta>,
    free_list: Mutex<FreeList>,
}

impl Pager {
    /// Open the table file at `path`, creating and initializing it when it
    /// does not exist. Settings are validated before any I/O; on reopen the
    /// page size recorded in the file wins over `settings.page_size`.
    pub fn open(path: &Path, settings: &Settings) -> Result<Self> {
        settings.validate()?;

        if path.exists() {
            Self::open_existing(path)
        } else {
            Self::create(path, settings)
        }
    }

    fn create(path: &Path, settings: &Settings) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create table file at {:?}", path))?;

        let mut free_list = FreeList::new(settings.max_page);
        let free_list_page = free_list.next_page()?;

        let mut meta = Meta::new(settings.page_size as u64);
        meta.set_free_list_page(free_list_page);

        let pager = Self {
            path: path.to_path_buf(),
            page_size: settings.page_size,
            file: Mutex::new(Some(file)),
            meta: Mutex::new(meta),
            free_list: Mutex::new(free_list),
        };
        pager.write_meta()?;
        pager.write_free_list()?;

        debug!(path = ?path, page_size = settings.page_size, "created table file");
        Ok(pager)
    }

    fn open_existing(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open table file at {:?}", path))?;

        // The page size is only known after the meta page is parsed, so the
        // first read uses the smallest legal page size, which the meta record
        // always fits in.
        let mut prefix = vec![0u8; MIN_PAGE_SIZE];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
        file.read_exact(&mut prefix)
            .map_err(|e| short_read_error(e, META_PAGE_NUM))?;
        let meta = Meta::deserialize(&prefix)?;

        let page_size = meta.page_size() as usize;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "meta page declares invalid page size {}",
                page_size
            )));
        }

        let pager = Self {
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(Some(file)),
            meta: Mutex::new(meta),
            free_list: Mutex::new(FreeList::new(0)),
        };
        pager.read_free_list()?;

        debug!(path = ?path, page_size, root = pager.root(), "opened table file");
        Ok(pager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Re-read meta and free list from disk, discarding in-memory state.
    /// Used after the undo log rewrites their pages during recovery.
    pub fn reload(&self) -> Result<()> {
        let meta_page = self.read_page(META_PAGE_NUM)?;
        let meta = Meta::deserialize(meta_page.data())?;
        *self.meta.lock() = meta;
        self.read_free_list()?;
        Ok(())
    }

    /// Persist meta and free list, then drop the file handle. Further page
    /// operations fail with a `File` error.
    pub fn close(&self) -> Result<()> {
        self.write_meta()?;
        self.write_free_list()?;

        let file = self.file.lock().take().ok_or_else(|| {
            eyre::Report::new(StoreError::File("file handle is already closed".into()))
        })?;
        file.sync_all()
            .map_err(|e| StoreError::File(format!("close failed: {}", e)))?;
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let mut page = self.allocate_empty_page();
        page.set_page_num(META_PAGE_NUM);
        self.meta.lock().serialize(page.data_mut())?;
        self.write_page(&page)
    }

    fn write_free_list(&self) -> Result<()> {
        let mut page = self.allocate_empty_page();
        page.set_page_num(self.free_list_page());
        self.free_list.lock().serialize(page.data_mut())?;
        self.write_page(&page)
    }

    fn read_free_list(&self) -> Result<()> {
        let page = self.read_page(self.free_list_page())?;
        let free_list = FreeList::deserialize(page.data())?;
        *self.free_list.lock() = free_list;
        Ok(())
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| eyre::Report::new(StoreError::File("file handle is closed".into())))?;
        op(file)
    }
}

fn short_read_error(e: std::io::Error, page_num: u64) -> StoreError {
    if e.kind() == ErrorKind::UnexpectedEof {
        StoreError::File(format!("short read past end of file at page {}", page_num))
    } else {
        StoreError::File(format!("read failed at page {}: {}", page_num, e))
    }
}

impl PageStore for Pager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate_empty_page(&self) -> Page {
        Page::new(self.page_size)
    }

    fn read_page(&self, page_num: u64) -> Result<Page> {
        let offset = page_num * self.page_size as u64;
        let mut page = self.allocate_empty_page();
        page.set_page_num(page_num);

        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
            file.read_exact(page.data_mut())
                .map_err(|e| short_read_error(e, page_num))?;
            Ok(())
        })?;
        Ok(page)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let offset = page.page_num() * self.page_size as u64;

        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StoreError::File(format!("seek failed: {}", e)))?;
            file.write_all(page.data())
                .map_err(|e| StoreError::File(format!("write failed at page {}: {}", page.page_num(), e)))?;
            file.sync_data()
                .map_err(|e| StoreError::File(format!("flush failed: {}", e)))?;
            Ok(())
        })
    }

    fn next_page(&self) -> Result<u64> {
        if !self.is_open() {
            eyre::bail!(StoreError::File("file handle is closed".into()));
        }
        let page_num = self.free_list.lock().next_page()?;
        self.write_free_list()?;
        Ok(page_num)
    }

    fn release_page(&self, page_num: u64) -> Result<()> {
        if !self.is_open() {
            eyre::bail!(StoreError::File("file handle is closed".into()));
        }
        self.free_list.lock().release_page(page_num);
        self.write_free_list()
    }

    fn has_free_pages(&self) -> bool {
        self.is_open() && self.free_list.lock().has_free_pages()
    }

    fn root(&self) -> u64 {
        self.meta.lock().root()
    }

    fn set_root(&self, root: u64) -> Result<()> {
        self.meta.lock().set_root(root);
        self.write_meta()
    }

    fn free_list_page(&self) -> u64 {
        self.meta.lock().free_list_page()
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                tracing::warn!("pager close on drop failed: {:#}", e);
            }
        }
    }
}
