//! # Table Handle
//!
//! One table file, opened explicitly and closed explicitly (with `Drop` as a
//! best-effort backstop inside the engine). Auto-commit `find`/`put`/
//! `remove` delegate straight to the engine, which serializes them under its
//! own reader/writer lock; the table-level lock here exists for
//! transactions, which hold it shared (read) or exclusive (write) for their
//! whole lifetime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;

use super::store::KvStore;
use super::transaction::{Transaction, TxGuard, TxTable};
use super::str_key;
use crate::config::Settings;

#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    store: Arc<KvStore>,
    tx_lock: Arc<RwLock<()>>,
}

impl Table {
    pub fn open(path: impl AsRef<Path>, settings: &Settings) -> Result<Table> {
        let path = path.as_ref();
        let store = Arc::new(KvStore::open(path, settings)?);
        Ok(Self {
            path: path.to_path_buf(),
            store,
            tx_lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.find(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.put(key, value)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.store.remove(key)
    }

    /// String convenience over `find`; keys are NUL-terminated on disk so
    /// that prefixes of longer keys stay distinct.
    pub fn find_str(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .find(&str_key(key))?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    pub fn put_str(&self, key: &str, value: &str) -> Result<()> {
        self.put(&str_key(key), value.as_bytes())
    }

    pub fn remove_str(&self, key: &str) -> Result<()> {
        self.remove(&str_key(key))
    }

    /// Begin a read transaction: shared table lock, no write buffer. Blocks
    /// until no write transaction holds the lock.
    pub fn new_read_tx(&self) -> Transaction {
        let guard = TxGuard::Read(self.tx_lock.read_arc());
        Transaction::new(false, vec![TxTable::new(String::new(), Arc::clone(&self.store), guard)])
    }

    /// Begin a write transaction: exclusive table lock, writes buffered in
    /// memory until commit.
    pub fn new_write_tx(&self) -> Transaction {
        let guard = TxGuard::Write(self.tx_lock.write_arc());
        Transaction::new(true, vec![TxTable::new(String::new(), Arc::clone(&self.store), guard)])
    }

    pub(crate) fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub(crate) fn tx_lock(&self) -> &Arc<RwLock<()>> {
        &self.tx_lock
    }

    /// Flush the write-ahead buffer into the tree and close the backing
    /// files.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}
