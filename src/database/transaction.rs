//! # Transaction Coordinator
//!
//! Groups `find`/`put`/`remove` calls under table-level locks:
//!
//! ```text
//! idle ──> active(read)  ──> closed (commit | rollback | drop)
//! idle ──> active(write) ──> closed
//! ```
//!
//! A read transaction holds each table's lock shared; a write transaction
//! holds it exclusive. Closing is terminal and enforced by ownership:
//! `commit` and `rollback` consume the transaction, and dropping it releases
//! every lock: the "scoped acquisition with guaranteed release" shape of an
//! explicit resource.
//!
//! Writes are buffered entirely in memory, invisible to other transactions
//! and unpersisted until commit. Each table keeps its own entry list plus a
//! key → entry-position index so `find` answers from the transaction's own
//! most recent entry first (a buffered REMOVE means "absent"), falling
//! through to committed storage otherwise. `commit` pushes each table's
//! batch as one framed START..COMMIT group into that table's write-ahead
//! buffer; `rollback` discards everything without touching storage.
//!
//! Multiple tables join one transaction in a fixed caller-supplied order;
//! locks are acquired in that order (and released in it on drop) to bound
//! deadlock risk.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use super::store::KvStore;
use crate::error::StoreError;
use crate::wal::LogEntry;

#[derive(Debug)]
pub(crate) enum TxGuard {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

#[derive(Debug)]
pub(crate) struct TxTable {
    code: String,
    store: Arc<KvStore>,
    buffered: Vec<LogEntry>,
    index: HashMap<Vec<u8>, Vec<usize>>,
    _guard: TxGuard,
}

impl TxTable {
    pub(crate) fn new(code: String, store: Arc<KvStore>, guard: TxGuard) -> Self {
        Self {
            code,
            store,
            buffered: Vec::new(),
            index: HashMap::new(),
            _guard: guard,
        }
    }

    fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(position) = self.index.get(key).and_then(|p| p.last()) {
            return Ok(match &self.buffered[*position] {
                LogEntry::Put { value, .. } => Some(value.clone()),
                _ => None,
            });
        }
        self.store.find(key)
    }

    fn buffer(&mut self, entry: LogEntry) {
        if let Some(key) = entry.key() {
            self.index
                .entry(key.to_vec())
                .or_default()
                .push(self.buffered.len());
        }
        self.buffered.push(entry);
    }
}

#[derive(Debug)]
pub struct Transaction {
    write: bool,
    tables: Vec<TxTable>,
}

impl Transaction {
    pub(crate) fn new(write: bool, tables: Vec<TxTable>) -> Self {
        Self { write, tables }
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    fn sole_table(&self) -> Result<&TxTable> {
        if self.tables.len() != 1 {
            eyre::bail!(StoreError::TransactionMisuse(
                "transaction spans multiple tables; name one with the *_in methods".into()
            ));
        }
        Ok(&self.tables[0])
    }

    fn table(&mut self, code: &str) -> Result<&mut TxTable> {
        self.tables
            .iter_mut()
            .find(|t| t.code == code)
            .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(code.to_string())))
    }

    fn check_writable(&self) -> Result<()> {
        if !self.write {
            eyre::bail!(StoreError::TransactionMisuse(
                "write operation on a read transaction".into()
            ));
        }
        Ok(())
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.sole_table()?.find(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if self.tables.len() != 1 {
            eyre::bail!(StoreError::TransactionMisuse(
                "transaction spans multiple tables; name one with the *_in methods".into()
            ));
        }
        self.tables[0].buffer(LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        if self.tables.len() != 1 {
            eyre::bail!(StoreError::TransactionMisuse(
                "transaction spans multiple tables; name one with the *_in methods".into()
            ));
        }
        self.tables[0].buffer(LogEntry::Remove { key: key.to_vec() });
        Ok(())
    }

    pub fn find_in(&mut self, code: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.table(code)?.find(key)
    }

    pub fn put_in(&mut self, code: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let table = self.table(code)?;
        table.buffer(LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn remove_in(&mut self, code: &str, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let table = self.table(code)?;
        table.buffer(LogEntry::Remove { key: key.to_vec() });
        Ok(())
    }

    /// Push each table's buffered entries as one framed batch into its
    /// write-ahead buffer, then release every lock (in acquisition order,
    /// as the transaction drops).
    pub fn commit(mut self) -> Result<()> {
        if !self.write {
            return Ok(());
        }
        for table in &mut self.tables {
            if table.buffered.is_empty() {
                continue;
            }
            table.store.push_transaction_logs(&table.buffered)?;
            table.buffered.clear();
        }
        Ok(())
    }

    /// Discard the buffered writes and release every lock without touching
    /// storage.
    pub fn rollback(self) {
        // Dropping the transaction releases the guards; the buffers die
        // with it.
    }
}
