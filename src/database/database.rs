//! # Multi-Table Database
//!
//! A code-keyed group of tables opened together. The handle is an explicit
//! value owned and closed by the caller rather than process-global state. Per-table operations route by code; a
//! transaction may span several tables, acquiring (and later releasing)
//! their locks in the fixed order the caller supplies, which bounds
//! deadlock risk between concurrent multi-table transactions that use the
//! same order.

use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use tracing::info;

use super::table::Table;
use super::transaction::{Transaction, TxGuard, TxTable};
use crate::config::Settings;
use crate::error::StoreError;

#[derive(Debug)]
pub struct Database {
    tables: HashMap<String, Arc<Table>>,
    // Registration order, so close() walks tables deterministically.
    codes: Vec<String>,
}

impl Database {
    /// Open every `(code, path)` pair with the same settings. Codes are the
    /// names transactions and per-table calls route by.
    pub fn open<P: AsRef<Path>>(code_path_map: &[(&str, P)], settings: &Settings) -> Result<Self> {
        let mut tables = HashMap::new();
        let mut codes = Vec::new();
        for (code, path) in code_path_map {
            let table = Table::open(path.as_ref(), settings)?;
            if tables.insert(code.to_string(), Arc::new(table)).is_some() {
                eyre::bail!(StoreError::Config(format!(
                    "table code {:?} registered twice",
                    code
                )));
            }
            codes.push(code.to_string());
        }
        info!(tables = codes.len(), "opened database");
        Ok(Self { tables, codes })
    }

    pub fn table(&self, code: &str) -> Result<&Arc<Table>> {
        self.tables
            .get(code)
            .ok_or_else(|| eyre::Report::new(StoreError::UnknownTable(code.to_string())))
    }

    pub fn find(&self, code: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.table(code)?.find(key)
    }

    pub fn put(&self, code: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.table(code)?.put(key, value)
    }

    pub fn remove(&self, code: &str, key: &[u8]) -> Result<()> {
        self.table(code)?.remove(key)
    }

    pub fn find_str(&self, code: &str, key: &str) -> Result<Option<String>> {
        self.table(code)?.find_str(key)
    }

    pub fn put_str(&self, code: &str, key: &str, value: &str) -> Result<()> {
        self.table(code)?.put_str(key, value)
    }

    pub fn remove_str(&self, code: &str, key: &str) -> Result<()> {
        self.table(code)?.remove_str(key)
    }

    /// Begin a read transaction over `codes`, acquiring each table's shared
    /// lock in the order given.
    pub fn new_read_tx(&self, codes: &[&str]) -> Result<Transaction> {
        self.new_tx(codes, false)
    }

    /// Begin a write transaction over `codes`, acquiring each table's
    /// exclusive lock in the order given.
    pub fn new_write_tx(&self, codes: &[&str]) -> Result<Transaction> {
        self.new_tx(codes, true)
    }

    fn new_tx(&self, codes: &[&str], write: bool) -> Result<Transaction> {
        for (i, code) in codes.iter().enumerate() {
            if codes[..i].contains(code) {
                eyre::bail!(StoreError::TransactionMisuse(format!(
                    "table code {:?} listed twice in one transaction",
                    code
                )));
            }
        }
        let mut tx_tables = Vec::with_capacity(codes.len());
        for code in codes {
            let table = self.table(code)?;
            let guard = if write {
                TxGuard::Write(table.tx_lock().write_arc())
            } else {
                TxGuard::Read(table.tx_lock().read_arc())
            };
            tx_tables.push(TxTable::new(
                code.to_string(),
                Arc::clone(table.store()),
                guard,
            ));
        }
        Ok(Transaction::new(write, tx_tables))
    }

    /// Close every table: flush buffers, persist meta and free lists, drop
    /// file handles.
    pub fn close(&self) -> Result<()> {
        for code in &self.codes {
            self.tables[code].close()?;
        }
        Ok(())
    }
}
