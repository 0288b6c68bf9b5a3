//! # voledb: Embedded Key-Value Storage Engine
//!
//! A single-process, single-file storage library providing ordered key
//! lookup, insertion and deletion by exact byte key. Fixed-size pages on a
//! backing file are organized as a B-tree; small writes are deferred through
//! a write-ahead buffer; and an undo log of pre-mutation page images makes
//! each tree mutation atomic against errors and process crashes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use voledb::{Settings, Table};
//!
//! # fn main() -> eyre::Result<()> {
//! let table = Table::open("./cars.vole", &Settings::default())?;
//!
//! table.put_str("BMW", "X6")?;
//! table.put_str("Mercedes", "CLS")?;
//! assert_eq!(table.find_str("BMW")?, Some("X6".into()));
//!
//! table.remove_str("BMW")?;
//! assert_eq!(table.find_str("BMW")?, None);
//!
//! table.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Database / Table / Transaction (facade) │
//! ├──────────────────────────────────────────┤
//! │  KvStore: RwLock, background flush       │
//! ├─────────────────────┬────────────────────┤
//! │  Write-Ahead Buffer │  B-Tree Engine     │
//! │  (<path>.log)       │  + Undo Log        │
//! │                     │  (<path>.mlog)     │
//! ├─────────────────────┴────────────────────┤
//! │  Pager: Meta, FreeList, page I/O         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Client call → transaction buffers the op → commit pushes a framed batch
//! into the write-ahead buffer → a full (or flushed) buffer replays into the
//! B-tree engine under undo-log protection → the engine reads and writes
//! pages through the pager, allocating from the free list.
//!
//! ## Files
//!
//! | File           | Contents                                             |
//! |----------------|------------------------------------------------------|
//! | `<path>`       | meta page 0, free-list page, B-tree node pages       |
//! | `<path>.log`   | write-ahead buffer: framed PUT/REMOVE/START/COMMIT   |
//! | `<path>.mlog`  | undo state: captured page images + fresh allocations |
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, meta record, free list, `PageStore` trait
//! - [`btree`]: item/node codecs and the tree engine
//! - [`wal`]: log entry codec, write-ahead buffer, undo log
//! - [`database`]: engine coordinator and the public facade
//!
//! ## Concurrency
//!
//! Any number of concurrent read transactions, or one exclusive write
//! transaction, per table. The engine serializes its own operations under a
//! reader/writer lock, page I/O under a per-file mutex, and runs at most one
//! background buffer flush at a time. The tree and undo log themselves
//! assume single-writer discipline, enforced above them.

pub mod btree;
pub mod config;
pub mod database;
pub mod encoding;
pub mod error;
pub mod storage;
pub mod wal;

pub use config::Settings;
pub use database::{str_key, Database, KvStore, Table, Transaction};
pub use error::StoreError;
