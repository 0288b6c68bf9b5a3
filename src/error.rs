//! # Error Kinds
//!
//! voledb reports failures through [`eyre::Report`] so call sites can attach
//! context with `wrap_err`, but every failure the engine itself originates is
//! one of the [`StoreError`] variants below. Callers that need to react to a
//! specific kind recover it with `report.downcast_ref::<StoreError>()`; the
//! chain is preserved across `wrap_err` layers.
//!
//! ## Propagation
//!
//! Codec and I/O errors are never retried. They propagate to the tree
//! mutation boundary, where the undo log unwinds partial page writes and the
//! original error is re-raised (see `database::store`). Transaction-level
//! errors (`UnknownTable`, `TransactionMisuse`) surface immediately without
//! touching storage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid configuration detected before any I/O (e.g. bad page size).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Closed handle, seek/read/write/flush failure, or magic-word mismatch.
    #[error("file error: {0}")]
    File(String),

    /// A buffer failed structural validation during deserialization.
    #[error("corrupted buffer: {0}")]
    CorruptedBuffer(String),

    /// A serialization target was smaller than the encoded form requires.
    #[error("insufficient buffer size: {0}")]
    InsufficientBuffer(String),

    /// The free list has no released pages and the allocation ceiling is hit.
    #[error("page allocation exhausted: all {0} pages in use")]
    AllocationExhausted(u64),

    /// A split was attempted on a node that cannot yield a valid split point.
    #[error("insert failure: {0}")]
    InsertFailure(String),

    /// A table code was not registered when the database was opened.
    #[error("unknown table code: {0}")]
    UnknownTable(String),

    /// An operation not permitted by the transaction's mode or state, such
    /// as a write under a read lock.
    #[error("transaction misuse: {0}")]
    TransactionMisuse(String),
}
