//! # Engine Coordinator
//!
//! One `KvStore` per table file. It owns the three collaborators (pager,
//! undo log, write-ahead buffer) behind a reader/writer lock and decides,
//! per call, whether an operation is answered from the buffer or reaches
//! the tree.
//!
//! ## Data Flow
//!
//! ```text
//! find   ── read lock ──> buffer (most recent entry) ──> tree
//! put    ── write lock ─> buffer append
//!                          └ full: forced append + background flush
//!                          └ no free pages: direct guarded tree mutation
//! flush  ── write lock ─> replay buffered entries into tree, clear
//! ```
//!
//! ## Recovery
//!
//! Every tree mutation runs guarded: on error the undo log releases fresh
//! allocations and rewrites captured pre-images, meta/free-list/root are
//! reloaded from disk, and the original error is re-raised. Recovery is a
//! side effect, never a success path. On open, captured undo state left by
//! a crashed process is replayed the same way before anything else runs.
//!
//! ## Background Flush
//!
//! A full buffer triggers a short-lived flush thread. At most one flush is
//! in flight: each new task first joins its predecessor's handle, then takes
//! the write lock. A background flush failure is logged and otherwise
//! unobservable to the call that triggered it; the buffer is left intact so
//! close (or the next flush) retries.
//!
//! The replay coalesces newest-first per key, so when an overflowing
//! operation joins the buffer ahead of the flush, the latest value for its
//! key is the one that lands in the tree. (The original engine this design
//! derives from wrote the overflowing key straight to the tree and replayed
//! older buffered entries over it afterwards; that stale-overwrite is a
//! recorded defect, not reproduced.)

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::btree::BTree;
use crate::config::Settings;
use crate::storage::{PageStore, Pager};
use crate::wal::{LogEntry, UndoLog, WriteAheadBuffer};

pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[derive(Debug)]
struct Inner {
    pager: Pager,
    undo: UndoLog,
    buffer: WriteAheadBuffer,
    root: u64,
}

struct StoreShared {
    path: PathBuf,
    min_fill_percent: f64,
    max_fill_percent: f64,
    state: RwLock<Inner>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StoreShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreShared")
            .field("path", &self.path)
            .field("min_fill_percent", &self.min_fill_percent)
            .field("max_fill_percent", &self.max_fill_percent)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct KvStore {
    shared: Arc<StoreShared>,
}

impl KvStore {
    pub fn open(path: &Path, settings: &Settings) -> Result<Self> {
        let pager = Pager::open(path, settings)?;
        let page_size = pager.page_size();

        let mut undo = UndoLog::open(&sibling_path(path, ".mlog"), page_size)?;
        if undo.has_captured_state() {
            info!(path = ?path, "replaying undo state from an interrupted mutation");
            undo.restore(&pager)?;
            undo.clear()?;
            pager.reload()?;
        }

        let buffer =
            WriteAheadBuffer::open(&sibling_path(path, ".log"), settings.max_buffered_entries)?;
        let root = pager.root();

        Ok(Self {
            shared: Arc::new(StoreShared {
                path: path.to_path_buf(),
                min_fill_percent: settings.min_fill_percent,
                max_fill_percent: settings.max_fill_percent,
                state: RwLock::new(Inner {
                    pager,
                    undo,
                    buffer,
                    root,
                }),
                flush_handle: Mutex::new(None),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Look up a key: the write-ahead buffer answers from its most recent
    /// entry (a REMOVE shadows the key), the tree otherwise.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.shared.state.read();
        if let Some(buffered) = inner.buffer.find(key) {
            return Ok(buffered.map(|v| v.to_vec()));
        }
        let tree = BTree::new(
            &inner.pager,
            inner.root,
            self.shared.min_fill_percent,
            self.shared.max_fill_percent,
        );
        tree.find(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let flush_needed = {
            let mut inner = self.shared.state.write();
            let tree_has_space = inner.pager.has_free_pages();
            if inner.buffer.try_put(tree_has_space, key, value)? {
                false
            } else if tree_has_space {
                // Buffer full: the op still joins the log so the coalesced
                // replay keeps its value, and a flush is forced.
                inner.buffer.force_put(key, value)?;
                true
            } else {
                // No free pages for a flush to consume; apply straight to
                // the tree and let any allocation failure surface here. The
                // buffer may still hold older entries for this key, so the
                // applied op joins it too, keeping the newest-per-key entry
                // in agreement with the tree across a later replay.
                self.shared.mutate(&mut inner, |tree, undo| tree.put(undo, key, value))?;
                inner.buffer.force_put(key, value)?;
                false
            }
        };
        if flush_needed {
            self.spawn_flush();
        }
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let flush_needed = {
            let mut inner = self.shared.state.write();
            let tree_has_space = inner.pager.has_free_pages();
            if inner.buffer.try_remove(tree_has_space, key)? {
                false
            } else if tree_has_space {
                inner.buffer.force_remove(key)?;
                true
            } else {
                self.shared.mutate(&mut inner, |tree, undo| tree.remove(undo, key))?;
                inner.buffer.force_remove(key)?;
                false
            }
        };
        if flush_needed {
            self.spawn_flush();
        }
        Ok(())
    }

    /// Append one committed transaction's entries as a framed batch.
    /// Commits are always accepted; a buffer pushed past capacity schedules
    /// a flush.
    pub fn push_transaction_logs(&self, batch: &[LogEntry]) -> Result<()> {
        let flush_needed = {
            let mut inner = self.shared.state.write();
            inner.buffer.push_transaction_logs(batch)?;
            inner.buffer.is_full()
        };
        if flush_needed {
            self.spawn_flush();
        }
        Ok(())
    }

    /// Synchronously replay the buffered entries into the tree and clear
    /// the log.
    pub fn flush(&self) -> Result<usize> {
        self.join_flush();
        let mut inner = self.shared.state.write();
        self.shared.push_log(&mut inner)
    }

    /// Flush the buffer, persist meta and free list, and close all three
    /// files. The handle is unusable afterwards.
    pub fn close(&self) -> Result<()> {
        self.join_flush();
        let mut inner = self.shared.state.write();
        self.shared.push_log(&mut inner)?;
        inner.buffer.close()?;
        inner.undo.close()?;
        inner.pager.close()?;
        info!(path = ?self.shared.path, "closed table file");
        Ok(())
    }

    fn join_flush(&self) {
        if let Some(handle) = self.shared.flush_handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Schedule a background flush. The new task joins the previous one
    /// before taking the write lock, so at most one flush is ever in
    /// flight.
    fn spawn_flush(&self) {
        let mut slot = self.shared.flush_handle.lock();
        let previous = slot.take();
        let shared = Arc::clone(&self.shared);
        *slot = Some(std::thread::spawn(move || {
            if let Some(handle) = previous {
                let _ = handle.join();
            }
            let mut inner = shared.state.write();
            if let Err(e) = shared.push_log(&mut inner) {
                warn!("background log flush failed: {:#}", e);
            }
        }));
    }
}

impl StoreShared {
    /// Run one guarded tree mutation: success commits the new root and
    /// clears the undo capture; failure unwinds the partial page writes,
    /// reloads meta/free-list/root from disk, and re-raises the original
    /// error.
    fn mutate<R>(
        &self,
        inner: &mut Inner,
        op: impl FnOnce(&mut BTree<'_, Pager>, &mut UndoLog) -> Result<R>,
    ) -> Result<R> {
        let Inner {
            pager, undo, root, ..
        } = inner;
        let mut tree = BTree::new(&*pager, *root, self.min_fill_percent, self.max_fill_percent);
        match op(&mut tree, undo) {
            Ok(result) => {
                *root = tree.root();
                undo.clear()?;
                Ok(result)
            }
            Err(e) => {
                recover(pager, undo, root);
                Err(e)
            }
        }
    }

    /// Replay the buffered entries into the tree, newest first with one
    /// application per key, then clear the buffer.
    fn push_log(&self, inner: &mut Inner) -> Result<usize> {
        if inner.buffer.is_empty() {
            return Ok(0);
        }
        let mut replayed = 0usize;
        {
            let Inner {
                pager,
                undo,
                buffer,
                root,
            } = inner;
            let mut seen: HashSet<&[u8]> = HashSet::new();
            for entry in buffer.entries().iter().rev() {
                let Some(key) = entry.key() else { continue };
                if !seen.insert(key) {
                    continue;
                }
                let mut tree =
                    BTree::new(&*pager, *root, self.min_fill_percent, self.max_fill_percent);
                let applied = match entry {
                    LogEntry::Put { key, value } => tree.put(undo, key, value),
                    LogEntry::Remove { key } => tree.remove(undo, key),
                    LogEntry::Start | LogEntry::Commit => unreachable!("markers carry no key"),
                };
                match applied {
                    Ok(()) => {
                        *root = tree.root();
                        undo.clear()?;
                        replayed += 1;
                    }
                    Err(e) => {
                        recover(pager, undo, root);
                        return Err(e);
                    }
                }
            }
        }
        inner.buffer.clear()?;
        debug!(replayed, "replayed write-ahead buffer into the tree");
        Ok(replayed)
    }
}

/// Best-effort unwind after a failed mutation. Failures here are logged and
/// swallowed so the mutation's own error stays the one the caller sees.
fn recover(pager: &Pager, undo: &mut UndoLog, root: &mut u64) {
    let outcome: Result<()> = (|| {
        undo.restore(pager)?;
        undo.clear()?;
        pager.reload()?;
        Ok(())
    })();
    if let Err(e) = outcome {
        warn!("recovery after failed mutation also failed: {:#}", e);
    }
    *root = pager.root();
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.join_flush();
        let mut inner = self.shared.state.write();
        if inner.pager.is_open() {
            if let Err(e) = self.shared.push_log(&mut inner) {
                warn!("final log flush on drop failed: {:#}", e);
            }
        }
    }
}
