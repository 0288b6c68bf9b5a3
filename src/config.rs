//! # Engine Settings
//!
//! Configuration for one table file. Validated once, before any I/O: a bad
//! page size must never reach the pager and fails with `StoreError::Config`
//! instead.
//!
//! | Setting                | Default | Constraint                    |
//! |------------------------|---------|-------------------------------|
//! | `page_size`            | 4096    | power of two, >= 1024         |
//! | `max_page`             | 65536   | > 0                           |
//! | `max_buffered_entries` | 100     | none                          |
//! | `min_fill_percent`     | 0.2     | 0 < min < max                 |
//! | `max_fill_percent`     | 0.95    | <= 1.0                        |
//!
//! `page_size` only applies when creating a file; reopening an existing file
//! takes the page size recorded in its meta page. The fill percentages drive
//! the B-tree's split and merge thresholds.

use eyre::Result;

use crate::error::StoreError;

pub const MIN_PAGE_SIZE: usize = 1024;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_MAX_PAGE: u64 = 65536;
pub const DEFAULT_MAX_BUFFERED_ENTRIES: usize = 100;
pub const DEFAULT_MIN_FILL_PERCENT: f64 = 0.2;
pub const DEFAULT_MAX_FILL_PERCENT: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Page size in bytes for newly created files. Power of two, >= 1024.
    pub page_size: usize,
    /// Hard ceiling on the number of pages the free list may ever hand out.
    pub max_page: u64,
    /// Write-ahead buffer capacity; appends beyond this force a flush.
    pub max_buffered_entries: usize,
    /// A node whose serialized size falls below `min_fill_percent *
    /// page_size` is rebalanced on remove.
    pub min_fill_percent: f64,
    /// A node whose serialized size exceeds `max_fill_percent * page_size`
    /// is split on insert.
    pub max_fill_percent: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_page: DEFAULT_MAX_PAGE,
            max_buffered_entries: DEFAULT_MAX_BUFFERED_ENTRIES,
            min_fill_percent: DEFAULT_MIN_FILL_PERCENT,
            max_fill_percent: DEFAULT_MAX_FILL_PERCENT,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            eyre::bail!(StoreError::Config(format!(
                "page_size {} is below the minimum of {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if !self.page_size.is_power_of_two() {
            eyre::bail!(StoreError::Config(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.max_page == 0 {
            eyre::bail!(StoreError::Config("max_page must be non-zero".into()));
        }
        if !(self.min_fill_percent > 0.0
            && self.min_fill_percent < self.max_fill_percent
            && self.max_fill_percent <= 1.0)
        {
            eyre::bail!(StoreError::Config(format!(
                "fill percentages must satisfy 0 < min ({}) < max ({}) <= 1",
                self.min_fill_percent, self.max_fill_percent
            )));
        }
        Ok(())
    }
}
