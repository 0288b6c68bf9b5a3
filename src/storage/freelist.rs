//! # Free List
//!
//! Registry of allocatable page numbers. Pages released by tree rebalancing
//! are recycled before the file is grown, so mixed insert/delete workloads
//! do not bloat the file.
//!
//! ## Allocation Strategy
//!
//! `next_page` pops the most recently released page if any (LIFO reuse),
//! otherwise increments the high-water mark. When the high-water mark reaches the configured ceiling
//! and nothing is released, allocation fails with `AllocationExhausted`.
//!
//! ## On-Disk Layout (within the free-list page)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------
//! 0       8     max_page (allocation ceiling)
//! 8       8     current_max_page (high-water mark)
//! 16      8     released count
//! 24      8*N   released page numbers
//! ```
//!
//! ## Invariant
//!
//! Every page number in `[1, current_max_page]` is either live (reachable
//! from the tree, or the free-list page itself) or present in the released
//! set, never both and never neither. `release_page` does not validate that
//! the page was previously allocated; that discipline belongs to the caller
//! (double release is the classic way to hand one page to two nodes).

use eyre::Result;

use crate::encoding::{get_u64, put_u64, U64_SIZE};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    max_page: u64,
    current_max_page: u64,
    released: Vec<u64>,
}

impl FreeList {
    pub fn new(max_page: u64) -> Self {
        Self {
            max_page,
            current_max_page: 0,
            released: Vec::new(),
        }
    }

    pub fn max_page(&self) -> u64 {
        self.max_page
    }

    pub fn current_max_page(&self) -> u64 {
        self.current_max_page
    }

    pub fn released(&self) -> &[u64] {
        &self.released
    }

    pub fn next_page(&mut self) -> Result<u64> {
        if let Some(page_num) = self.released.pop() {
            return Ok(page_num);
        }
        if self.current_max_page == self.max_page {
            eyre::bail!(StoreError::AllocationExhausted(self.max_page));
        }
        self.current_max_page += 1;
        Ok(self.current_max_page)
    }

    pub fn release_page(&mut self, page_num: u64) {
        self.released.push(page_num);
    }

    /// Discard a grown region: pages numbered `start_page_num` and above
    /// become allocatable again and the high-water mark rolls back.
    pub fn release_all_from(&mut self, start_page_num: u64) {
        self.released.retain(|p| *p < start_page_num);
        if self.current_max_page >= start_page_num {
            self.current_max_page = start_page_num.saturating_sub(1);
        }
    }

    pub fn has_free_pages(&self) -> bool {
        self.current_max_page < self.max_page || !self.released.is_empty()
    }

    pub fn byte_length(&self) -> usize {
        (3 + self.released.len()) * U64_SIZE
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.byte_length();
        if buf.len() < needed {
            eyre::bail!(StoreError::InsufficientBuffer(format!(
                "free list needs {} bytes, have {}",
                needed,
                buf.len()
            )));
        }
        put_u64(&mut buf[0..], self.max_page)?;
        put_u64(&mut buf[U64_SIZE..], self.current_max_page)?;
        put_u64(&mut buf[2 * U64_SIZE..], self.released.len() as u64)?;
        let mut offset = 3 * U64_SIZE;
        for page_num in &self.released {
            put_u64(&mut buf[offset..], *page_num)?;
            offset += U64_SIZE;
        }
        Ok(needed)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 * U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "free list header needs {} bytes, have {}",
                3 * U64_SIZE,
                buf.len()
            )));
        }
        let max_page = get_u64(&buf[0..])?;
        let current_max_page = get_u64(&buf[U64_SIZE..])?;
        let count = get_u64(&buf[2 * U64_SIZE..])? as usize;

        let remaining = buf.len() - 3 * U64_SIZE;
        if remaining < count * U64_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "free list declares {} released pages but only {} bytes remain",
                count, remaining
            )));
        }
        let mut released = Vec::with_capacity(count);
        let mut offset = 3 * U64_SIZE;
        for _ in 0..count {
            released.push(get_u64(&buf[offset..])?);
            offset += U64_SIZE;
        }
        Ok(Self {
            max_page,
            current_max_page,
            released,
        })
    }
}
