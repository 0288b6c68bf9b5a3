//! # Meta Record
//!
//! Page 0 of every table file. Identifies the file as a voledb table and
//! records where everything else is.
//!
//! ## On-Disk Layout (32 bytes, rest of the page zero)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ---------------------------------------
//! 0       8     magic           b"VOLEDB\0\0" (includes terminator)
//! 8       8     root            root page number, 0 = empty tree
//! 16      8     free_list_page  page holding the serialized free list
//! 24      8     page_size       page size the file was created with
//! ```
//!
//! The meta page is rewritten whenever the root changes (inside the guarded
//! mutation, so its prior image is captured by the undo log) and when the
//! engine closes. A magic-word mismatch on open is a file error: the file is
//! foreign or corrupt, not merely empty.

use eyre::Result;

use crate::encoding::{get_u64, put_u64, U64_SIZE};
use crate::error::StoreError;

pub const META_MAGIC: &[u8; 8] = b"VOLEDB\0\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    root: u64,
    free_list_page: u64,
    page_size: u64,
}

impl Meta {
    pub const SERIALIZED_SIZE: usize = META_MAGIC.len() + 3 * U64_SIZE;

    pub fn new(page_size: u64) -> Self {
        Self {
            root: 0,
            free_list_page: 0,
            page_size,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn set_root(&mut self, root: u64) {
        self.root = root;
    }

    pub fn free_list_page(&self) -> u64 {
        self.free_list_page
    }

    pub fn set_free_list_page(&mut self, page_num: u64) {
        self.free_list_page = page_num;
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SERIALIZED_SIZE {
            eyre::bail!(StoreError::InsufficientBuffer(format!(
                "meta needs {} bytes, have {}",
                Self::SERIALIZED_SIZE,
                buf.len()
            )));
        }
        buf[..META_MAGIC.len()].copy_from_slice(META_MAGIC);
        let mut offset = META_MAGIC.len();
        put_u64(&mut buf[offset..], self.root)?;
        offset += U64_SIZE;
        put_u64(&mut buf[offset..], self.free_list_page)?;
        offset += U64_SIZE;
        put_u64(&mut buf[offset..], self.page_size)?;
        Ok(Self::SERIALIZED_SIZE)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SERIALIZED_SIZE {
            eyre::bail!(StoreError::CorruptedBuffer(format!(
                "meta needs {} bytes, have {}",
                Self::SERIALIZED_SIZE,
                buf.len()
            )));
        }
        if &buf[..META_MAGIC.len()] != META_MAGIC {
            eyre::bail!(StoreError::File(
                "magic word mismatch: not a voledb table file".into()
            ));
        }
        let mut offset = META_MAGIC.len();
        let root = get_u64(&buf[offset..])?;
        offset += U64_SIZE;
        let free_list_page = get_u64(&buf[offset..])?;
        offset += U64_SIZE;
        let page_size = get_u64(&buf[offset..])?;
        Ok(Self {
            root,
            free_list_page,
            page_size,
        })
    }
}
