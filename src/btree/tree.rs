//! # B-Tree Engine
//!
//! Ordered key lookup, insertion and deletion over page-resident nodes, with
//! split, merge and rotation rebalancing driven by serialized-size
//! thresholds rather than item counts:
//!
//! - a node over `max_fill_percent * page_size` (with more than one item) is
//!   split on the way back up from an insert;
//! - a node under `min_fill_percent * page_size` is repaired on the way back
//!   up from a remove: right-rotate from the left sibling, else left-rotate
//!   from the right sibling, else merge the right sibling into its left
//!   neighbor and release the emptied page.
//!
//! ## Descent
//!
//! Lookup descends from the root with a linear in-node scan for the first
//! item whose key is `>=` the search key; keys compare byte-wise over their
//! overlapping prefix length. The descent records an explicit ancestor stack
//! of `(page number, child index)` pairs, which the mutation paths walk
//! bottom-up.
//!
//! ## Crash Safety
//!
//! The tree holds no state beyond the current root page number. Every page
//! it overwrites, releases, or allocates during one mutation is first routed
//! through the [`UndoLog`]; the first such touch also snapshots the
//! free-list page, and root changes persist the meta page under the same
//! protection. The caller unwinds via `UndoLog::restore` when a mutation
//! fails partway.

use eyre::Result;
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::storage::{PageStore, META_PAGE_NUM};
use crate::wal::UndoLog;

use super::{Item, Node};

pub const MAX_TREE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy)]
struct PathEntry {
    page_num: u64,
    child_index: usize,
}

type AncestorStack = SmallVec<[PathEntry; MAX_TREE_DEPTH]>;

pub struct BTree<'a, P: PageStore> {
    store: &'a P,
    root: u64,
    min_fill_percent: f64,
    max_fill_percent: f64,
}

impl<'a, P: PageStore> BTree<'a, P> {
    pub fn new(store: &'a P, root: u64, min_fill_percent: f64, max_fill_percent: f64) -> Self {
        Self {
            store,
            root,
            min_fill_percent,
            max_fill_percent,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }
        let (hit, _) = self.find_key(key, true)?;
        Ok(hit.map(|(node, index)| node.items()[index].value().to_vec()))
    }

    pub fn put(&mut self, undo: &mut UndoLog, key: &[u8], value: &[u8]) -> Result<()> {
        let new_item = Item::new(key.to_vec(), value.to_vec());

        if self.root == 0 {
            let mut root_node = Node::new();
            root_node.add_item(new_item, 0);
            self.write_new_node(undo, &mut root_node)?;
            self.set_root(undo, root_node.page_num())?;
            return Ok(());
        }

        // Non-exact search always lands on a node: the insertion leaf, or an
        // internal node that already holds the key.
        let (hit, ancestors) = self.find_key(key, false)?;
        let (mut node, index) = hit.ok_or_else(|| {
            StoreError::CorruptedBuffer("non-exact search returned no node".into())
        })?;

        let replaces = index < node.items().len()
            && compare_keys(node.items()[index].key(), key) == std::cmp::Ordering::Equal;
        if replaces {
            node.items_mut()[index] = new_item;
        } else {
            node.add_item(new_item, index);
        }
        self.write_node(undo, &node)?;

        // Split over-populated nodes bottom-up, root last.
        for entry in ancestors.iter().rev() {
            let mut parent = self.read_node(entry.page_num)?;
            let child = self.read_node(parent.children()[entry.child_index])?;
            if self.is_over_populated(&child) {
                self.split(undo, &mut parent, child, entry.child_index)?;
                self.write_node(undo, &parent)?;
            }
        }

        let root_node = self.read_node(self.root)?;
        if self.is_over_populated(&root_node) {
            self.grow_root(undo, root_node)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, undo: &mut UndoLog, key: &[u8]) -> Result<()> {
        if self.root == 0 {
            return Ok(());
        }
        let (hit, mut ancestors) = self.find_key(key, true)?;
        let Some((mut node, index)) = hit else {
            // Removing an absent key is a no-op.
            return Ok(());
        };

        if node.is_leaf() {
            node.items_mut().remove(index);
            self.write_node(undo, &node)?;
        } else {
            self.remove_from_internal(undo, &mut node, index, &mut ancestors)?;
        }

        // Rebalance under-populated nodes bottom-up.
        for entry in ancestors.iter().rev() {
            let mut parent = self.read_node(entry.page_num)?;
            let child = self.read_node(parent.children()[entry.child_index])?;
            if self.is_under_populated(&child) {
                self.rebalance(undo, &mut parent, child, entry.child_index)?;
            }
        }

        self.shrink_root(undo)
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    fn find_key(&self, key: &[u8], exact: bool) -> Result<(Option<(Node, usize)>, AncestorStack)> {
        let mut ancestors = AncestorStack::new();
        let mut node = self.read_node(self.root)?;
        loop {
            let (index, found) = find_key_in_node(&node, key);
            if found {
                return Ok((Some((node, index)), ancestors));
            }
            if node.is_leaf() {
                if exact {
                    return Ok((None, ancestors));
                }
                return Ok((Some((node, index)), ancestors));
            }
            ancestors.push(PathEntry {
                page_num: node.page_num(),
                child_index: index,
            });
            let child_page = node.children()[index];
            node = self.read_node(child_page)?;
        }
    }

    // ------------------------------------------------------------------
    // Split path
    // ------------------------------------------------------------------

    fn max_threshold(&self) -> f64 {
        self.max_fill_percent * self.store.page_size() as f64
    }

    fn min_threshold(&self) -> f64 {
        self.min_fill_percent * self.store.page_size() as f64
    }

    fn is_over_populated(&self, node: &Node) -> bool {
        node.byte_length() as f64 > self.max_threshold() && node.items().len() > 1
    }

    fn is_under_populated(&self, node: &Node) -> bool {
        (node.byte_length() as f64) < self.min_threshold()
    }

    /// First index at which the cumulative header+item size passes the
    /// minimum threshold, excluding the last item so the right half is never
    /// the whole node. `None` means the node cannot yield a valid split.
    fn split_index(&self, node: &Node) -> Option<usize> {
        let mut size = node.header_byte_length();
        let item_count = node.items().len();
        for (i, item) in node.items().iter().enumerate() {
            size += item.byte_length();
            if size as f64 > self.min_threshold() && i < item_count - 1 {
                return Some(i + 1);
            }
        }
        None
    }

    /// Move everything after the split index into a freshly allocated
    /// sibling and promote the split item into `parent` (mutated in memory;
    /// the caller persists it).
    fn split(
        &mut self,
        undo: &mut UndoLog,
        parent: &mut Node,
        mut child: Node,
        child_index: usize,
    ) -> Result<()> {
        let split_index = self.split_index(&child).ok_or_else(|| {
            StoreError::InsertFailure(
                "split attempted on a node that cannot yield a valid split point".into(),
            )
        })?;

        let middle_item = child.items()[split_index].clone();
        let mut sibling = Node::new();
        sibling
            .items_mut()
            .extend(child.items_mut().drain(split_index + 1..));
        child.items_mut().truncate(split_index);
        if !child.is_leaf() {
            sibling
                .children_mut()
                .extend(child.children_mut().drain(split_index + 1..));
        }

        self.write_new_node(undo, &mut sibling)?;
        self.write_node(undo, &child)?;

        parent.add_item(middle_item, child_index);
        parent
            .children_mut()
            .insert(child_index + 1, sibling.page_num());
        Ok(())
    }

    /// Root overflow: the trimmed old root keeps its page, the sibling and
    /// the new root take fresh pages, and meta follows the new root.
    fn grow_root(&mut self, undo: &mut UndoLog, old_root: Node) -> Result<()> {
        let mut new_root = Node::new();
        new_root.children_mut().push(old_root.page_num());
        self.split(undo, &mut new_root, old_root, 0)?;
        self.write_new_node(undo, &mut new_root)?;
        self.set_root(undo, new_root.page_num())
    }

    // ------------------------------------------------------------------
    // Remove path
    // ------------------------------------------------------------------

    /// Replace an internal node's item with its in-order predecessor: the
    /// last item of the rightmost leaf of the item's left subtree. The
    /// predecessor is popped out of that leaf, and every node on the descent
    /// joins the ancestor stack for rebalancing.
    fn remove_from_internal(
        &mut self,
        undo: &mut UndoLog,
        node: &mut Node,
        item_index: usize,
        ancestors: &mut AncestorStack,
    ) -> Result<()> {
        ancestors.push(PathEntry {
            page_num: node.page_num(),
            child_index: item_index,
        });

        let mut current = self.read_node(node.children()[item_index])?;
        while !current.is_leaf() {
            let next_index = current.children().len() - 1;
            ancestors.push(PathEntry {
                page_num: current.page_num(),
                child_index: next_index,
            });
            current = self.read_node(current.children()[next_index])?;
        }

        let predecessor = current.items_mut().pop().ok_or_else(|| {
            StoreError::CorruptedBuffer("empty leaf on predecessor descent".into())
        })?;
        node.items_mut()[item_index] = predecessor;

        self.write_node(undo, node)?;
        self.write_node(undo, &current)
    }

    fn rebalance(
        &mut self,
        undo: &mut UndoLog,
        parent: &mut Node,
        mut node: Node,
        node_index: usize,
    ) -> Result<()> {
        if node_index > 0 {
            let mut left = self.read_node(parent.children()[node_index - 1])?;
            if !self.is_under_populated(&left) {
                right_rotate(&mut left, parent, &mut node, node_index)?;
                self.write_node(undo, &left)?;
                self.write_node(undo, &node)?;
                return self.write_node(undo, parent);
            }
        }

        if node_index < parent.children().len() - 1 {
            let mut right = self.read_node(parent.children()[node_index + 1])?;
            if !self.is_under_populated(&right) {
                left_rotate(&mut node, parent, &mut right, node_index)?;
                self.write_node(undo, &right)?;
                self.write_node(undo, &node)?;
                return self.write_node(undo, parent);
            }
        }

        // No sibling can lend an item: merge. The right sibling always folds
        // into its left neighbor, so an under-populated leftmost child
        // absorbs its right sibling instead.
        if parent.children().len() < 2 {
            return Ok(());
        }
        if node_index == 0 {
            self.merge(undo, parent, 1)
        } else {
            self.merge(undo, parent, node_index)
        }
    }

    /// Fold the child at `index` into its left neighbor and release its
    /// page. The separating parent item moves down into the merged node.
    fn merge(&mut self, undo: &mut UndoLog, parent: &mut Node, index: usize) -> Result<()> {
        let mut left = self.read_node(parent.children()[index - 1])?;
        let mut victim = self.read_node(parent.children()[index])?;

        let separator = parent.items_mut().remove(index - 1);
        parent.children_mut().remove(index);

        left.items_mut().push(separator);
        left.items_mut().append(victim.items_mut());
        if !left.is_leaf() {
            left.children_mut().append(victim.children_mut());
        }

        self.write_node(undo, &left)?;
        self.write_node(undo, parent)?;
        self.delete_node(undo, &victim)
    }

    /// After rebalancing: an itemless root demotes to its sole remaining
    /// child, or to the empty tree when it was a leaf. The abandoned page is
    /// released so it stays accounted for by the free list.
    fn shrink_root(&mut self, undo: &mut UndoLog) -> Result<()> {
        let root_node = self.read_node(self.root)?;
        if !root_node.items().is_empty() {
            return Ok(());
        }
        let new_root = if root_node.is_leaf() {
            0
        } else {
            root_node.children()[0]
        };
        self.delete_node(undo, &root_node)?;
        self.set_root(undo, new_root)
    }

    // ------------------------------------------------------------------
    // Page workflow
    // ------------------------------------------------------------------

    fn read_node(&self, page_num: u64) -> Result<Node> {
        let page = self.store.read_page(page_num)?;
        let mut node = Node::deserialize(page.data())?;
        node.set_page_num(page_num);
        Ok(node)
    }

    /// Write an existing node back to its page, capturing the prior on-disk
    /// image first.
    fn write_node(&mut self, undo: &mut UndoLog, node: &Node) -> Result<()> {
        undo.begin(self.store)?;
        let prior = self.store.read_page(node.page_num())?;
        undo.save_page(&prior)?;

        let mut page = self.store.allocate_empty_page();
        page.set_page_num(node.page_num());
        node.serialize(page.data_mut())?;
        self.store.write_page(&page)
    }

    /// Allocate a page for a new node and write it, recording the
    /// allocation for rollback.
    fn write_new_node(&mut self, undo: &mut UndoLog, node: &mut Node) -> Result<()> {
        undo.begin(self.store)?;
        let page_num = self.store.next_page()?;
        undo.record_allocation(page_num)?;
        node.set_page_num(page_num);

        let mut page = self.store.allocate_empty_page();
        page.set_page_num(page_num);
        node.serialize(page.data_mut())?;
        self.store.write_page(&page)
    }

    fn delete_node(&mut self, undo: &mut UndoLog, node: &Node) -> Result<()> {
        undo.begin(self.store)?;
        let prior = self.store.read_page(node.page_num())?;
        undo.save_page(&prior)?;
        self.store.release_page(node.page_num())
    }

    /// Root changes persist the meta page immediately, with its prior image
    /// captured, so a mid-mutation failure rolls the root back with the
    /// pages.
    fn set_root(&mut self, undo: &mut UndoLog, new_root: u64) -> Result<()> {
        undo.begin(self.store)?;
        let prior = self.store.read_page(META_PAGE_NUM)?;
        undo.save_page(&prior)?;
        self.store.set_root(new_root)?;
        self.root = new_root;
        Ok(())
    }
}

/// Byte-wise comparison over the overlapping prefix length. A key that
/// extends a shorter key compares equal to it; callers needing to tell such
/// keys apart must length-tag them.
pub fn compare_keys(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let overlap = a.len().min(b.len());
    a[..overlap].cmp(&b[..overlap])
}

/// Index of the first item whose key is `>=` `key`, plus whether it is an
/// exact match.
fn find_key_in_node(node: &Node, key: &[u8]) -> (usize, bool) {
    for (i, item) in node.items().iter().enumerate() {
        match compare_keys(item.key(), key) {
            std::cmp::Ordering::Equal => return (i, true),
            std::cmp::Ordering::Greater => return (i, false),
            std::cmp::Ordering::Less => {}
        }
    }
    (node.items().len(), false)
}

/// Move the left sibling's last item up into the parent separator slot and
/// the old separator down into `node`.
fn right_rotate(left: &mut Node, parent: &mut Node, node: &mut Node, node_index: usize) -> Result<()> {
    let moved = left
        .items_mut()
        .pop()
        .ok_or_else(|| StoreError::CorruptedBuffer("rotation source has no items".into()))?;
    let separator = std::mem::replace(&mut parent.items_mut()[node_index - 1], moved);
    node.items_mut().insert(0, separator);

    if !node.is_leaf() {
        let child = left
            .children_mut()
            .pop()
            .ok_or_else(|| StoreError::CorruptedBuffer("rotation source has no children".into()))?;
        node.children_mut().insert(0, child);
    }
    Ok(())
}

/// Move the right sibling's first item up into the parent separator slot
/// and the old separator down into `node`.
fn left_rotate(node: &mut Node, parent: &mut Node, right: &mut Node, node_index: usize) -> Result<()> {
    if right.items().is_empty() {
        eyre::bail!(StoreError::CorruptedBuffer("rotation source has no items".into()));
    }
    let moved = right.items_mut().remove(0);
    let separator = std::mem::replace(&mut parent.items_mut()[node_index], moved);
    node.items_mut().push(separator);

    if !node.is_leaf() {
        if right.children().is_empty() {
            eyre::bail!(StoreError::CorruptedBuffer("rotation source has no children".into()));
        }
        let child = right.children_mut().remove(0);
        node.children_mut().push(child);
    }
    Ok(())
}
