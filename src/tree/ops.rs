//! Tree operations: search, COW, node/leaf item insert/delete, split, and
//! balance, over the block-buffer/key-codec layer.

use std::cell::RefCell;
use std::rc::Rc;

use crate::disk::key::Key;
use crate::disk::node::NodeBuffer;
use crate::disk::types::header_flags;
use crate::error::{BtrfsError, Result};
use crate::tree::alloc::BlockAllocator;
use crate::tree::block_io::BlockIo;
use crate::tree::path::{SharedNodeBuffer, TreePath};

const MIXED_BACKREF_REV: u8 = crate::disk::types::MIXED_BACKREF_REV;

/// Outcome of [`TreeCursor::search_slot`]: exact match or insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMatch {
    Exact,
    Insertion,
}

pub struct TreeCursor<'a> {
    pub block_io: &'a BlockIo<'a>,
}

impl<'a> TreeCursor<'a> {
    pub fn new(block_io: &'a BlockIo<'a>) -> Self {
        TreeCursor { block_io }
    }

    /// Descend from `(root_bytenr, root_level)` doing binary search at each
    /// level, writing the chosen slot into `path`. Read-only (no COW,
    /// matching every call site in the checker and the walker); COW'd
    /// descent for mutation lives in [`Self::search_slot_cow`].
    pub fn search_slot(&self, root_bytenr: u64, root_level: u8, key: Key) -> Result<(TreePath, SlotMatch)> {
        let mut path = TreePath::new();
        let mut bytenr = root_bytenr;
        let mut level = root_level;
        loop {
            let node = self.block_io.read_tree_block(bytenr)?;
            if node.level() != level {
                return Err(BtrfsError::CorruptBlock { bytenr, reason: "node level mismatch with parent pointer" });
            }
            let nritems = node.nritems() as usize;
            let bs = node.bin_search(key);
            let is_leaf = node.is_leaf();
            let shared: SharedNodeBuffer = Rc::new(RefCell::new(node));
            if is_leaf {
                let slot = match bs {
                    Ok(s) | Err(s) => s,
                };
                path.set(0, shared, slot);
                return Ok((path, if bs.is_ok() { SlotMatch::Exact } else { SlotMatch::Insertion }));
            }
            let child_slot = match bs {
                Ok(s) => s,
                Err(0) => 0,
                Err(s) => s - 1,
            };
            if child_slot >= nritems {
                return Err(BtrfsError::CorruptBlock { bytenr, reason: "search slot out of range" });
            }
            let child_bytenr = shared.borrow().node_blockptr(child_slot);
            path.set(level as usize, shared, child_slot);
            bytenr = child_bytenr;
            level = level.checked_sub(1).ok_or(BtrfsError::CorruptBlock { bytenr, reason: "leaf reached above level 0" })?;
        }
    }

    /// COW-ing descent used by the repairer: every node on the downward
    /// path is cloned to a fresh bytenr, stamped with `(MIXED_BACKREF_REV,
    /// owner, current transid)`, with `WRITTEN`/`RELOC` cleared; the
    /// parent's `key_ptr` is patched in place (and rewritten) once the
    /// child's new bytenr is known. Splitting on insert is handled by the
    /// caller: [`leaf::insert_item`] returning `NeedsSplit` triggers
    /// [`leaf::split_leaf`] plus [`Self::insert_key_ptr`] to link the new
    /// sibling into the parent (or promote a new root).
    pub fn search_slot_cow(
        &self,
        root_bytenr: u64,
        root_level: u8,
        owner: u64,
        generation: u64,
        key: Key,
        alloc: &dyn BlockAllocator,
    ) -> Result<(TreePath, SlotMatch, u64)> {
        let mut path = TreePath::new();
        let mut bytenr = root_bytenr;
        let mut level = root_level;
        let mut new_root_bytenr = root_bytenr;
        loop {
            let mut node = self.block_io.read_tree_block(bytenr)?;
            let cowed_bytenr = self.cow_node(&mut node, owner, generation, alloc)?;

            if level == root_level {
                new_root_bytenr = cowed_bytenr;
            } else {
                let parent_level = level as usize + 1;
                let parent = path.at(parent_level).expect("parent level already recorded by outer iteration");
                let key_at_slot = parent.node.borrow().node_key(parent.slot);
                parent.node.borrow_mut().set_node_key_ptr(parent.slot, key_at_slot, cowed_bytenr, generation);
                let mut parent_node = parent.node.borrow_mut();
                self.block_io.write_tree_block(&mut parent_node)?;
            }
            self.block_io.write_tree_block(&mut node)?;

            let nritems = node.nritems() as usize;
            let bs = node.bin_search(key);
            let is_leaf = node.is_leaf();
            let shared: SharedNodeBuffer = Rc::new(RefCell::new(node));
            if is_leaf {
                let slot = match bs {
                    Ok(s) | Err(s) => s,
                };
                path.set(0, shared, slot);
                return Ok((path, if bs.is_ok() { SlotMatch::Exact } else { SlotMatch::Insertion }, new_root_bytenr));
            }
            let child_slot = match bs {
                Ok(s) => s,
                Err(0) => 0,
                Err(s) => s - 1,
            };
            if child_slot >= nritems {
                return Err(BtrfsError::CorruptBlock { bytenr: cowed_bytenr, reason: "search slot out of range" });
            }
            bytenr = shared.borrow().node_blockptr(child_slot);
            path.set(level as usize, shared, child_slot);
            level = level.checked_sub(1).ok_or(BtrfsError::CorruptBlock { bytenr: cowed_bytenr, reason: "leaf reached above level 0" })?;
        }
    }

    /// Clone `node` into a freshly allocated block, stamping COW metadata.
    /// Returns the new bytenr.
    fn cow_node(&self, node: &mut NodeBuffer, owner: u64, generation: u64, alloc: &dyn BlockAllocator) -> Result<u64> {
        let needs_cow = node.generation() != generation || node.has_flag(header_flags::WRITTEN);
        let new_bytenr = if needs_cow {
            alloc.alloc_free_block(owner, node.len() as u64)?
        } else {
            node.bytenr()
        };
        node.set_bytenr(new_bytenr);
        node.set_owner(owner);
        node.set_generation(generation);
        node.set_backref_rev(MIXED_BACKREF_REV);
        node.set_flag(header_flags::WRITTEN, false);
        Ok(new_bytenr)
    }

    /// Link a node produced by a split into its parent, recursing upward
    /// (and splitting the parent in turn) as far as needed, promoting a new
    /// root if the split reaches the top of the tree.
    ///
    /// `path` must be the path a search/COW descent produced for the item
    /// that triggered the split, with every level from `level` up to
    /// `path.root_level()` already owned by this transaction (freshly
    /// COW'd or newly allocated) and therefore safe to mutate in place.
    /// `level` is the level of the node that needs a new child pointer: 1
    /// for a leaf split, 2 for a split one level up, and so on. After this
    /// call returns, re-read `path.root_level()` and
    /// `path.at(path.root_level())` — the root may have changed.
    pub fn insert_key_ptr(
        &self,
        path: &mut TreePath,
        level: usize,
        key: Key,
        blockptr: u64,
        generation: u64,
        owner: u64,
        alloc: &dyn BlockAllocator,
    ) -> Result<()> {
        if level > path.root_level() {
            let old_root = path
                .at(path.root_level())
                .ok_or(BtrfsError::Parse("insert_key_ptr: missing root level"))?
                .clone();
            let (old_bytenr, old_first_key, node_len) = {
                let node = old_root.node.borrow();
                (node.bytenr(), node.first_key(), node.len())
            };
            let new_root_bytenr = alloc.alloc_free_block(owner, node_len as u64)?;
            let mut new_root = NodeBuffer::zeroed(node_len);
            new_root.set_level(level as u8);
            new_root.set_bytenr(new_root_bytenr);
            new_root.set_owner(owner);
            new_root.set_generation(generation);
            new_root.set_backref_rev(MIXED_BACKREF_REV);
            new_root.set_nritems(0);
            new_root.insert_node_key_ptr(0, old_first_key, old_bytenr, generation);
            new_root.insert_node_key_ptr(1, key, blockptr, generation);
            self.block_io.write_tree_block(&mut new_root)?;
            path.set(level, Rc::new(RefCell::new(new_root)), 0);
            return Ok(());
        }

        let parent = path
            .at(level)
            .ok_or(BtrfsError::Parse("insert_key_ptr: missing parent level"))?
            .clone();
        let has_room = {
            let node = parent.node.borrow();
            (node.nritems() as usize) < node.max_node_ptrs()
        };
        if has_room {
            let slot = match parent.node.borrow().bin_search(key) {
                Ok(s) | Err(s) => s,
            };
            parent.node.borrow_mut().insert_node_key_ptr(slot, key, blockptr, generation);
            self.block_io.write_tree_block(&mut parent.node.borrow_mut())?;
            return Ok(());
        }

        let new_bytenr = alloc.alloc_free_block(owner, parent.node.borrow().len() as u64)?;
        let mut right = {
            let mut left = parent.node.borrow_mut();
            internal::split_node(&mut left, new_bytenr, owner, generation)
        };
        let goes_right = key >= right.first_key();
        if goes_right {
            let slot = match right.bin_search(key) {
                Ok(s) | Err(s) => s,
            };
            right.insert_node_key_ptr(slot, key, blockptr, generation);
        } else {
            let mut left = parent.node.borrow_mut();
            let slot = match left.bin_search(key) {
                Ok(s) | Err(s) => s,
            };
            left.insert_node_key_ptr(slot, key, blockptr, generation);
        }
        self.block_io.write_tree_block(&mut parent.node.borrow_mut())?;
        self.block_io.write_tree_block(&mut right)?;
        let right_first_key = right.first_key();
        let right_bytenr = right.bytenr();
        self.insert_key_ptr(path, level + 1, right_first_key, right_bytenr, generation, owner, alloc)
    }

    /// Undo the other direction of a delete: when a leaf at `path`'s level 0
    /// has been emptied by the caller, unlink its now-dangling key_ptr from
    /// its parent, and keep walking up unlinking empty ancestors. If the
    /// walk reaches the root and the root is left with a single child, that
    /// child is promoted to root (collapsing repeatedly if the promoted
    /// child is itself a singleton). Returns the tree's root bytenr and
    /// level after the adjustment, which may be unchanged.
    ///
    /// Only handles the boundary cases that keep the tree well-formed after
    /// a delete (empty node unlink, root collapse); it does not rebalance
    /// underfull siblings by merging or borrowing.
    pub fn collapse_after_delete(&self, path: &mut TreePath) -> Result<(u64, u8)> {
        let mut level = 0usize;
        loop {
            let empty = {
                let lvl = path.at(level).ok_or(BtrfsError::Parse("collapse_after_delete: missing level"))?;
                lvl.node.borrow().nritems() == 0
            };
            if !empty {
                break;
            }
            if level == path.root_level() {
                let root = path.at(level).unwrap().node.clone();
                let mut node = root.borrow_mut();
                node.set_level(0);
                let bytenr = node.bytenr();
                self.block_io.write_tree_block(&mut node)?;
                return Ok((bytenr, 0));
            }
            let parent_level = level + 1;
            let parent = path
                .at(parent_level)
                .ok_or(BtrfsError::Parse("collapse_after_delete: missing parent"))?
                .clone();
            parent.node.borrow_mut().delete_node_key_ptr(parent.slot);
            self.block_io.write_tree_block(&mut parent.node.borrow_mut())?;
            level = parent_level;
        }

        if level != path.root_level() {
            let root = path.at(path.root_level()).ok_or(BtrfsError::Parse("collapse_after_delete: missing root"))?;
            let node = root.node.borrow();
            return Ok((node.bytenr(), node.level()));
        }

        let root = path.at(level).unwrap().node.clone();
        let (nritems, is_leaf) = {
            let node = root.borrow();
            (node.nritems(), node.is_leaf())
        };
        if is_leaf || nritems != 1 {
            let node = root.borrow();
            return Ok((node.bytenr(), node.level()));
        }

        let mut bytenr = root.borrow().node_blockptr(0);
        let mut lvl = root.borrow().level() - 1;
        loop {
            let child = self.block_io.read_tree_block(bytenr)?;
            if child.is_leaf() || child.nritems() != 1 {
                break;
            }
            bytenr = child.node_blockptr(0);
            lvl = child.level() - 1;
        }
        Ok((bytenr, lvl))
    }

    /// Walk up from the leaf until a level has a right sibling slot, then
    /// re-descend along the leftmost child chain to the next leaf in key
    /// order.
    pub fn next_leaf(&self, path: &mut TreePath) -> Result<bool> {
        let mut level = 0usize;
        let bump_level = loop {
            if level + 1 > path.root_level() {
                return Ok(false);
            }
            let parent = path.at(level + 1).ok_or(BtrfsError::Parse("next_leaf: incomplete path"))?.clone();
            let parent_nritems = parent.node.borrow().nritems() as usize;
            if parent.slot + 1 < parent_nritems {
                break level + 1;
            }
            level += 1;
        };
        path.at_mut(bump_level).unwrap().slot += 1;
        self.redescend_leftmost(path, bump_level)?;
        Ok(true)
    }

    /// Symmetric to [`Self::next_leaf`]: move to the previous leaf.
    pub fn prev_leaf(&self, path: &mut TreePath) -> Result<bool> {
        let mut level = 0usize;
        let bump_level = loop {
            if level + 1 > path.root_level() {
                return Ok(false);
            }
            let parent = path.at(level + 1).ok_or(BtrfsError::Parse("prev_leaf: incomplete path"))?.clone();
            if parent.slot > 0 {
                break level + 1;
            }
            level += 1;
        };
        path.at_mut(bump_level).unwrap().slot -= 1;
        self.redescend_rightmost(path, bump_level)?;
        Ok(true)
    }

    /// Visit every leaf item from `start` (inclusive) to the end of the
    /// tree, depth-first left-to-right. Used by the orchestrator's
    /// tree-level scans (root/chunk/extent/csum), which, unlike the
    /// multi-tree walker, never need shared-node splicing since each of
    /// those trees has exactly one owner.
    pub fn for_each_item<F>(&self, root_bytenr: u64, root_level: u8, start: Key, mut f: F) -> Result<()>
    where
        F: FnMut(&NodeBuffer, usize) -> Result<()>,
    {
        let (mut path, _) = self.search_slot(root_bytenr, root_level, start)?;
        loop {
            let leaf_level = path.at(0).ok_or(BtrfsError::Parse("for_each_item: empty path"))?.clone();
            let node = leaf_level.node.borrow();
            let nritems = node.nritems() as usize;
            for slot in leaf_level.slot..nritems {
                f(&node, slot)?;
            }
            drop(node);
            if !self.next_leaf(&mut path)? {
                return Ok(());
            }
        }
    }

    fn redescend_leftmost(&self, path: &mut TreePath, from_level: usize) -> Result<()> {
        let mut cur = from_level;
        while cur > 0 {
            let bytenr = {
                let lvl = path.at(cur).ok_or(BtrfsError::Parse("redescend: missing level"))?;
                lvl.node.borrow().node_blockptr(lvl.slot)
            };
            let node = self.block_io.read_tree_block(bytenr)?;
            cur -= 1;
            let shared: SharedNodeBuffer = Rc::new(RefCell::new(node));
            path.set(cur, shared, 0);
        }
        Ok(())
    }

    fn redescend_rightmost(&self, path: &mut TreePath, from_level: usize) -> Result<()> {
        let mut cur = from_level;
        while cur > 0 {
            let bytenr = {
                let lvl = path.at(cur).ok_or(BtrfsError::Parse("redescend: missing level"))?;
                lvl.node.borrow().node_blockptr(lvl.slot)
            };
            let node = self.block_io.read_tree_block(bytenr)?;
            let last_slot = node.nritems().saturating_sub(1) as usize;
            cur -= 1;
            let shared: SharedNodeBuffer = Rc::new(RefCell::new(node));
            path.set(cur, shared, last_slot);
        }
        Ok(())
    }
}

/// Leaf-level item operations used directly by the repairer, which only
/// ever inserts or removes whole items rather than doing a general-purpose
/// insert-with-split across arbitrary fan-out. Splitting and parent-pointer
/// maintenance above the leaf live in [`TreeCursor::insert_key_ptr`] and
/// [`internal::split_node`].
pub mod leaf {
    use super::*;
    use crate::disk::node::DiskItem;

    pub const ITEM_LEN: usize = std::mem::size_of::<DiskItem>();

    pub enum InsertOutcome {
        Inserted,
        NeedsSplit,
    }

    /// Insert one item into a leaf buffer at its sorted position. Returns
    /// `NeedsSplit` without mutating the buffer if there isn't room
    /// (caller invokes [`split_leaf`] and retries on the correct half).
    pub fn insert_item(node: &mut NodeBuffer, key: Key, data: &[u8]) -> InsertOutcome {
        let needed = ITEM_LEN + data.len();
        if node.leaf_free_space() < needed {
            return InsertOutcome::NeedsSplit;
        }
        let slot = match node.bin_search(key) {
            Ok(s) => s,
            Err(s) => s,
        };
        let n = node.nritems() as usize;
        if slot < n {
            node.copy_item_descriptors(slot + 1, slot, n - slot);
        }
        let data_start = node.leaf_data_end() - data.len();
        node.set_item_descriptor(slot, key, data_start, data.len());
        node.set_item_data(data_start, data);
        node.set_nritems((n + 1) as u32);
        InsertOutcome::Inserted
    }

    /// Remove the item at `slot`, compacting the descriptor array. Item-data
    /// bytes below the removed item's offset are left in place (dead space
    /// is reclaimed on the next split rather than eagerly defragmented).
    pub fn delete_item(node: &mut NodeBuffer, slot: usize) -> Result<()> {
        let n = node.nritems() as usize;
        if slot >= n {
            return Err(BtrfsError::Parse("delete_item: slot out of range"));
        }
        if slot + 1 < n {
            node.copy_item_descriptors(slot, slot + 1, n - slot - 1);
        }
        node.set_nritems((n - 1) as u32);
        Ok(())
    }

    /// Split a full leaf in two at `(nritems+1)/2`. Returns the new
    /// right-hand leaf; caller is responsible for inserting a key_ptr for
    /// it into the parent (or promoting a new root, at the top level).
    pub fn split_leaf(node: &mut NodeBuffer, new_bytenr: u64, owner: u64, generation: u64) -> NodeBuffer {
        let n = node.nritems() as usize;
        let mid = (n + 1) / 2;
        let mut right = NodeBuffer::zeroed(node.len());
        right.set_level(0);
        right.set_bytenr(new_bytenr);
        right.set_owner(owner);
        right.set_generation(generation);
        right.set_backref_rev(MIXED_BACKREF_REV);

        let mut tail = right.payload_len();
        for (out_i, i) in (mid..n).enumerate() {
            let key = node.item_key(i);
            let data = node.item_data(i).to_vec();
            tail -= data.len();
            right.set_item_descriptor(out_i, key, tail, data.len());
            right.set_item_data(tail, &data);
        }
        right.set_nritems((n - mid) as u32);
        node.set_nritems(mid as u32);
        right
    }
}

/// Internal-node (key_ptr) split, mirroring [`leaf::split_leaf`] one level
/// up. Used by [`TreeCursor::insert_key_ptr`] when a parent has no room for
/// the new child pointer a leaf or lower-level split produced.
pub mod internal {
    use super::*;

    /// Split a full internal node in two at `(nritems+1)/2`. Returns the
    /// new right-hand node; linking it into the grandparent (or promoting a
    /// new root) is the caller's job.
    pub fn split_node(node: &mut NodeBuffer, new_bytenr: u64, owner: u64, generation: u64) -> NodeBuffer {
        let n = node.nritems() as usize;
        let mid = (n + 1) / 2;
        let mut right = NodeBuffer::zeroed(node.len());
        right.set_level(node.level());
        right.set_bytenr(new_bytenr);
        right.set_owner(owner);
        right.set_generation(generation);
        right.set_backref_rev(MIXED_BACKREF_REV);

        for (out_i, i) in (mid..n).enumerate() {
            let key = node.node_key(i);
            let blockptr = node.node_blockptr(i);
            let ptr_generation = node.node_ptr_generation(i);
            right.set_node_key_ptr(out_i, key, blockptr, ptr_generation);
        }
        right.set_nritems((n - mid) as u32);
        node.set_nritems(mid as u32);
        right
    }
}

#[cfg(test)]
mod tests {
    use super::leaf::*;
    use super::*;

    fn make_leaf(nodesize: usize, items: &[(Key, Vec<u8>)]) -> NodeBuffer {
        let mut nb = NodeBuffer::zeroed(nodesize);
        nb.set_level(0);
        nb.set_nritems(0);
        for (k, data) in items {
            match insert_item(&mut nb, *k, data) {
                InsertOutcome::Inserted => {}
                InsertOutcome::NeedsSplit => panic!("test fixture leaf overflowed"),
            }
        }
        nb
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let items = vec![
            (Key::new(3, 1, 0), b"c".to_vec()),
            (Key::new(1, 1, 0), b"a".to_vec()),
            (Key::new(2, 1, 0), b"b".to_vec()),
        ];
        let nb = make_leaf(4096, &items);
        assert_eq!(nb.nritems(), 3);
        assert_eq!(nb.item_key(0), Key::new(1, 1, 0));
        assert_eq!(nb.item_key(1), Key::new(2, 1, 0));
        assert_eq!(nb.item_key(2), Key::new(3, 1, 0));
    }

    #[test]
    fn delete_then_reinsert() {
        let items = vec![
            (Key::new(1, 1, 0), b"a".to_vec()),
            (Key::new(2, 1, 0), b"bb".to_vec()),
            (Key::new(3, 1, 0), b"ccc".to_vec()),
        ];
        let mut nb = make_leaf(4096, &items);
        delete_item(&mut nb, 1).unwrap();
        assert_eq!(nb.nritems(), 2);
        assert_eq!(nb.item_key(0), Key::new(1, 1, 0));
        assert_eq!(nb.item_key(1), Key::new(3, 1, 0));
        insert_item(&mut nb, Key::new(2, 1, 0), b"bb");
        assert_eq!(nb.nritems(), 3);
        assert_eq!(nb.item_data(1), b"bb");
    }

    #[test]
    fn split_leaf_divides_items() {
        let items: Vec<(Key, Vec<u8>)> = (0..20).map(|i| (Key::new(i, 1, 0), vec![b'x'; 8])).collect();
        let mut nb = make_leaf(512, &items);
        let n = nb.nritems();
        let right = split_leaf(&mut nb, 999, 5, 7);
        assert_eq!(nb.nritems() + right.nritems(), n);
        assert!(nb.item_key(nb.nritems() as usize - 1) < right.item_key(0));
        assert_eq!(right.bytenr(), 999);
    }

    fn make_internal(nodesize: usize, level: u8, ptrs: &[(Key, u64)]) -> NodeBuffer {
        let mut nb = NodeBuffer::zeroed(nodesize);
        nb.set_level(level);
        nb.set_nritems(0);
        for (i, (k, blockptr)) in ptrs.iter().enumerate() {
            nb.insert_node_key_ptr(i, *k, *blockptr, 1);
        }
        nb
    }

    #[test]
    fn split_node_divides_key_ptrs() {
        let ptrs: Vec<(Key, u64)> = (0..30).map(|i| (Key::new(i, 1, 0), 100 + i)).collect();
        let mut nb = make_internal(256, 1, &ptrs);
        let n = nb.nritems();
        let right = internal::split_node(&mut nb, 999, 5, 7);
        assert_eq!(nb.nritems() + right.nritems(), n);
        assert!(nb.node_key(nb.nritems() as usize - 1) < right.node_key(0));
        assert_eq!(right.bytenr(), 999);
        assert_eq!(right.level(), 1);
    }

    #[test]
    fn insert_node_key_ptr_shifts_tail() {
        let ptrs = vec![(Key::new(1, 1, 0), 100), (Key::new(3, 1, 0), 300)];
        let mut nb = make_internal(256, 1, &ptrs);
        nb.insert_node_key_ptr(1, Key::new(2, 1, 0), 200, 1);
        assert_eq!(nb.nritems(), 3);
        assert_eq!(nb.node_key(0), Key::new(1, 1, 0));
        assert_eq!(nb.node_key(1), Key::new(2, 1, 0));
        assert_eq!(nb.node_blockptr(1), 200);
        assert_eq!(nb.node_key(2), Key::new(3, 1, 0));
    }

    #[test]
    fn delete_node_key_ptr_compacts() {
        let ptrs = vec![(Key::new(1, 1, 0), 100), (Key::new(2, 1, 0), 200), (Key::new(3, 1, 0), 300)];
        let mut nb = make_internal(256, 1, &ptrs);
        nb.delete_node_key_ptr(1);
        assert_eq!(nb.nritems(), 2);
        assert_eq!(nb.node_key(0), Key::new(1, 1, 0));
        assert_eq!(nb.node_key(1), Key::new(3, 1, 0));
    }
}
