//! Repairer. Given a broken [`ExtentRecord`], deletes every item the extent
//! tree holds for its byte range and reinserts a canonical set derived from
//! the reconciled backref list. Runs inside one logical write transaction:
//! any failed step aborts without touching the tree further.

use std::cell::Cell;

use zerocopy::IntoBytes;

use crate::check::extent::{Backref, ExtentRecord};
use crate::disk::items::{extent_flags, ExtentDataRef, ExtentItemHeader, SharedDataRef};
use crate::disk::key::Key;
use crate::disk::types::key_type;
use crate::error::{BtrfsError, Result};
use crate::tree::alloc::BlockAllocator;
use crate::tree::block_io::BlockIo;
use crate::tree::ops::{leaf, SlotMatch, TreeCursor};

pub struct Repairer<'a> {
    pub block_io: &'a BlockIo<'a>,
    pub alloc: &'a dyn BlockAllocator,
    /// Current extent-tree root. COW touches the root on every mutating
    /// call, and a split can change its level too, so both are tracked in
    /// cells and refreshed after each call rather than passed by value.
    pub extent_root_bytenr: Cell<u64>,
    pub extent_root_level: Cell<u8>,
    pub generation: u64,
}

const EXTENT_TREE_OWNER: u64 = crate::disk::types::BTRFS_EXTENT_TREE_OBJECTID;

impl<'a> Repairer<'a> {
    pub fn new(block_io: &'a BlockIo<'a>, alloc: &'a dyn BlockAllocator, extent_root_bytenr: u64, extent_root_level: u8, generation: u64) -> Self {
        Repairer {
            block_io,
            alloc,
            extent_root_bytenr: Cell::new(extent_root_bytenr),
            extent_root_level: Cell::new(extent_root_level),
            generation,
        }
    }

    /// Remove every item in the extent tree with `objectid == bytenr` and a
    /// type in the extent-ref family. Keys are sorted by objectid first, so
    /// once a key with a larger objectid is seen nothing later in the tree
    /// can match either.
    pub fn delete_extent_records(&self, bytenr: u64, len: u64) -> Result<()> {
        let _ = len;
        let cursor = TreeCursor::new(self.block_io);
        let floor = Key::floor(bytenr, 0);
        let (mut path, _) = cursor.search_slot(self.extent_root_bytenr.get(), self.extent_root_level.get(), floor)?;
        loop {
            let leaf_level = path.at(0).ok_or(BtrfsError::RepairAborted("empty path during delete_extent_records"))?.clone();
            let nritems = leaf_level.node.borrow().nritems() as usize;
            let mut slot = leaf_level.slot;
            let mut mutated = false;
            let mut past_range = false;
            while slot < nritems {
                let key = leaf_level.node.borrow().item_key(slot);
                if key.objectid != bytenr {
                    past_range = true;
                    break;
                }
                if is_extent_ref_family(key.item_type) || key.item_type == key_type::EXTENT_ITEM || key.item_type == key_type::METADATA_ITEM {
                    leaf::delete_item(&mut leaf_level.node.borrow_mut(), slot).map_err(|_| BtrfsError::RepairAborted("delete_item failed"))?;
                    mutated = true;
                } else {
                    slot += 1;
                }
            }
            if mutated {
                self.block_io.write_tree_block(&mut leaf_level.node.borrow_mut())?;
            }
            if past_range || !cursor.next_leaf(&mut path)? {
                if leaf_level.node.borrow().nritems() == 0 {
                    let (new_root_bytenr, new_root_level) = cursor.collapse_after_delete(&mut path)?;
                    self.extent_root_bytenr.set(new_root_bytenr);
                    self.extent_root_level.set(new_root_level);
                }
                return Ok(());
            }
        }
    }

    /// Insert one canonical `EXTENT_ITEM` plus one ref item per verified
    /// backref.
    pub fn recreate_extent(&self, rec: &ExtentRecord) -> Result<()> {
        let cursor = TreeCursor::new(self.block_io);
        let key = Key::new(rec.start, key_type::EXTENT_ITEM, rec.max_size);
        let header = ExtentItemHeader {
            refs: zerocopy::byteorder::little_endian::U64::new(rec.refs),
            generation: zerocopy::byteorder::little_endian::U64::new(self.generation),
            flags: zerocopy::byteorder::little_endian::U64::new(if rec.metadata { extent_flags::TREE_BLOCK } else { extent_flags::DATA }),
        };
        self.insert_item_with_split(&cursor, key, header.as_bytes())?;

        for backref in rec.backrefs() {
            let (ref_key, payload) = encode_backref(rec, backref);
            self.insert_item_with_split(&cursor, ref_key, &payload)?;
        }
        Ok(())
    }

    /// Insert one item, splitting the target leaf (and linking the split
    /// into the parent, recursing up to a new root if needed) when there's
    /// no room. `search_slot_cow` always COWs the root on the way down, so
    /// the tracked root bytenr/level are refreshed after every call here,
    /// split or not.
    fn insert_item_with_split(&self, cursor: &TreeCursor<'_>, key: Key, data: &[u8]) -> Result<()> {
        let (mut path, matched, new_root_bytenr) =
            cursor.search_slot_cow(self.extent_root_bytenr.get(), self.extent_root_level.get(), EXTENT_TREE_OWNER, self.generation, key, self.alloc)?;
        self.extent_root_bytenr.set(new_root_bytenr);
        if matched == SlotMatch::Exact {
            return Ok(());
        }
        let leaf_level = path.at(0).ok_or(BtrfsError::RepairAborted("empty path during insert"))?.clone();
        match leaf::insert_item(&mut leaf_level.node.borrow_mut(), key, data) {
            leaf::InsertOutcome::Inserted => {
                self.block_io.write_tree_block(&mut leaf_level.node.borrow_mut())?;
                Ok(())
            }
            leaf::InsertOutcome::NeedsSplit => {
                let new_bytenr = self.alloc.alloc_free_block(EXTENT_TREE_OWNER, leaf_level.node.borrow().len() as u64)?;
                let mut right = {
                    let mut left = leaf_level.node.borrow_mut();
                    leaf::split_leaf(&mut left, new_bytenr, EXTENT_TREE_OWNER, self.generation)
                };
                let goes_right = key >= right.item_key(0);
                let outcome = if goes_right {
                    leaf::insert_item(&mut right, key, data)
                } else {
                    leaf::insert_item(&mut leaf_level.node.borrow_mut(), key, data)
                };
                if matches!(outcome, leaf::InsertOutcome::NeedsSplit) {
                    return Err(BtrfsError::RepairAborted("item too large even after split"));
                }
                self.block_io.write_tree_block(&mut leaf_level.node.borrow_mut())?;
                self.block_io.write_tree_block(&mut right)?;

                let right_first_key = right.item_key(0);
                let right_bytenr = right.bytenr();
                cursor.insert_key_ptr(&mut path, 1, right_first_key, right_bytenr, self.generation, EXTENT_TREE_OWNER, self.alloc)?;

                let root = path
                    .at(path.root_level())
                    .ok_or(BtrfsError::RepairAborted("missing root after split"))?
                    .node
                    .borrow();
                self.extent_root_bytenr.set(root.bytenr());
                self.extent_root_level.set(path.root_level() as u8);
                Ok(())
            }
        }
    }
}

fn is_extent_ref_family(item_type: u8) -> bool {
    matches!(
        item_type,
        key_type::TREE_BLOCK_REF | key_type::EXTENT_DATA_REF | key_type::SHARED_BLOCK_REF | key_type::SHARED_DATA_REF | key_type::EXTENT_REF_V0
    )
}

/// Mirrors [`crate::check::extent_scan::decode_standalone_ref`] in reverse:
/// tree refs carry their parent/root entirely in `key.offset` (no payload,
/// matching the real on-disk format); data refs need a struct payload since
/// `(owner, offset[, count])` doesn't fit in one 64-bit key field.
fn encode_backref(rec: &ExtentRecord, br: Backref) -> (Key, Vec<u8>) {
    match br {
        Backref::Tree { parent_or_root, full_backref } => {
            let item_type = if full_backref { key_type::SHARED_BLOCK_REF } else { key_type::TREE_BLOCK_REF };
            (Key::new(rec.start, item_type, parent_or_root), Vec::new())
        }
        Backref::Data { parent_or_root, full_backref, owner, offset, num_refs, .. } => {
            if full_backref {
                let payload = SharedDataRef { count: zerocopy::byteorder::little_endian::U32::new(num_refs) };
                (Key::new(rec.start, key_type::SHARED_DATA_REF, parent_or_root), payload.as_bytes().to_vec())
            } else {
                let payload = ExtentDataRef {
                    root: zerocopy::byteorder::little_endian::U64::new(parent_or_root),
                    objectid: zerocopy::byteorder::little_endian::U64::new(owner),
                    offset: zerocopy::byteorder::little_endian::U64::new(offset),
                    count: zerocopy::byteorder::little_endian::U32::new(num_refs),
                };
                (Key::new(rec.start, key_type::EXTENT_DATA_REF, 0), payload.as_bytes().to_vec())
            }
        }
    }
}
