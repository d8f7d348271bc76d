//! Concrete [`crate::walk::LeafVisitor`]/[`crate::walk::RefObserver`]
//! implementations: the glue between the generic walker and the per-item
//! processing functions, dispatching on each leaf item's key type.

use std::collections::{HashMap, HashSet};

use crate::check::extent::{Backref, ExtentRecord};
use crate::check::inode::{process_dir_item, process_file_extent, process_inode_item, process_inode_ref, InodeRecord};
use crate::disk::items::{parse_dir_items, parse_inode_extrefs, parse_inode_refs, FileExtentItem, InodeItem};
use crate::disk::node::NodeBuffer;
use crate::disk::types::key_type;
use crate::error::Result;
use crate::walk::{LeafVisitor, RefObserver};

/// Dispatches every leaf item of an fs-tree to the matching `process_*`
/// function, additionally feeding "walked" data backrefs into the extent
/// reconciler as `EXTENT_DATA` items are seen. One instance
/// is built fresh per subvolume root (`owner`/`full_backref` are per-root;
/// `orphans` is accumulated across the whole run by the orchestrator
/// reusing the `HashSet` between roots).
pub struct FsTreeVisitor<'a> {
    pub sectorsize: u64,
    /// Objectids of inodes with an `ORPHAN_ITEM`, fed into the per-root
    /// final pass's `has_orphan_item` check.
    pub orphans: HashSet<u64>,
    /// Extent records keyed by `disk_bytenr`, shared with the extent-tree
    /// scan so data backrefs land on the same record the declared side
    /// populates.
    pub extents: &'a mut HashMap<u64, ExtentRecord>,
    /// This root's objectid (the owning fs-tree, or the `ROOT_REF` source
    /// for a full-backref-eligible reloc tree).
    pub owner: u64,
    pub full_backref: bool,
}

impl<'a> FsTreeVisitor<'a> {
    pub fn new(sectorsize: u64, extents: &'a mut HashMap<u64, ExtentRecord>, owner: u64, full_backref: bool) -> Self {
        FsTreeVisitor { sectorsize, orphans: HashSet::new(), extents, owner, full_backref }
    }
}

impl<'a> LeafVisitor for FsTreeVisitor<'a> {
    fn visit(&mut self, node: &NodeBuffer, slot: usize, acc: &mut HashMap<u64, InodeRecord>) -> Result<()> {
        let key = node.item_key(slot);
        let data = node.item_data(slot);

        match key.item_type {
            key_type::INODE_ITEM => {
                let item = InodeItem::parse(data)?;
                let rec = acc.entry(key.objectid).or_insert_with(|| InodeRecord::new(key.objectid));
                process_inode_item(rec, item);
            }
            key_type::INODE_REF => {
                for entry in parse_inode_refs(data)? {
                    let rec = acc.entry(key.objectid).or_insert_with(|| InodeRecord::new(key.objectid));
                    process_inode_ref(rec, key.offset, entry.index, entry.name, false);
                }
            }
            key_type::INODE_EXTREF => {
                for entry in parse_inode_extrefs(data)? {
                    let rec = acc.entry(key.objectid).or_insert_with(|| InodeRecord::new(key.objectid));
                    process_inode_ref(rec, entry.parent_objectid, entry.index, entry.name, true);
                }
            }
            key_type::DIR_ITEM | key_type::DIR_INDEX => {
                let entries = parse_dir_items(data)?;
                let dup_in_slot = key.item_type == key_type::DIR_INDEX && entries.len() > 1;
                for entry in &entries {
                    let rec = acc.entry(entry.location.objectid).or_insert_with(|| InodeRecord::new(entry.location.objectid));
                    process_dir_item(rec, key.objectid, key.offset, key.item_type, entry, dup_in_slot);
                }
            }
            key_type::EXTENT_DATA => {
                let item = FileExtentItem::parse(data)?;
                let rec = acc.entry(key.objectid).or_insert_with(|| InodeRecord::new(key.objectid));
                process_file_extent(rec, key.offset, &item, self.sectorsize);
                self.observe_data_backref(node.bytenr(), key.objectid, key.offset, &item);
            }
            key_type::ORPHAN_ITEM => {
                self.orphans.insert(key.offset);
            }
            _ => {}
        }
        Ok(())
    }
}

impl<'a> FsTreeVisitor<'a> {
    /// Feeds the extent reconciler a `Backref::Data` for a non-hole
    /// `EXTENT_DATA` item: every file extent is a data backref on the
    /// extent it points at.
    fn observe_data_backref(&mut self, leaf_bytenr: u64, ino: u64, key_offset: u64, item: &FileExtentItem) {
        let Some(reg) = &item.regular else { return };
        let bytenr = reg.disk_bytenr.get();
        if bytenr == 0 {
            return;
        }
        let Some(rec) = self.extents.get_mut(&bytenr) else { return };
        let parent_or_root = if self.full_backref { leaf_bytenr } else { self.owner };
        let br = Backref::Data {
            parent_or_root,
            full_backref: self.full_backref,
            owner: ino,
            offset: key_offset.saturating_sub(reg.offset.get()),
            bytes: reg.disk_num_bytes.get(),
            num_refs: 0,
            found_ref: 0,
        };
        rec.mark_found_ref(br);
    }
}

/// Feeds "walked" tree backrefs into the extent reconciler as the walker
/// descends every internal-node pointer. Lives on
/// `FsTreeVisitor` itself (rather than a separate observer type) so one
/// `&mut` borrow of the shared `extents` map serves both roles the walker
/// needs during a single pass.
impl<'a> RefObserver for FsTreeVisitor<'a> {
    fn observe_tree_block(&mut self, bytenr: u64, owner: u64, parent: Option<u64>, generation: u64, full_backref: bool) {
        let Some(rec) = self.extents.get_mut(&bytenr) else { return };
        let br = match (parent, full_backref) {
            (Some(p), true) => Backref::Tree { parent_or_root: p, full_backref: true },
            _ => Backref::Tree { parent_or_root: owner, full_backref: false },
        };
        rec.mark_found_ref(br);
        if rec.generation == generation {
            rec.content_checked = true;
        }
        if rec.find_tree_backref(0, owner).is_some() {
            rec.owner_ref_checked = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::key::Key;

    fn make_leaf_with_inode_item(ino: u64, nlink: u32) -> NodeBuffer {
        use crate::disk::items::{InodeItem, Timespec};
        use zerocopy::byteorder::little_endian::{U32, U64};
        use zerocopy::IntoBytes;

        let item = InodeItem {
            generation: U64::new(1),
            transid: U64::new(1),
            size: U64::new(0),
            nbytes: U64::new(0),
            block_group: U64::new(0),
            nlink: U32::new(nlink),
            uid: U32::new(0),
            gid: U32::new(0),
            mode: U32::new(crate::disk::types::S_IFREG),
            rdev: U64::new(0),
            flags: U64::new(0),
            sequence: U64::new(0),
            reserved: [U64::new(0); 4],
            atime: Timespec { sec: U64::new(0), nsec: U32::new(0) },
            ctime: Timespec { sec: U64::new(0), nsec: U32::new(0) },
            mtime: Timespec { sec: U64::new(0), nsec: U32::new(0) },
            otime: Timespec { sec: U64::new(0), nsec: U32::new(0) },
        };
        let data = item.as_bytes().to_vec();
        let mut nb = NodeBuffer::zeroed(4096);
        nb.set_level(0);
        nb.set_nritems(1);
        let tail = nb.payload_len() - data.len();
        nb.set_item_descriptor(0, Key::new(ino, key_type::INODE_ITEM, 0), tail, data.len());
        nb.set_item_data(tail, &data);
        nb
    }

    #[test]
    fn inode_item_dispatch_populates_record() {
        let nb = make_leaf_with_inode_item(256, 1);
        let mut extents = HashMap::new();
        let mut visitor = FsTreeVisitor::new(4096, &mut extents, 5, false);
        let mut acc = HashMap::new();
        visitor.visit(&nb, 0, &mut acc).unwrap();
        let rec = acc.get(&256).unwrap();
        assert!(rec.found_inode_item);
        assert_eq!(rec.nlink, 1);
    }
}
