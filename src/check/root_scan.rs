//! Root-tree enumeration: walks `BTRFS_ROOT_TREE_OBJECTID` once up front to
//! discover every well-known tree (extent/csum/free-space) plus every
//! subvolume/snapshot root, and builds the `ROOT_REF`/`ROOT_BACKREF`
//! reachability graph the same pass feeds [`crate::check::rootref`].

use std::collections::HashMap;

use crate::check::rootref::RootRefGraph;
use crate::disk::items::RootItem;
use crate::disk::key::Key;
use crate::disk::types::{key_type, BTRFS_FIRST_FREE_OBJECTID, BTRFS_ORPHAN_OBJECTID};
use crate::error::Result;
use crate::tree::ops::TreeCursor;

#[derive(Debug, Default)]
pub struct RootTreeScan {
    /// Every `ROOT_ITEM` found, keyed by its tree objectid.
    pub roots: HashMap<u64, RootItem>,
    pub graph: RootRefGraph,
}

impl RootTreeScan {
    pub fn scan(cursor: &TreeCursor<'_>, root_bytenr: u64, root_level: u8) -> Result<Self> {
        let mut scan = RootTreeScan::default();
        cursor.for_each_item(root_bytenr, root_level, Key::MIN, |node, slot| {
            let key = node.item_key(slot);
            let data = node.item_data(slot);
            match key.item_type {
                key_type::ROOT_ITEM => {
                    scan.roots.insert(key.objectid, *RootItem::parse(data)?);
                    // Only subvolumes/snapshots (objectid >= the first free
                    // range) participate in the ROOT_REF reachability graph;
                    // system trees (extent/csum/dev/quota/...) have
                    // ROOT_ITEMs too but are reachable via well-known
                    // pointers, not ROOT_REF edges, and must not be reported
                    // as dangling subvolumes.
                    if key.objectid >= BTRFS_FIRST_FREE_OBJECTID {
                        scan.graph.add_root(key.objectid);
                    }
                }
                key_type::ROOT_REF => {
                    scan.graph.add_edge(key.objectid, key.offset);
                }
                key_type::ORPHAN_ITEM if key.objectid == BTRFS_ORPHAN_OBJECTID => {
                    scan.graph.mark_orphan(key.offset);
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(scan)
    }
}
