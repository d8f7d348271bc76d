//! Multi-tree walker: a depth-first traversal over one subvolume's
//! fs-tree that detects nodes shared with other subvolumes
//! (snapshots) and merges their contribution exactly once instead of
//! re-descending into them per owning tree.
//!
//! A tree block is "shared" when the extent tree reports more than one
//! ref for it. The first tree to reach such a block walks it for real and
//! stashes the resulting per-inode accumulator in a [`SharedCache`] keyed
//! by `bytenr`; every later tree that reaches the same block looks the
//! accumulator up, merges it into its own walk, and skips the subtree.

use std::collections::HashMap;

use crate::check::inode::{merge_inode_recs, InodeRecord};
use crate::disk::node::NodeBuffer;
use crate::error::Result;
use crate::tree::block_io::BlockIo;

/// One shared tree block's in-progress or completed accumulator.
struct SharedNode {
    refs: u32,
    inode_cache: HashMap<u64, InodeRecord>,
}

pub enum EnterOutcome {
    /// This is the first tree to reach the block; the caller must walk its
    /// contents and report them back via [`SharedCache::finish_first`].
    First,
    /// A later tree; `inode_cache` is the already-complete accumulator to
    /// merge into the caller's own accumulator. The caller must not
    /// descend into the block's children.
    Spliced(HashMap<u64, InodeRecord>),
}

/// Cross-tree cache of shared nodes, keyed by `bytenr`. One instance is
/// shared across every subvolume root walked during a single `check` run,
/// living for the whole run rather than being rebuilt per tree.
#[derive(Default)]
pub struct SharedCache {
    nodes: HashMap<u64, SharedNode>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `total_refs` is the block's extent tree ref count (always `> 1` for
    /// anything worth calling this on).
    pub fn enter(&mut self, bytenr: u64, total_refs: u32) -> EnterOutcome {
        if let Some(node) = self.nodes.get_mut(&bytenr) {
            // The creating tree's own `leave` doesn't decrement (it isn't a
            // splice consumer, it's the owner); every other tree does, so
            // the count here naturally settles at 1 once all owners but the
            // creator have spliced.
            node.refs = node.refs.saturating_sub(1).max(1);
            let cache = node.inode_cache.clone();
            EnterOutcome::Spliced(cache)
        } else {
            self.nodes.insert(bytenr, SharedNode { refs: total_refs, inode_cache: HashMap::new() });
            EnterOutcome::First
        }
    }

    /// Called by the block's creating walker once it has finished walking
    /// the subtree. Stores the completed accumulator for future splices
    /// and hands back a copy for the creator to merge into its own
    /// per-root result.
    pub fn finish_first(&mut self, bytenr: u64, cache: HashMap<u64, InodeRecord>) -> HashMap<u64, InodeRecord> {
        let merged_copy = cache.clone();
        if let Some(node) = self.nodes.get_mut(&bytenr) {
            node.inode_cache = cache;
        }
        merged_copy
    }

    #[cfg(test)]
    fn refs_remaining(&self, bytenr: u64) -> Option<u32> {
        self.nodes.get(&bytenr).map(|n| n.refs)
    }
}

pub fn merge_inode_maps(dst: &mut HashMap<u64, InodeRecord>, src: HashMap<u64, InodeRecord>) {
    for (ino, rec) in src {
        match dst.get_mut(&ino) {
            Some(existing) => merge_inode_recs(existing, rec),
            None => {
                dst.insert(ino, rec);
            }
        }
    }
}

/// Per-leaf dispatch, invoked once per item on every leaf the walker
/// visits. Implementations live alongside the checker.
pub trait LeafVisitor {
    fn visit(&mut self, node: &NodeBuffer, slot: usize, acc: &mut HashMap<u64, InodeRecord>) -> Result<()>;
}

/// Observes every tree block touched during the walk, owning or shared
/// alike, so the caller can feed the reconciler's "walked" backref
/// population: every internal-node pointer is a tree backref.
pub trait RefObserver {
    fn observe_tree_block(&mut self, bytenr: u64, owner: u64, parent: Option<u64>, generation: u64, full_backref: bool);
}

/// Per-walk parameters that don't change as the walk recurses, bundled to
/// keep the recursive helpers' argument lists manageable.
pub struct WalkCtx<'a> {
    pub owner: u64,
    pub full_backref: bool,
    pub extent_refs: &'a dyn Fn(u64) -> u32,
}

pub struct Walker<'a> {
    block_io: &'a BlockIo<'a>,
}

impl<'a> Walker<'a> {
    pub fn new(block_io: &'a BlockIo<'a>) -> Self {
        Walker { block_io }
    }

    /// Walk one subvolume root to completion, returning its per-inode
    /// accumulator (already merged with any shared subtrees it touched).
    /// `visitor` plays both roles (leaf dispatch and backref observation)
    /// since both need mutable access to the same per-run accumulators
    /// and a single object avoids aliasing two `&mut` borrows of the same
    /// underlying state through separate parameters.
    pub fn walk_root<V: LeafVisitor + RefObserver>(
        &self,
        shared: &mut SharedCache,
        ctx: &WalkCtx,
        root_bytenr: u64,
        root_level: u8,
        visitor: &mut V,
    ) -> Result<HashMap<u64, InodeRecord>> {
        let mut acc = HashMap::new();
        self.walk_node(shared, ctx, root_bytenr, root_level, None, visitor, &mut acc)?;
        Ok(acc)
    }

    fn walk_node<V: LeafVisitor + RefObserver>(
        &self,
        shared: &mut SharedCache,
        ctx: &WalkCtx,
        bytenr: u64,
        level: u8,
        parent: Option<u64>,
        visitor: &mut V,
        acc: &mut HashMap<u64, InodeRecord>,
    ) -> Result<()> {
        let node = self.block_io.read_tree_block(bytenr)?;
        visitor.observe_tree_block(bytenr, ctx.owner, parent, node.generation(), ctx.full_backref);

        let refs = (ctx.extent_refs)(bytenr);
        if refs > 1 {
            match shared.enter(bytenr, refs) {
                EnterOutcome::First => {
                    let mut inner = HashMap::new();
                    self.walk_contents(shared, ctx, &node, level, visitor, &mut inner)?;
                    let merged = shared.finish_first(bytenr, inner);
                    merge_inode_maps(acc, merged);
                }
                EnterOutcome::Spliced(cache) => {
                    merge_inode_maps(acc, cache);
                }
            }
        } else {
            self.walk_contents(shared, ctx, &node, level, visitor, acc)?;
        }
        Ok(())
    }

    fn walk_contents<V: LeafVisitor + RefObserver>(
        &self,
        shared: &mut SharedCache,
        ctx: &WalkCtx,
        node: &NodeBuffer,
        level: u8,
        visitor: &mut V,
        acc: &mut HashMap<u64, InodeRecord>,
    ) -> Result<()> {
        let nritems = node.nritems() as usize;
        if node.is_leaf() {
            for slot in 0..nritems {
                visitor.visit(node, slot, acc)?;
            }
        } else {
            let bytenr = node.bytenr();
            for slot in 0..nritems {
                let child = node.node_blockptr(slot);
                self.walk_node(shared, ctx, child, level - 1, Some(bytenr), visitor, acc)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::inode::{process_inode_item, process_inode_ref};
    use crate::disk::items::InodeItem;
    use zerocopy::byteorder::little_endian::U32;
    use zerocopy::byteorder::little_endian::U64;

    fn blank_inode_item(nlink: u32) -> InodeItem {
        InodeItem {
            generation: U64::new(1),
            transid: U64::new(1),
            size: U64::new(0),
            nbytes: U64::new(0),
            block_group: U64::new(0),
            nlink: U32::new(nlink),
            uid: U32::new(0),
            gid: U32::new(0),
            mode: U32::new(crate::disk::types::S_IFREG | 0o644),
            rdev: U64::new(0),
            flags: U64::new(0),
            sequence: U64::new(0),
            reserved: [U64::new(0); 4],
            atime: crate::disk::items::Timespec { sec: U64::new(0), nsec: U32::new(0) },
            ctime: crate::disk::items::Timespec { sec: U64::new(0), nsec: U32::new(0) },
            mtime: crate::disk::items::Timespec { sec: U64::new(0), nsec: U32::new(0) },
            otime: crate::disk::items::Timespec { sec: U64::new(0), nsec: U32::new(0) },
        }
    }

    /// Two subvolume roots share one leaf holding inode 256. Subvolume
    /// A's walk observes the `INODE_ITEM`,
    /// subvolume B's observes an `INODE_REF` naming a different parent.
    /// After both splice, the merged record for 256 carries both findings
    /// and the shared node settles at `refs == 1`.
    #[test]
    fn shared_node_merge_combines_findings_from_both_trees() {
        let mut shared = SharedCache::new();
        let bytenr = 0x20_0000u64;

        // Tree A reaches the shared leaf first: records the inode item.
        let outcome = shared.enter(bytenr, 2);
        assert!(matches!(outcome, EnterOutcome::First));
        let mut inner = HashMap::new();
        let mut rec_a = InodeRecord::new(256);
        process_inode_item(&mut rec_a, &blank_inode_item(1));
        inner.insert(256, rec_a);
        let mut acc_a = HashMap::new();
        let merged_for_a = shared.finish_first(bytenr, inner);
        merge_inode_maps(&mut acc_a, merged_for_a);

        // Tree B reaches the same bytenr later via its own root: it never
        // walks the subtree, it just splices.
        let outcome = shared.enter(bytenr, 2);
        let mut acc_b = HashMap::new();
        match outcome {
            EnterOutcome::Spliced(cache) => merge_inode_maps(&mut acc_b, cache),
            EnterOutcome::First => panic!("second entry must splice, not re-walk"),
        }
        // B's own walk also found a name for 256 from its own root.
        let rec_b = acc_b.get_mut(&256).unwrap();
        process_inode_ref(rec_b, 5, 0, b"from-b", false);

        assert_eq!(shared.refs_remaining(bytenr), Some(1));
        assert!(acc_a.get(&256).unwrap().found_inode_item);
        assert_eq!(acc_b.get(&256).unwrap().backrefs.len(), 1);
    }
}
