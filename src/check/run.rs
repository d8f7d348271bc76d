//! Top-level `check` orchestration: superblock → open_fs → walk every
//! subvolume root → reconcile extents → optional repair → free-space
//! check → csum check → root-ref check. Ties every checking component
//! together behind one `run_check` entry point.

use std::collections::HashMap;

use crate::check::csum::{verify_coverage, CsumCoalescer};
use crate::check::dispatch::FsTreeVisitor;
use crate::check::extent::ExtentRecord;
use crate::check::extent_scan::ExtentTreeScan;
use crate::check::freespace::verify_block_group;
use crate::check::inode::{check_root_dir, finalize_inode, InodeErrors};
use crate::check::repair::Repairer;
use crate::check::root_scan::RootTreeScan;
use crate::disk::items::csum_item_count;
use crate::disk::key::Key;
use crate::disk::types::{key_type, BTRFS_CSUM_TREE_OBJECTID, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID, BTRFS_TREE_RELOC_OBJECTID};
use crate::error::{BtrfsError, Result};
use crate::fs::FsHandle;
use crate::tree::alloc::BumpAllocator;
use crate::tree::ops::TreeCursor;
use crate::walk::{SharedCache, WalkCtx, Walker};

/// `check`'s configuration, built by the CLI layer and passed into the
/// library entry point.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub superblock_mirror: Option<u32>,
    pub repair: bool,
    pub init_csum_tree: bool,
    pub init_extent_tree: bool,
}

/// Run-wide counters, threaded through the walker instead of living as
/// global mutable state.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub roots_walked: u64,
    pub inodes_checked: u64,
    pub extents_reconciled: u64,
    pub tree_blocks_read: u64,
    pub data_bytes_csummed: u64,
}

#[derive(Debug, Clone)]
pub struct InodeFinding {
    pub root: u64,
    pub ino: u64,
    pub errors: InodeErrors,
}

#[derive(Debug, Clone)]
pub struct ExtentFinding {
    pub start: u64,
    pub len: u64,
    pub declared_refs: u64,
    pub walked_refs: u64,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub stats: RunStats,
    pub inode_findings: Vec<InodeFinding>,
    pub extent_findings: Vec<ExtentFinding>,
    pub unreachable_roots: Vec<u64>,
    pub freespace_errors: Vec<String>,
    pub csum_errors: Vec<String>,
    pub repaired: Vec<u64>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.inode_findings.is_empty()
            && self.extent_findings.is_empty()
            && self.unreachable_roots.is_empty()
            && self.freespace_errors.is_empty()
            && self.csum_errors.is_empty()
    }
}

pub fn run_check(fs: &FsHandle, options: &CheckOptions) -> Result<CheckReport> {
    let block_io = fs.block_io();
    let cursor = TreeCursor::new(&block_io);
    let mut stats = RunStats::default();

    let root_scan = RootTreeScan::scan(&cursor, fs.ctx.root_bytenr, fs.ctx.root_level)?;

    let extent_root = root_scan
        .roots
        .get(&BTRFS_EXTENT_TREE_OBJECTID)
        .ok_or(BtrfsError::Parse("no EXTENT_TREE root item in root tree"))?;
    let mut extent_scan = ExtentTreeScan::scan(&cursor, extent_root.bytenr.get(), extent_root.level, fs.ctx.nodesize as u64)?;

    // Walker seeds: every live, non-reloc subvolume/snapshot root plus the
    // default fs-tree. Reloc trees are transient repair bookkeeping, out of
    // scope for a read pass over a cleanly-unmounted image.
    let mut roots: Vec<u64> = root_scan
        .roots
        .keys()
        .copied()
        .filter(|&id| id == BTRFS_FS_TREE_OBJECTID || (BTRFS_FIRST_FREE_OBJECTID..BTRFS_LAST_FREE_OBJECTID).contains(&id))
        .filter(|&id| id != BTRFS_TREE_RELOC_OBJECTID)
        .collect();
    roots.sort_unstable();

    let mixed_backref = fs.ctx.mixed_backref();
    let mut shared = SharedCache::new();
    let mut inode_findings = Vec::new();

    for &root_id in &roots {
        let root_item = &root_scan.roots[&root_id];
        let full_backref = !mixed_backref;
        let mut visitor = FsTreeVisitor::new(fs.ctx.sectorsize as u64, &mut extent_scan.extents, root_id, full_backref);
        let ctx = WalkCtx { owner: root_id, full_backref, extent_refs: &|bytenr| *extent_scan.ref_counts.get(&bytenr).unwrap_or(&0) as u32 };
        let mut acc = Walker::new(&block_io).walk_root(&mut shared, &ctx, root_item.bytenr.get(), root_item.level, &mut visitor)?;
        stats.roots_walked += 1;

        let orphans = visitor.orphans.clone();
        for (&ino, rec) in acc.iter_mut() {
            let is_root_dir = rec.ino == root_item.root_dirid.get();
            finalize_inode(rec, orphans.contains(&ino), is_root_dir);
            stats.inodes_checked += 1;
            if is_root_dir {
                rec.errors |= check_root_dir(rec);
            }
            if !rec.errors.is_empty() {
                inode_findings.push(InodeFinding { root: root_id, ino, errors: rec.errors });
            }
        }
    }

    // Reconcile: every declared extent record must balance against what
    // the walk actually found.
    let mut extent_findings = Vec::new();
    let mut broken: Vec<ExtentRecord> = Vec::new();
    for rec in extent_scan.extents.values() {
        if !rec.all_backpointers_checked() {
            extent_findings.push(ExtentFinding { start: rec.start, len: rec.nr, declared_refs: rec.extent_item_refs, walked_refs: rec.refs });
            broken.push(rec.clone());
        }
        stats.extents_reconciled += 1;
    }

    let mut repaired = Vec::new();
    if options.repair && !broken.is_empty() {
        let alloc = BumpAllocator::new(fs.ctx.total_bytes);
        let repairer = Repairer::new(&block_io, &alloc, extent_root.bytenr.get(), extent_root.level, fs.ctx.generation + 1);
        for rec in &broken {
            repairer.delete_extent_records(rec.start, rec.nr)?;
            repairer.recreate_extent(rec)?;
            repaired.push(rec.start);
        }
    }

    // Free-space check: only meaningful when a free-space tree (v2 cache)
    // exists; v1's file-backed cache format is not modeled.
    let mut freespace_errors = Vec::new();
    if let Some(fst_root) = root_scan.roots.get(&crate::disk::types::BTRFS_FREE_SPACE_TREE_OBJECTID) {
        let mut persisted: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
        cursor.for_each_item(fst_root.bytenr.get(), fst_root.level, Key::MIN, |node, slot| {
            let key = node.item_key(slot);
            if key.item_type == key_type::FREE_SPACE_EXTENT {
                persisted.entry(key.objectid).or_default().push((0, key.offset));
            }
            Ok(())
        })?;
        for &(bg_start, bg_len, _flags) in &extent_scan.block_groups {
            let allocated: Vec<(u64, u64)> = extent_scan
                .extents
                .values()
                .filter(|e| e.start >= bg_start && e.start < bg_start + bg_len)
                .map(|e| (e.start, e.nr))
                .collect();
            let free: Vec<(u64, u64)> = persisted.get(&bg_start).map(|v| v.iter().map(|&(_, len)| (bg_start, bg_start + len)).collect()).unwrap_or_default();
            if let Err(e) = verify_block_group(bg_start, bg_len, &free, &allocated, &[]) {
                freespace_errors.push(format!("block group {bg_start:#x}: {e}"));
            }
        }
    }

    // Checksum check: coalesce EXTENT_CSUM coverage and verify every run
    // is backed by a real data extent.
    let mut csum_errors = Vec::new();
    if let Some(csum_root) = root_scan.roots.get(&BTRFS_CSUM_TREE_OBJECTID) {
        let mut coalescer = CsumCoalescer::new();
        let csum_size = fs.ctx.csum_type.size();
        cursor.for_each_item(csum_root.bytenr.get(), csum_root.level, Key::MIN, |node, slot| {
            let key = node.item_key(slot);
            if key.item_type == key_type::EXTENT_CSUM {
                let count = csum_item_count(node.item_size(slot), csum_size);
                coalescer.feed(key.offset, count, fs.ctx.sectorsize as u64);
                stats.data_bytes_csummed += count as u64 * fs.ctx.sectorsize as u64;
            }
            Ok(())
        })?;
        let runs = coalescer.finish();
        let data_extents: Vec<(u64, u64)> = extent_scan.extents.values().filter(|e| !e.metadata).map(|e| (e.start, e.nr)).collect();
        if let Err(e) = verify_coverage(&runs, &data_extents) {
            csum_errors.push(e.to_string());
        } else {
            for rec in extent_scan.extents.values_mut().filter(|e| !e.metadata) {
                rec.content_checked = runs.iter().any(|r| r.start <= rec.start && rec.start + rec.nr <= r.end);
            }
        }
    }

    Ok(CheckReport {
        stats,
        inode_findings,
        extent_findings,
        unreachable_roots: root_scan.graph.unreachable_roots(),
        freespace_errors,
        csum_errors,
        repaired,
    })
}
