//! Chunk tree → device mapping (`map_block`/`num_copies`). Supports
//! `SINGLE`, `DUP`, `RAID1` — the profiles the restore mirror-retry loop
//! actually needs. Striped profiles surface a structured error rather than
//! silently mis-mapping.

use std::collections::BTreeMap;

use crate::disk::superblock::SysChunkEntry;
use crate::error::{BtrfsError, Result};

pub mod profile {
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const STRIPE_MASK: u64 = RAID0 | RAID1 | DUP | RAID10 | RAID5 | RAID6;
}

#[derive(Debug, Clone)]
pub struct ChunkMapping {
    pub length: u64,
    pub chunk_type: u64,
    pub stripe_len: u64,
    /// `(devid, physical_start)` per stripe.
    pub stripes: Vec<(u64, u64)>,
}

impl ChunkMapping {
    fn is_striped(&self) -> bool {
        self.chunk_type & profile::STRIPE_MASK & !(profile::RAID1 | profile::DUP) != 0
    }

    /// Number of redundant copies available (for `num_copies`/mirror retry).
    pub fn num_copies(&self) -> usize {
        if self.chunk_type & (profile::RAID1 | profile::DUP) != 0 {
            self.stripes.len().max(1)
        } else {
            1
        }
    }
}

/// Logical→physical chunk mapping, bootstrapped from the superblock's
/// `sys_chunk_array` and then extended by walking `CHUNK_TREE_OBJECTID`.
#[derive(Debug, Default)]
pub struct ChunkTree {
    by_logical_start: BTreeMap<u64, ChunkMapping>,
}

impl ChunkTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bootstrap(entries: &[SysChunkEntry]) -> Self {
        let mut tree = Self::new();
        for e in entries {
            tree.insert(
                e.key.objectid.get(),
                ChunkMapping {
                    length: e.chunk_length,
                    chunk_type: e.chunk_type,
                    stripe_len: e.stripe_len,
                    stripes: e.stripes.clone(),
                },
            );
        }
        tree
    }

    pub fn insert(&mut self, logical_start: u64, mapping: ChunkMapping) {
        self.by_logical_start.insert(logical_start, mapping);
    }

    fn lookup(&self, logical: u64) -> Option<(&u64, &ChunkMapping)> {
        self.by_logical_start
            .range(..=logical)
            .next_back()
            .filter(|(start, m)| logical < **start + m.length)
    }

    /// Map `(logical, len)` to one physical location per mirror copy.
    /// `mirror` selects which stripe to prefer first for a redundant
    /// profile (mirror-fallback reads mirror 1 first, then retries
    /// others).
    pub fn map_block(&self, logical: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        let (start, mapping) = self
            .lookup(logical)
            .ok_or(BtrfsError::Parse("no chunk mapping for logical address"))?;
        if logical + len > start + mapping.length {
            return Err(BtrfsError::Parse("block spans chunk boundary"));
        }
        if mapping.is_striped() {
            return Err(BtrfsError::UnsupportedChunkProfile(mapping.chunk_type));
        }
        let within = logical - start;
        Ok(mapping.stripes.iter().map(|&(devid, phys)| (devid, phys + within)).collect())
    }

    pub fn num_copies(&self, logical: u64) -> usize {
        self.lookup(logical).map(|(_, m)| m.num_copies()).unwrap_or(1)
    }
}
