//! Free-space cache verifier: cross-checks a block group's persisted
//! free-space cache against the extent tree by carving every allocated
//! extent (and superblock mirror) out of the persisted map; what's left
//! over at the end must be empty.

use std::collections::BTreeMap;

use crate::error::{BtrfsError, Result};

/// Non-overlapping `start -> end` free ranges within one block group.
#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    ranges: BTreeMap<u64, u64>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_free(&mut self, start: u64, end: u64) {
        if start < end {
            self.ranges.insert(start, end);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_free(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Remove `[start, end)` from the free map — it's allocated (by an
    /// extent or reserved for a superblock mirror) and must not overlap a
    /// hole the persisted cache thought was free twice, nor extend past a
    /// single free range's boundary (that would mean the persisted cache
    /// disagrees with the extent tree about where free space starts/ends).
    pub fn carve(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let containing = self
            .ranges
            .range(..=start)
            .next_back()
            .filter(|(&rs, &re)| rs <= start && end <= re)
            .map(|(&rs, &re)| (rs, re));
        let Some((rs, re)) = containing else {
            return Err(BtrfsError::Irreconcilable { start, len: end - start, reason: "allocated extent not covered by free-space cache" });
        };
        self.ranges.remove(&rs);
        if rs < start {
            self.ranges.insert(rs, start);
        }
        if end < re {
            self.ranges.insert(end, re);
        }
        Ok(())
    }
}

/// Verify one block group: persisted free ranges minus every allocated
/// extent and superblock-mirror range must leave nothing over.
pub fn verify_block_group(
    bg_start: u64,
    bg_length: u64,
    persisted_free: &[(u64, u64)],
    allocated_extents: &[(u64, u64)],
    sb_mirror_ranges: &[(u64, u64)],
) -> Result<()> {
    let mut map = FreeSpaceMap::new();
    for &(s, e) in persisted_free {
        map.insert_free(s.max(bg_start), e.min(bg_start + bg_length));
    }
    for &(start, len) in allocated_extents {
        map.carve(start, start + len)?;
    }
    for &(start, len) in sb_mirror_ranges {
        let _ = map.carve(start, start + len);
    }
    if !map.is_empty() {
        return Err(BtrfsError::Irreconcilable {
            start: bg_start,
            len: bg_length,
            reason: "free-space cache still has ranges left after sweeping the extent tree",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_carved_group_is_consistent() {
        let persisted = vec![(0u64, 4096u64)];
        let allocated = vec![(0u64, 4096u64)];
        assert!(verify_block_group(0, 4096, &persisted, &allocated, &[]).is_ok());
    }

    #[test]
    fn leftover_free_space_is_an_error() {
        let persisted = vec![(0u64, 8192u64)];
        let allocated = vec![(0u64, 4096u64)];
        assert!(verify_block_group(0, 8192, &persisted, &allocated, &[]).is_err());
    }

    #[test]
    fn allocation_outside_persisted_range_is_an_error() {
        let persisted = vec![(0u64, 2048u64)];
        let allocated = vec![(0u64, 4096u64)];
        assert!(verify_block_group(0, 4096, &persisted, &allocated, &[]).is_err());
    }
}
