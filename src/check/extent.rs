//! Extent/backref reconciler: maintains `extent_record`s with two
//! independently-populated backref lists — one from walking the trees, one
//! declared by the extent tree itself — and verifies they balance.

use crate::disk::items::extent_flags;

/// Tagged backref variant: `Tree{parent|root, full_backref}` selects the
/// `parent` discriminant via `full_backref`; `Data` additionally keys on
/// `(owner, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backref {
    Tree { parent_or_root: u64, full_backref: bool },
    Data { parent_or_root: u64, full_backref: bool, owner: u64, offset: u64, bytes: u64, num_refs: u32, found_ref: u32 },
}

impl Backref {
    fn matches_tree(&self, parent: u64, root: u64) -> bool {
        match *self {
            Backref::Tree { parent_or_root, full_backref } => {
                if parent > 0 {
                    full_backref && parent_or_root == parent
                } else {
                    !full_backref && parent_or_root == root
                }
            }
            _ => false,
        }
    }

    fn matches_data(&self, parent: u64, root: u64, owner: u64, offset: u64, bytes: Option<u64>) -> bool {
        match *self {
            Backref::Data { parent_or_root, full_backref, owner: o, offset: off, bytes: b, num_refs, .. } => {
                let key_matches = if parent > 0 {
                    full_backref && parent_or_root == parent
                } else {
                    !full_backref && parent_or_root == root
                };
                if !key_matches || o != owner || off != offset {
                    return false;
                }
                if num_refs > 0 {
                    bytes.map(|want| want == b).unwrap_or(true)
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    fn is_data(&self) -> bool {
        matches!(self, Backref::Data { .. })
    }
}

#[derive(Debug, Clone, Default)]
struct BackrefSlot {
    backref: Option<Backref>,
    found_extent_tree: bool,
    found_ref: bool,
}

#[derive(Debug, Clone)]
pub struct ExtentRecord {
    pub start: u64,
    pub nr: u64,
    pub max_size: u64,
    /// Count derived by *walking* the trees.
    pub refs: u64,
    /// Count *declared* by the extent tree.
    pub extent_item_refs: u64,
    pub generation: u64,
    pub info_objectid: u64,
    pub info_level: u8,
    pub metadata: bool,
    pub content_checked: bool,
    pub owner_ref_checked: bool,
    pub is_root: bool,
    backrefs: Vec<BackrefSlot>,
}

impl ExtentRecord {
    pub fn new(start: u64, nr: u64) -> Self {
        ExtentRecord {
            start,
            nr,
            max_size: nr,
            refs: 0,
            extent_item_refs: 0,
            generation: 0,
            info_objectid: 0,
            info_level: 0,
            metadata: false,
            content_checked: false,
            owner_ref_checked: false,
            is_root: false,
            backrefs: Vec::new(),
        }
    }

    /// Identity used to merge the declared (extent-tree) and walked (live
    /// tree) populations of the same logical backref: same key fields as
    /// [`Backref::matches_tree`]/[`Backref::matches_data`], ignoring
    /// `bytes`/`num_refs`/`found_ref` — those differ by construction between
    /// the two populations (the extent tree's `EXTENT_DATA_REF` doesn't
    /// carry a byte length; only the walked `EXTENT_DATA` item does) and
    /// must accumulate onto one slot rather than each open a new one.
    fn same_backref_identity(a: &Backref, b: &Backref) -> bool {
        match (a, b) {
            (Backref::Tree { parent_or_root: p1, full_backref: f1 }, Backref::Tree { parent_or_root: p2, full_backref: f2 }) => p1 == p2 && f1 == f2,
            (
                Backref::Data { parent_or_root: p1, full_backref: f1, owner: o1, offset: of1, .. },
                Backref::Data { parent_or_root: p2, full_backref: f2, owner: o2, offset: of2, .. },
            ) => p1 == p2 && f1 == f2 && o1 == o2 && of1 == of2,
            _ => false,
        }
    }

    fn slot_mut(&mut self, br: Backref) -> &mut BackrefSlot {
        let idx = self.backrefs.iter().position(|s| s.backref.is_some_and(|existing| Self::same_backref_identity(&existing, &br)));
        let idx = match idx {
            Some(i) => i,
            None => {
                self.backrefs.push(BackrefSlot { backref: Some(br), found_extent_tree: false, found_ref: false });
                self.backrefs.len() - 1
            }
        };
        &mut self.backrefs[idx]
    }

    /// "Declared" population: a ref found while scanning the extent tree's
    /// inline/stand-alone ref items.
    pub fn mark_found_extent_tree(&mut self, br: Backref) {
        let slot = self.slot_mut(br);
        slot.found_extent_tree = true;
        if let Backref::Data { num_refs, .. } = &mut slot.backref.as_mut().unwrap() {
            *num_refs += 1;
        }
    }

    /// "Walked" population: a ref found while traversing the live trees —
    /// internal-node pointers for tree backrefs, `EXTENT_DATA` items for
    /// data backrefs. The walked item is the only
    /// one that knows the extent's real byte length, so it's the side that
    /// stamps `bytes` onto the merged slot.
    pub fn mark_found_ref(&mut self, br: Backref) {
        let slot = self.slot_mut(br);
        slot.found_ref = true;
        self.refs += 1;
        if let Backref::Data { bytes, found_ref, .. } = &mut slot.backref.as_mut().unwrap() {
            if let Backref::Data { bytes: new_bytes, .. } = br {
                *bytes = new_bytes;
            }
            *found_ref += 1;
        }
    }

    pub fn find_tree_backref(&self, parent: u64, root: u64) -> Option<Backref> {
        self.backrefs.iter().find_map(|s| s.backref.filter(|b| b.matches_tree(parent, root)))
    }

    pub fn find_data_backref(&self, parent: u64, root: u64, owner: u64, offset: u64, bytes: Option<u64>) -> Option<Backref> {
        self.backrefs.iter().find_map(|s| s.backref.filter(|b| b.matches_data(parent, root, owner, offset, bytes)))
    }

    /// A record is fully reconciled when the walked ref count matches the
    /// declared count and every walked/declared slot agrees on presence,
    /// count, and (for data backrefs) byte length.
    pub fn all_backpointers_checked(&self) -> bool {
        if self.refs != self.extent_item_refs {
            return false;
        }
        self.backrefs.iter().all(|s| {
            let br = match s.backref {
                Some(b) => b,
                None => return true,
            };
            if !s.found_extent_tree {
                return false;
            }
            if !br.is_data() {
                return s.found_ref;
            }
            match br {
                Backref::Data { num_refs, found_ref, bytes, .. } => found_ref == num_refs && bytes == self.nr,
                _ => unreachable!(),
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.content_checked && self.owner_ref_checked && self.all_backpointers_checked()
    }

    /// The reconciled backref list the repairer reinserts: every backref
    /// actually confirmed by walking the live trees.
    pub fn backrefs(&self) -> Vec<Backref> {
        self.backrefs.iter().filter(|s| s.found_ref).filter_map(|s| s.backref).collect()
    }
}

/// Owner-ref check. Returns `true` if the record's backref list already
/// contains a `Tree{root=owner}` entry (the walker-reachable
/// path is checked separately by the caller, which knows the live tree
/// topology).
pub fn has_owner_tree_backref(rec: &ExtentRecord, owner: u64) -> bool {
    rec.find_tree_backref(0, owner).is_some()
}

pub fn extent_item_is_metadata(flags: u64) -> bool {
    flags & extent_flags::TREE_BLOCK != 0
}

pub fn extent_item_is_data(flags: u64) -> bool {
    flags & extent_flags::DATA != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_tree_backref_resolves() {
        let mut rec = ExtentRecord::new(4096, 16384);
        rec.extent_item_refs = 1;
        rec.content_checked = true;
        rec.owner_ref_checked = true;
        let br = Backref::Tree { parent_or_root: 5, full_backref: false };
        rec.mark_found_extent_tree(br);
        rec.mark_found_ref(br);
        assert!(rec.all_backpointers_checked());
        assert!(rec.is_resolved());
    }

    #[test]
    fn unmatched_ref_count_fails() {
        let mut rec = ExtentRecord::new(4096, 16384);
        rec.extent_item_refs = 2;
        let br = Backref::Tree { parent_or_root: 5, full_backref: false };
        rec.mark_found_extent_tree(br);
        rec.mark_found_ref(br);
        assert!(!rec.all_backpointers_checked());
    }

    #[test]
    fn data_backref_bytes_mismatch_fails() {
        let mut rec = ExtentRecord::new(0, 4096);
        rec.extent_item_refs = 1;
        let br = Backref::Data { parent_or_root: 5, full_backref: false, owner: 256, offset: 0, bytes: 8192, num_refs: 0, found_ref: 0 };
        rec.mark_found_extent_tree(br);
        rec.mark_found_ref(br);
        assert!(!rec.all_backpointers_checked());
    }
}
