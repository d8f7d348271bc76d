//! Inode/directory cross-check: per-inode accumulator aggregating
//! back-refs, dir items, and file-extent spans as the walker visits items,
//! with a final per-root pass and a commutative merge for shared subtrees.

use bitflags::bitflags;

use crate::disk::items::{DirItemEntry, FileExtentItem, InodeItem};
use crate::disk::types::{file_extent_type, filetype, key_type};

pub const MAX_NAME_LEN: usize = 255;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeErrors: u32 {
        const DUP_INODE_ITEM      = 1 << 0;
        const DUP_DIR_INDEX       = 1 << 1;
        const NO_INODE_ITEM       = 1 << 2;
        const NO_ORPHAN_ITEM      = 1 << 3;
        const LINK_COUNT_WRONG    = 1 << 4;
        const NAME_TOO_LONG       = 1 << 5;
        const INDEX_UNMATCH       = 1 << 6;
        const FILETYPE_UNMATCH    = 1 << 7;
        const FILE_EXTENT_OVERLAP = 1 << 8;
        const FILE_EXTENT_DISCOUNT = 1 << 9;
        const SOME_CSUM_MISSING   = 1 << 10;
        const ODD_CSUM_ITEM       = 1 << 11;
        const DIR_ISIZE_WRONG     = 1 << 12;
        const FILE_NBYTES_WRONG   = 1 << 13;
        const BAD_FILE_EXTENT     = 1 << 14;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackrefFound: u8 {
        const DIR_ITEM   = 1 << 0;
        const DIR_INDEX  = 1 << 1;
        const INODE_REF  = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct InodeBackref {
    pub dir: u64,
    pub index: u64,
    pub name: Vec<u8>,
    pub filetype: u8,
    pub ref_type: u8,
    pub found: BackrefFound,
    pub errors: InodeErrors,
}

/// One observed `EXTENT_DATA` span, kept to detect overlaps/gaps.
#[derive(Debug, Clone, Copy)]
pub struct ExtentSpan {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InodeRecord {
    pub ino: u64,
    pub nlink: u32,
    pub imode: u32,
    pub isize_: u64,
    pub nbytes: u64,
    pub found_link: u32,
    pub found_size: u64,
    pub extent_start: Option<u64>,
    pub extent_end: u64,
    pub first_extent_gap: Option<u64>,
    pub nodatasum: bool,
    pub found_inode_item: bool,
    pub checked: bool,
    pub expects_orphan: bool,
    pub errors: InodeErrors,
    pub backrefs: Vec<InodeBackref>,
    spans: Vec<ExtentSpan>,
}

impl InodeRecord {
    pub fn new(ino: u64) -> Self {
        InodeRecord { ino, ..Default::default() }
    }

    pub fn is_dir(&self) -> bool {
        self.imode & crate::disk::types::S_IFMT == crate::disk::types::S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.imode & crate::disk::types::S_IFMT == crate::disk::types::S_IFREG
    }

    /// §3.2 lifecycle: eligible for release once fully reconciled.
    pub fn is_resolved(&self) -> bool {
        self.found_link == self.nlink && self.backrefs.is_empty() && self.errors.is_empty() && self.checked
    }

    fn backref_mut(&mut self, dir: u64, name: &[u8]) -> &mut InodeBackref {
        if let Some(i) = self.backrefs.iter().position(|b| b.dir == dir && b.name == name) {
            return &mut self.backrefs[i];
        }
        self.backrefs.push(InodeBackref {
            dir,
            index: 0,
            name: name.to_vec(),
            filetype: filetype::UNKNOWN,
            ref_type: 0,
            found: BackrefFound::empty(),
            errors: InodeErrors::empty(),
        });
        self.backrefs.last_mut().unwrap()
    }
}

/// Folds an `INODE_ITEM`'s fields into the accumulator.
pub fn process_inode_item(rec: &mut InodeRecord, item: &InodeItem) {
    if rec.found_inode_item {
        rec.errors |= InodeErrors::DUP_INODE_ITEM;
    }
    rec.nlink = item.nlink.get();
    rec.isize_ = item.size.get();
    rec.nbytes = item.nbytes.get();
    rec.imode = item.mode.get();
    rec.nodatasum = item.flags.get() & crate::disk::types::inode_flags::NODATASUM != 0;
    rec.found_inode_item = true;
    if rec.nlink == 0 {
        rec.expects_orphan = true;
    }
}

/// Folds one `DIR_ITEM`/`DIR_INDEX` entry at a time (a single leaf slot
/// can hold several entries — hash collisions for `DIR_ITEM`, illegally
/// for `DIR_INDEX`). `target` is the accumulator for the inode the entry
/// points at; `dup_in_slot` is computed by the caller, which knows how
/// many entries the whole slot held: a `DIR_INDEX` slot holding more than
/// one entry is itself a corruption, flagged as `DUP_DIR_INDEX`.
pub fn process_dir_item(target: &mut InodeRecord, dir_ino: u64, index: u64, key_type_byte: u8, entry: &DirItemEntry, dup_in_slot: bool) {
    let mut name = entry.name.to_vec();
    let mut errs = InodeErrors::empty();
    if key_type_byte == key_type::DIR_INDEX && dup_in_slot {
        errs |= InodeErrors::DUP_DIR_INDEX;
    }
    if name.len() > MAX_NAME_LEN {
        errs |= InodeErrors::NAME_TOO_LONG;
        name.truncate(MAX_NAME_LEN);
    }
    let br = target.backref_mut(dir_ino, &name);
    br.filetype = entry.file_type;
    br.errors |= errs;
    if key_type_byte == key_type::DIR_ITEM {
        br.found |= BackrefFound::DIR_ITEM;
    } else {
        br.found |= BackrefFound::DIR_INDEX;
        br.index = index;
    }
}

/// Folds an `INODE_REF`/`INODE_EXTREF` entry into the accumulator.
/// `dir_ino` is the parent directory objectid named by the ref; `seq` is the index
/// supplied by `INODE_EXTREF` (or the implicit ordering for `INODE_REF`).
pub fn process_inode_ref(target: &mut InodeRecord, dir_ino: u64, seq: u64, name: &[u8], is_extref: bool) {
    let mut trimmed = name.to_vec();
    let mut errs = InodeErrors::empty();
    if trimmed.len() > MAX_NAME_LEN {
        errs |= InodeErrors::NAME_TOO_LONG;
        trimmed.truncate(MAX_NAME_LEN);
    }
    let already_linked = target.backref_mut(dir_ino, &trimmed).found.contains(BackrefFound::INODE_REF);
    if !already_linked {
        target.found_link += 1;
    }
    let br = target.backref_mut(dir_ino, &trimmed);
    br.ref_type = if is_extref { key_type::INODE_EXTREF } else { key_type::INODE_REF };
    br.found |= BackrefFound::INODE_REF;
    br.errors |= errs;
    if br.found.contains(BackrefFound::DIR_INDEX) && br.index != seq {
        br.errors |= InodeErrors::INDEX_UNMATCH;
    }
    br.index = seq;
    let expected_filetype = imode_to_filetype(target.imode);
    if target.found_inode_item && br.filetype != filetype::UNKNOWN && br.filetype != expected_filetype {
        br.errors |= InodeErrors::FILETYPE_UNMATCH;
    }
}

fn imode_to_filetype(imode: u32) -> u8 {
    match imode & crate::disk::types::S_IFMT {
        crate::disk::types::S_IFDIR => filetype::DIR,
        crate::disk::types::S_IFREG => filetype::REG,
        crate::disk::types::S_IFLNK => filetype::SYMLINK,
        _ => filetype::UNKNOWN,
    }
}

/// Folds a `EXTENT_DATA` item's span into the accumulator. Returns the
/// number of bytes this extent contributes to `found_size`/`nbytes`
/// bookkeeping.
pub fn process_file_extent(rec: &mut InodeRecord, key_offset: u64, item: &FileExtentItem, sectorsize: u64) -> u64 {
    let contributed = match item.extent_type {
        file_extent_type::INLINE => item.ram_bytes.div_ceil(sectorsize) * sectorsize,
        file_extent_type::REG | file_extent_type::PREALLOC => {
            if let Some(reg) = &item.regular {
                if reg.num_bytes.get() + reg.offset.get() > item.ram_bytes {
                    rec.errors |= InodeErrors::BAD_FILE_EXTENT;
                }
                if reg.num_bytes.get() % sectorsize != 0 {
                    rec.errors |= InodeErrors::BAD_FILE_EXTENT;
                }
                if item.extent_type == file_extent_type::PREALLOC
                    && item.compression != crate::disk::types::CompressionType::None
                {
                    rec.errors |= InodeErrors::BAD_FILE_EXTENT;
                }
                reg.num_bytes.get()
            } else {
                0
            }
        }
        _ => 0,
    };

    let start = key_offset;
    let end = start + contributed;
    if let Some(prev) = rec.spans.last().copied() {
        if start < prev.end {
            rec.errors |= InodeErrors::FILE_EXTENT_OVERLAP;
        } else if start > prev.end && rec.first_extent_gap.is_none() {
            rec.first_extent_gap = Some(prev.end);
        }
    }
    rec.spans.push(ExtentSpan { start, end });
    rec.extent_start.get_or_insert(start);
    rec.extent_end = rec.extent_end.max(end);
    if end < rec.isize_ && rec.spans.len() > 1 {
        rec.errors |= InodeErrors::FILE_EXTENT_DISCOUNT;
    }
    // Holes occupy logical span but no disk space; nbytes (and this
    // record's found_size) only counts inline payload and non-hole
    // regular/prealloc extents.
    if !item.is_hole() {
        rec.found_size += contributed;
    }
    contributed
}

/// Merge two records for the same inode observed under different shared
/// subtrees. Commutative: order of merging two splits of the same inode
/// doesn't affect the result.
pub fn merge_inode_recs(a: &mut InodeRecord, b: InodeRecord) {
    a.found_link += b.found_link;
    a.found_size += b.found_size;
    for br in b.backrefs {
        let existing = a.backref_mut(br.dir, &br.name);
        existing.found |= br.found;
        existing.errors |= br.errors;
        if existing.index == 0 {
            existing.index = br.index;
        }
        if existing.filetype == filetype::UNKNOWN {
            existing.filetype = br.filetype;
        }
    }
    if let Some(bs) = b.extent_start {
        match a.extent_start {
            Some(as_) if as_ < bs && a.extent_end < bs => {
                a.errors |= InodeErrors::BAD_FILE_EXTENT;
            }
            None => a.extent_start = Some(bs),
            _ => {}
        }
    }
    a.extent_end = a.extent_end.max(b.extent_end);
    if a.found_inode_item && b.found_inode_item {
        a.errors |= InodeErrors::DUP_INODE_ITEM;
    } else if b.found_inode_item {
        a.found_inode_item = true;
        a.nlink = b.nlink;
        a.isize_ = b.isize_;
        a.nbytes = b.nbytes;
        a.imode = b.imode;
        a.nodatasum = b.nodatasum;
        a.expects_orphan = b.expects_orphan;
    }
    a.errors |= b.errors;
}

/// Final per-root pass, run once every leaf of the root has been visited.
/// `is_root_dir`
/// suppresses the ordinary `found_link == nlink` check: a subvolume's root
/// directory has no parent naming it with an `INODE_REF`, so `found_link`
/// is structurally always 0 there regardless of its on-disk `nlink`
/// (`check_root_dir` applies the real root-directory invariant instead).
pub fn finalize_inode(rec: &mut InodeRecord, has_orphan_item: bool, is_root_dir: bool) {
    if !rec.found_inode_item {
        rec.errors |= InodeErrors::NO_INODE_ITEM;
    }
    if !is_root_dir && rec.found_link != rec.nlink {
        rec.errors |= InodeErrors::LINK_COUNT_WRONG;
    }
    if rec.is_dir() && rec.found_size != rec.isize_ {
        rec.errors |= InodeErrors::DIR_ISIZE_WRONG;
    }
    if rec.is_reg() && rec.found_size != rec.nbytes {
        rec.errors |= InodeErrors::FILE_NBYTES_WRONG;
    }
    if rec.expects_orphan && !has_orphan_item {
        rec.errors |= InodeErrors::NO_ORPHAN_ITEM;
    }
    rec.checked = true;
}

/// Root-directory invariants: `nlink==1, found_link==0, exactly one ".."
/// backref, no dir-items referencing it`.
pub fn check_root_dir(rec: &InodeRecord) -> InodeErrors {
    let mut errs = InodeErrors::empty();
    if rec.nlink != 1 {
        errs |= InodeErrors::LINK_COUNT_WRONG;
    }
    let dotdot_count = rec.backrefs.iter().filter(|b| b.name == b"..").count();
    if dotdot_count != 1 {
        errs |= InodeErrors::BAD_FILE_EXTENT;
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::items::FileExtentRegular;
    use crate::disk::types::CompressionType;
    use zerocopy::byteorder::little_endian::U64;

    fn reg_extent(offset: u64, ram_bytes: u64, num_bytes: u64, extent_type: u8) -> FileExtentItem<'static> {
        FileExtentItem {
            generation: 0,
            ram_bytes,
            compression: CompressionType::None,
            extent_type,
            regular: Some(FileExtentRegular {
                disk_bytenr: U64::new(1_000_000),
                disk_num_bytes: U64::new(num_bytes),
                offset: U64::new(offset),
                num_bytes: U64::new(num_bytes),
            }),
            inline_data: &[],
        }
    }

    #[test]
    fn overlap_is_flagged() {
        let mut rec = InodeRecord::new(256);
        rec.isize_ = 8192;
        process_file_extent(&mut rec, 0, &reg_extent(0, 4096, 4096, file_extent_type::REG), 4096);
        process_file_extent(&mut rec, 2048, &reg_extent(0, 4096, 4096, file_extent_type::REG), 4096);
        assert!(rec.errors.contains(InodeErrors::FILE_EXTENT_OVERLAP));
    }

    #[test]
    fn merge_sums_found_link() {
        let mut a = InodeRecord::new(300);
        a.found_link = 2;
        let mut b = InodeRecord::new(300);
        b.found_link = 3;
        merge_inode_recs(&mut a, b.clone());
        merge_inode_recs(&mut b, a.clone());
        assert_eq!(a.found_link, 5);
        assert_eq!(b.found_link, 8);
    }
}
