//! Block buffer and key/item codec: a typed, zero-copy-ish view over a
//! single tree-node buffer.
//!
//! Uses `zerocopy`-derived on-disk structs over a thin owned buffer wrapper
//! (most on-disk parsing in this crate reads a struct in place over
//! `&[u8]`; here the buffer is owned because COW needs to clone and mutate
//! it).

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::disk::key::{DiskKey, Key};
use crate::error::{BtrfsError, Result};

pub const HEADER_LEN: usize = 101;
const ITEM_LEN: usize = std::mem::size_of::<DiskItem>();
const KEY_PTR_LEN: usize = std::mem::size_of::<DiskKeyPtr>();

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct DiskHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: U64,
    pub flags: U64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: U64,
    pub owner: U64,
    pub nritems: U32,
    pub level: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct DiskItem {
    pub key: DiskKey,
    pub offset: U32,
    pub size: U32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct DiskKeyPtr {
    pub key: DiskKey,
    pub blockptr: U64,
    pub generation: U64,
}

/// An owned, mutable view over one tree-node buffer of `nodesize` bytes.
///
/// Multiple live [`crate::tree::path::TreePath`]s may share a `NodeBuffer`
/// for read via `Rc`; any mutation requires exclusive ownership (cloning on
/// write).
#[derive(Clone)]
pub struct NodeBuffer {
    buf: Vec<u8>,
}

impl NodeBuffer {
    pub fn from_raw(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BtrfsError::Parse("buffer too small for node header"));
        }
        Ok(NodeBuffer { buf })
    }

    pub fn zeroed(nodesize: usize) -> Self {
        NodeBuffer { buf: vec![0u8; nodesize] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    fn header(&self) -> &DiskHeader {
        DiskHeader::ref_from_bytes(&self.buf[..HEADER_LEN]).expect("checked length on construction")
    }

    fn header_mut(&mut self) -> &mut DiskHeader {
        DiskHeader::mut_from_bytes(&mut self.buf[..HEADER_LEN]).expect("checked length on construction")
    }

    pub fn bytenr(&self) -> u64 {
        self.header().bytenr.get()
    }
    pub fn set_bytenr(&mut self, v: u64) {
        self.header_mut().bytenr = U64::new(v);
    }
    pub fn generation(&self) -> u64 {
        self.header().generation.get()
    }
    pub fn set_generation(&mut self, v: u64) {
        self.header_mut().generation = U64::new(v);
    }
    pub fn owner(&self) -> u64 {
        self.header().owner.get()
    }
    pub fn set_owner(&mut self, v: u64) {
        self.header_mut().owner = U64::new(v);
    }
    pub fn nritems(&self) -> u32 {
        self.header().nritems.get()
    }
    pub fn set_nritems(&mut self, v: u32) {
        self.header_mut().nritems = U32::new(v);
    }
    pub fn level(&self) -> u8 {
        self.header().level
    }
    pub fn set_level(&mut self, v: u8) {
        self.header_mut().level = v;
    }
    pub fn flags(&self) -> u64 {
        self.header().flags.get()
    }
    pub fn set_flags(&mut self, v: u64) {
        self.header_mut().flags = U64::new(v);
    }
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn has_flag(&self, bit: u64) -> bool {
        self.flags() & bit != 0
    }
    pub fn set_flag(&mut self, bit: u64, on: bool) {
        let f = self.flags();
        self.set_flags(if on { f | bit } else { f & !bit });
    }

    pub fn backref_rev(&self) -> u8 {
        ((self.flags() & crate::disk::types::header_flags::BACKREF_REV_MASK)
            >> crate::disk::types::header_flags::BACKREF_REV_SHIFT) as u8
    }
    pub fn set_backref_rev(&mut self, rev: u8) {
        let f = self.flags() & !crate::disk::types::header_flags::BACKREF_REV_MASK;
        self.set_flags(f | ((rev as u64) << crate::disk::types::header_flags::BACKREF_REV_SHIFT));
    }

    // ---- internal-node (key_ptr) accessors ----

    pub fn node_key(&self, i: usize) -> Key {
        let off = HEADER_LEN + i * KEY_PTR_LEN;
        let kp = DiskKeyPtr::ref_from_bytes(&self.buf[off..off + KEY_PTR_LEN]).expect("bounds checked by caller");
        kp.key.into()
    }

    pub fn node_blockptr(&self, i: usize) -> u64 {
        let off = HEADER_LEN + i * KEY_PTR_LEN;
        let kp = DiskKeyPtr::ref_from_bytes(&self.buf[off..off + KEY_PTR_LEN]).expect("bounds checked by caller");
        kp.blockptr.get()
    }

    pub fn node_ptr_generation(&self, i: usize) -> u64 {
        let off = HEADER_LEN + i * KEY_PTR_LEN;
        let kp = DiskKeyPtr::ref_from_bytes(&self.buf[off..off + KEY_PTR_LEN]).expect("bounds checked by caller");
        kp.generation.get()
    }

    pub fn set_node_key_ptr(&mut self, i: usize, key: Key, blockptr: u64, generation: u64) {
        let off = HEADER_LEN + i * KEY_PTR_LEN;
        let kp = DiskKeyPtr::mut_from_bytes(&mut self.buf[off..off + KEY_PTR_LEN]).expect("bounds checked by caller");
        kp.key = key.into();
        kp.blockptr = U64::new(blockptr);
        kp.generation = U64::new(generation);
    }

    /// Insert a new child pointer at `slot`, shifting existing entries right
    /// and growing `nritems` by one.
    pub fn insert_node_key_ptr(&mut self, slot: usize, key: Key, blockptr: u64, generation: u64) {
        let n = self.nritems() as usize;
        if slot < n {
            self.copy_key_ptrs(slot + 1, slot, n - slot);
        }
        self.set_node_key_ptr(slot, key, blockptr, generation);
        self.set_nritems((n + 1) as u32);
    }

    /// Remove the child pointer at `slot`, shifting later entries left and
    /// shrinking `nritems` by one.
    pub fn delete_node_key_ptr(&mut self, slot: usize) {
        let n = self.nritems() as usize;
        if slot + 1 < n {
            self.copy_key_ptrs(slot, slot + 1, n - slot - 1);
        }
        self.set_nritems((n - 1) as u32);
    }

    /// First key of this node, whether it's a leaf (first item's key) or an
    /// internal node (first child pointer's key, which must equal the
    /// first key anywhere in that child's subtree).
    pub fn first_key(&self) -> Key {
        if self.is_leaf() {
            self.item_key(0)
        } else {
            self.node_key(0)
        }
    }

    /// Shift `count` key_ptrs starting at `src` to start at `dst` (used by
    /// insert/delete/split/merge on interior nodes).
    pub fn copy_key_ptrs(&mut self, dst: usize, src: usize, count: usize) {
        if count == 0 {
            return;
        }
        let dst_off = HEADER_LEN + dst * KEY_PTR_LEN;
        let src_off = HEADER_LEN + src * KEY_PTR_LEN;
        let len = count * KEY_PTR_LEN;
        self.buf.copy_within(src_off..src_off + len, dst_off);
    }

    // ---- leaf (item) accessors ----

    pub fn item_key(&self, i: usize) -> Key {
        let off = HEADER_LEN + i * ITEM_LEN;
        let item = DiskItem::ref_from_bytes(&self.buf[off..off + ITEM_LEN]).expect("bounds checked by caller");
        item.key.into()
    }

    pub fn item_offset(&self, i: usize) -> usize {
        let off = HEADER_LEN + i * ITEM_LEN;
        let item = DiskItem::ref_from_bytes(&self.buf[off..off + ITEM_LEN]).expect("bounds checked by caller");
        item.offset.get() as usize
    }

    pub fn item_size(&self, i: usize) -> usize {
        let off = HEADER_LEN + i * ITEM_LEN;
        let item = DiskItem::ref_from_bytes(&self.buf[off..off + ITEM_LEN]).expect("bounds checked by caller");
        item.size.get() as usize
    }

    /// Data payload of leaf item `i`, as stored from the tail of the buffer.
    pub fn item_data(&self, i: usize) -> &[u8] {
        let start = HEADER_LEN + self.item_offset(i);
        let len = self.item_size(i);
        &self.buf[start..start + len]
    }

    pub fn set_item_descriptor(&mut self, i: usize, key: Key, offset: usize, size: usize) {
        let off = HEADER_LEN + i * ITEM_LEN;
        let item = DiskItem::mut_from_bytes(&mut self.buf[off..off + ITEM_LEN]).expect("bounds checked by caller");
        item.key = key.into();
        item.offset = U32::new(offset as u32);
        item.size = U32::new(size as u32);
    }

    pub fn set_item_data(&mut self, offset: usize, data: &[u8]) {
        let start = HEADER_LEN + offset;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn copy_item_descriptors(&mut self, dst: usize, src: usize, count: usize) {
        if count == 0 {
            return;
        }
        let dst_off = HEADER_LEN + dst * ITEM_LEN;
        let src_off = HEADER_LEN + src * ITEM_LEN;
        let len = count * ITEM_LEN;
        self.buf.copy_within(src_off..src_off + len, dst_off);
    }

    /// Total payload capacity (bytes after the header).
    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    /// Leaf: byte offset (relative to payload start) where item data
    /// currently ends toward the tail (lowest `item_offset`).
    pub fn leaf_data_end(&self) -> usize {
        let n = self.nritems() as usize;
        if n == 0 {
            return self.payload_len();
        }
        (0..n).map(|i| self.item_offset(i)).min().unwrap_or(self.payload_len())
    }

    /// Free bytes remaining in a leaf: gap between the item-descriptor
    /// array (growing from the front) and the item-data area (growing
    /// from the tail).
    pub fn leaf_free_space(&self) -> usize {
        let used_by_items = self.nritems() as usize * ITEM_LEN;
        self.leaf_data_end().saturating_sub(used_by_items)
    }

    /// Capacity check: how many key_ptr entries fit in one node.
    pub fn max_node_ptrs(&self) -> usize {
        self.payload_len() / KEY_PTR_LEN
    }

    /// Binary search for `key` among the first `nritems` entries
    /// (leaf items or interior key_ptrs — both start with a `Key`).
    pub fn bin_search(&self, key: Key) -> std::result::Result<usize, usize> {
        let n = self.nritems() as usize;
        let get = |i: usize| if self.is_leaf() { self.item_key(i) } else { self.node_key(i) };
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match get(mid).cmp(&key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Comparator over a disk key and an in-memory key.
pub fn comp_keys(disk: DiskKey, cpu: Key) -> std::cmp::Ordering {
    let disk_key: Key = disk.into();
    disk_key.cmp(&cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_leaf(nodesize: usize, items: &[(Key, &[u8])]) -> NodeBuffer {
        let mut nb = NodeBuffer::zeroed(nodesize);
        nb.set_level(0);
        nb.set_nritems(items.len() as u32);
        let mut tail = nb.payload_len();
        for (i, (k, data)) in items.iter().enumerate() {
            tail -= data.len();
            nb.set_item_descriptor(i, *k, tail, data.len());
            nb.set_item_data(tail, data);
        }
        nb
    }

    #[test]
    fn leaf_round_trip() {
        let items: Vec<(Key, &[u8])> = vec![
            (Key::new(1, 0x01, 0), b"aaaa"),
            (Key::new(2, 0x01, 0), b"bb"),
            (Key::new(3, 0x01, 0), b"cccccc"),
        ];
        let nb = make_leaf(4096, &items);
        for (i, (k, data)) in items.iter().enumerate() {
            assert_eq!(nb.item_key(i), *k);
            assert_eq!(nb.item_data(i), *data);
        }
        assert_eq!(nb.bin_search(Key::new(2, 0x01, 0)), Ok(1));
        assert_eq!(nb.bin_search(Key::new(2, 0x01, 5)), Err(2));
    }
}
