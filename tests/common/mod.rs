//! Shared fixture builder for the integration tests: assembles a tiny,
//! hand-built filesystem image in memory (one root-tree leaf, one fs-tree
//! leaf, one extent-tree leaf, one data block) and writes it through the
//! same [`BlockIo`]/[`DeviceSet`]/[`ChunkTree`] plumbing `open_fs` would,
//! so `run_check`/`run_restore` exercise their real on-disk-format path
//! rather than a mocked one.

use std::path::Path;

use tempfile::NamedTempFile;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::IntoBytes;

use btrfsck::disk::chunk::{ChunkMapping, ChunkTree};
use btrfsck::disk::items::{
    extent_flags, DirItemHeader, ExtentDataRef, ExtentInlineRefHeader, ExtentItemHeader, FileExtentHeader, FileExtentRegular, InodeItem, InodeRefHeader,
    RootItem, Timespec,
};
use btrfsck::disk::key::Key;
use btrfsck::disk::node::NodeBuffer;
use btrfsck::disk::superblock::{CsumType, FsContext};
use btrfsck::disk::types::{file_extent_type, filetype, incompat_flags, key_type, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_TREE_OBJECTID, S_IFDIR, S_IFREG};
use btrfsck::error::Result;
use btrfsck::fs::FsHandle;
use btrfsck::io::reader::{DeviceSet, FileDevice};
use btrfsck::tree::block_io::BlockIo;
use btrfsck::tree::ops::leaf;

pub const NODESIZE: u32 = 4096;
pub const SECTORSIZE: u32 = 4096;
pub const IMAGE_SIZE: u64 = 0x110000;

pub const ROOT_TREE_LEAF: u64 = 0x100000;
pub const FS_TREE_LEAF: u64 = 0x101000;
pub const EXTENT_TREE_LEAF: u64 = 0x102000;
pub const DATA_BLOCK: u64 = 0x103000;

pub const ROOT_DIR_INO: u64 = 256;
pub const FILE_INO: u64 = 257;
pub const FILE_NAME: &[u8] = b"foo";
pub const FILE_CONTENT: &[u8] = b"integration fixture file contents\n";

const DEVID: u64 = 1;
/// Generation stamped on every hand-built leaf, chosen to equal
/// `GENERATION + 1` (the repairer's own generation) so a COW descent over
/// these leaves finds them already current and edits in place instead of
/// relocating them (`tree::ops::TreeCursor::cow_node`).
const LEAF_GENERATION: u64 = 11;
const GENERATION: u64 = 10;

fn zero_ts() -> Timespec {
    Timespec { sec: U64::new(0), nsec: U32::new(0) }
}

fn inode_item(mode: u32, nlink: u32, size: u64, nbytes: u64) -> InodeItem {
    InodeItem {
        generation: U64::new(LEAF_GENERATION),
        transid: U64::new(LEAF_GENERATION),
        size: U64::new(size),
        nbytes: U64::new(nbytes),
        block_group: U64::new(0),
        nlink: U32::new(nlink),
        uid: U32::new(0),
        gid: U32::new(0),
        mode: U32::new(mode),
        rdev: U64::new(0),
        flags: U64::new(0),
        sequence: U64::new(0),
        reserved: [U64::new(0); 4],
        atime: zero_ts(),
        ctime: zero_ts(),
        mtime: zero_ts(),
        otime: zero_ts(),
    }
}

fn inode_ref_bytes(index: u64, name: &[u8]) -> Vec<u8> {
    let hdr = InodeRefHeader { index: U64::new(index), name_len: U16::new(name.len() as u16) };
    let mut v = hdr.as_bytes().to_vec();
    v.extend_from_slice(name);
    v
}

fn dir_item_bytes(location: Key, file_type: u8, name: &[u8]) -> Vec<u8> {
    let hdr = DirItemHeader { location: location.into(), transid: U64::new(LEAF_GENERATION), data_len: U16::new(0), name_len: U16::new(name.len() as u16), file_type };
    let mut v = hdr.as_bytes().to_vec();
    v.extend_from_slice(name);
    v
}

fn file_extent_reg_bytes(ram_bytes: u64, disk_bytenr: u64, disk_num_bytes: u64, offset: u64, num_bytes: u64) -> Vec<u8> {
    let hdr = FileExtentHeader { generation: U64::new(LEAF_GENERATION), ram_bytes: U64::new(ram_bytes), compression: 0, encryption: 0, other_encoding: U16::new(0), extent_type: file_extent_type::REG };
    let reg = FileExtentRegular { disk_bytenr: U64::new(disk_bytenr), disk_num_bytes: U64::new(disk_num_bytes), offset: U64::new(offset), num_bytes: U64::new(num_bytes) };
    let mut v = hdr.as_bytes().to_vec();
    v.extend_from_slice(reg.as_bytes());
    v
}

/// One `EXTENT_ITEM` with a single inline `EXTENT_DATA_REF`. `count` is the
/// on-disk ref count *before* the declared-side scan's own bookkeeping
/// bump (`ExtentRecord::mark_found_extent_tree` adds one on top of
/// whatever's embedded here, see check/extent.rs) — callers that want the
/// merged slot to land on `num_refs == 1` pass `count: 0`.
fn extent_item_with_inline_data_ref(declared_refs: u64, root: u64, objectid: u64, offset: u64, count: u32) -> Vec<u8> {
    let hdr = ExtentItemHeader { refs: U64::new(declared_refs), generation: U64::new(LEAF_GENERATION), flags: U64::new(extent_flags::DATA) };
    let inline_hdr = ExtentInlineRefHeader { ref_type: key_type::EXTENT_DATA_REF, offset: U64::new(0) };
    let dref = ExtentDataRef { root: U64::new(root), objectid: U64::new(objectid), offset: U64::new(offset), count: U32::new(count) };
    let mut v = hdr.as_bytes().to_vec();
    v.extend_from_slice(inline_hdr.as_bytes());
    v.extend_from_slice(dref.as_bytes());
    v
}

fn root_item_bytes(root_dirid: u64, bytenr: u64, level: u8) -> Vec<u8> {
    let item = RootItem {
        inode: inode_item(S_IFDIR | 0o755, 1, 0, 0),
        generation: U64::new(LEAF_GENERATION),
        root_dirid: U64::new(root_dirid),
        bytenr: U64::new(bytenr),
        byte_limit: U64::new(0),
        bytes_used: U64::new(0),
        last_snapshot: U64::new(0),
        flags: U64::new(0),
        refs: U32::new(1),
        drop_progress: Key::MIN.into(),
        drop_level: 0,
        level,
    };
    item.as_bytes().to_vec()
}

fn build_leaf(bytenr: u64, owner: u64, items: &[(Key, Vec<u8>)]) -> NodeBuffer {
    let mut nb = NodeBuffer::zeroed(NODESIZE as usize);
    nb.set_level(0);
    nb.set_bytenr(bytenr);
    nb.set_owner(owner);
    nb.set_generation(LEAF_GENERATION);
    for (key, data) in items {
        match leaf::insert_item(&mut nb, *key, data) {
            leaf::InsertOutcome::Inserted => {}
            leaf::InsertOutcome::NeedsSplit => panic!("fixture leaf overflowed nodesize"),
        }
    }
    nb
}

fn root_tree_leaf() -> NodeBuffer {
    build_leaf(
        ROOT_TREE_LEAF,
        BTRFS_ROOT_TREE_OBJECTID,
        &[
            (Key::new(BTRFS_EXTENT_TREE_OBJECTID, key_type::ROOT_ITEM, 0), root_item_bytes(0, EXTENT_TREE_LEAF, 0)),
            (Key::new(BTRFS_FS_TREE_OBJECTID, key_type::ROOT_ITEM, 0), root_item_bytes(ROOT_DIR_INO, FS_TREE_LEAF, 0)),
        ],
    )
}

/// One subvolume root directory (256) holding one regular file (257)
/// named `foo`, with every cross-reference (`INODE_REF`/`DIR_ITEM`/
/// `DIR_INDEX`/`EXTENT_DATA`) a careful reviewer of `check/inode.rs`'s
/// `InodeErrors` would demand to avoid every one of its fifteen flags.
fn fs_tree_leaf() -> NodeBuffer {
    let file_location = Key::new(FILE_INO, key_type::INODE_ITEM, 0);
    build_leaf(
        FS_TREE_LEAF,
        BTRFS_FS_TREE_OBJECTID,
        &[
            (Key::new(ROOT_DIR_INO, key_type::INODE_ITEM, 0), inode_item(S_IFDIR | 0o755, 1, 0, 0).as_bytes().to_vec()),
            (Key::new(ROOT_DIR_INO, key_type::INODE_REF, ROOT_DIR_INO), inode_ref_bytes(0, b"..")),
            (Key::new(ROOT_DIR_INO, key_type::DIR_ITEM, 0x1234), dir_item_bytes(file_location, filetype::REG, FILE_NAME)),
            (Key::new(ROOT_DIR_INO, key_type::DIR_INDEX, 2), dir_item_bytes(file_location, filetype::REG, FILE_NAME)),
            (Key::new(FILE_INO, key_type::INODE_ITEM, 0), inode_item(S_IFREG | 0o644, 1, FILE_CONTENT.len() as u64, SECTORSIZE as u64).as_bytes().to_vec()),
            (Key::new(FILE_INO, key_type::INODE_REF, ROOT_DIR_INO), inode_ref_bytes(2, FILE_NAME)),
            (Key::new(FILE_INO, key_type::EXTENT_DATA, 0), file_extent_reg_bytes(SECTORSIZE as u64, DATA_BLOCK, SECTORSIZE as u64, 0, SECTORSIZE as u64)),
        ],
    )
}

fn extent_tree_leaf(declared_refs: u64) -> NodeBuffer {
    build_leaf(
        EXTENT_TREE_LEAF,
        BTRFS_EXTENT_TREE_OBJECTID,
        &[(
            Key::new(DATA_BLOCK, key_type::EXTENT_ITEM, SECTORSIZE as u64),
            extent_item_with_inline_data_ref(declared_refs, BTRFS_FS_TREE_OBJECTID, FILE_INO, 0, 0),
        )],
    )
}

/// Build a synthetic single-device image backing a clean (or, with
/// `declared_extent_refs != 1`, deliberately broken) filesystem, and
/// return the open `FsHandle` plus the backing tempfile (kept alive for
/// the caller's lifetime; dropping it deletes the image).
pub fn build_fixture(declared_extent_refs: u64) -> Result<(NamedTempFile, FsHandle)> {
    let tmp = NamedTempFile::new()?;
    tmp.as_file().set_len(IMAGE_SIZE)?;

    let mut devices = DeviceSet::new();
    devices.insert(DEVID, FileDevice::open_rw(tmp.path())?);

    let mut chunks = ChunkTree::new();
    chunks.insert(0, ChunkMapping { length: IMAGE_SIZE, chunk_type: 0, stripe_len: 65536, stripes: vec![(DEVID, 0)] });

    {
        let block_io = BlockIo::new(&devices, &chunks, NODESIZE);
        let mut root_leaf = root_tree_leaf();
        let mut fs_leaf = fs_tree_leaf();
        let mut extent_leaf = extent_tree_leaf(declared_extent_refs);
        block_io.write_tree_block(&mut root_leaf)?;
        block_io.write_tree_block(&mut fs_leaf)?;
        block_io.write_tree_block(&mut extent_leaf)?;
    }

    let mut content = vec![0u8; SECTORSIZE as usize];
    content[..FILE_CONTENT.len()].copy_from_slice(FILE_CONTENT);
    devices.write_at(DEVID, DATA_BLOCK, &content)?;

    let ctx = FsContext {
        fsid: [0u8; 16],
        generation: GENERATION,
        root_bytenr: ROOT_TREE_LEAF,
        root_level: 0,
        chunk_root_bytenr: 0,
        chunk_root_level: 0,
        log_root_bytenr: 0,
        log_root_level: 0,
        total_bytes: IMAGE_SIZE,
        bytes_used: 0x10000,
        root_dir_objectid: ROOT_DIR_INO,
        num_devices: 1,
        sectorsize: SECTORSIZE,
        nodesize: NODESIZE,
        stripesize: SECTORSIZE,
        csum_type: CsumType::Crc32c,
        incompat_flags: incompat_flags::MIXED_BACKREF,
        sys_chunk_array: Vec::new(),
        primary_devid: DEVID,
    };

    Ok((tmp, FsHandle { ctx, devices, chunks }))
}

#[allow(dead_code)]
pub fn image_path(tmp: &NamedTempFile) -> &Path {
    tmp.path()
}
