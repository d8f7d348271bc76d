//! `open_fs`: tries superblock mirrors in turn, parses the chunk tree
//! (bootstrap array + the live `CHUNK_TREE_OBJECTID`), and hands back an
//! [`FsHandle`] everything else in the crate reads through.

use std::path::Path;

use crate::disk::chunk::{ChunkMapping, ChunkTree};
use crate::disk::superblock::{parse_chunk_item, parse_sys_chunk_array, sb_offset, FsContext};
use crate::disk::types::{key_type, BTRFS_SUPER_INFO_SIZE};
use crate::error::{BtrfsError, Result};
use crate::io::reader::{DeviceReader, DeviceSet, FileDevice};
use crate::tree::block_io::BlockIo;
use crate::tree::ops::TreeCursor;

/// Everything downstream components need to read tree blocks and data
/// extents: the parsed superblock context, the device set, and the fully
/// resolved chunk tree.
pub struct FsHandle {
    pub ctx: FsContext,
    pub devices: DeviceSet,
    pub chunks: ChunkTree,
}

impl FsHandle {
    pub fn block_io(&self) -> BlockIo<'_> {
        BlockIo::new(&self.devices, &self.chunks, self.ctx.nodesize)
    }
}

/// Open a (single-device) filesystem image, trying each superblock mirror
/// in turn. `preferred_mirror` is `check`'s `-s N` / `restore`'s `-u N`;
/// `None` means try mirror 0 first, then 1, then 2.
pub fn open_fs(path: &Path, preferred_mirror: Option<u32>, read_write: bool) -> Result<FsHandle> {
    let raw = if read_write { FileDevice::open_rw(path)? } else { FileDevice::open(path)? };
    let size = raw.size();

    let order: Vec<u32> = match preferred_mirror {
        Some(m) => std::iter::once(m).chain((0..3).filter(move |&x| x != m)).collect(),
        None => (0..3).collect(),
    };

    let mut last_err = None;
    for mirror in order {
        let offset = sb_offset(mirror);
        if offset + BTRFS_SUPER_INFO_SIZE as u64 > size {
            continue;
        }
        let buf = match raw.read_at(offset, BTRFS_SUPER_INFO_SIZE) {
            Ok(b) => b,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let ctx = match FsContext::from_superblock(&buf) {
            Ok(c) => c,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match build_handle(raw_clone_path(path, read_write)?, ctx) {
            Ok(handle) => return Ok(handle),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(BtrfsError::NoValidSuperblock))
}

fn raw_clone_path(path: &Path, read_write: bool) -> Result<FileDevice> {
    if read_write {
        FileDevice::open_rw(path)
    } else {
        FileDevice::open(path)
    }
}

fn build_handle(raw: FileDevice, ctx: FsContext) -> Result<FsHandle> {
    let mut devices = DeviceSet::new();
    devices.insert(ctx.primary_devid, raw);

    let bootstrap = parse_sys_chunk_array(&ctx.sys_chunk_array)?;
    let mut chunks = ChunkTree::from_bootstrap(&bootstrap);

    // Walk the live chunk tree to pick up mappings added after the
    // bootstrap snapshot embedded in the superblock.
    {
        let block_io = BlockIo::new(&devices, &chunks, ctx.nodesize);
        let cursor = TreeCursor::new(&block_io);
        let mut extra: Vec<(u64, ChunkMapping)> = Vec::new();
        cursor.for_each_item(ctx.chunk_root_bytenr, ctx.chunk_root_level, crate::disk::key::Key::MIN, |node, slot| {
            let key = node.item_key(slot);
            if key.item_type == key_type::CHUNK_ITEM {
                let (chunk_type, stripe_len, length, stripes) = parse_chunk_item(node.item_data(slot))?;
                extra.push((key.objectid, ChunkMapping { length, chunk_type, stripe_len, stripes }));
            }
            Ok(())
        })?;
        for (logical, mapping) in extra {
            chunks.insert(logical, mapping);
        }
    }

    Ok(FsHandle { ctx, devices, chunks })
}
