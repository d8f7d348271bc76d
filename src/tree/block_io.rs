//! `read_tree_block` / `write_tree_block`: resolves a logical bytenr through
//! the chunk tree, tries each mirror copy in turn, and checksum/bytenr-
//! verifies the result before handing back a [`NodeBuffer`].

use crate::disk::chunk::ChunkTree;
use crate::disk::node::NodeBuffer;
use crate::error::{BtrfsError, Result};
use crate::io::reader::{DeviceSet, IoPhase};

pub struct BlockIo<'a> {
    pub devices: &'a DeviceSet,
    pub chunks: &'a ChunkTree,
    pub nodesize: u32,
}

impl<'a> BlockIo<'a> {
    pub fn new(devices: &'a DeviceSet, chunks: &'a ChunkTree, nodesize: u32) -> Self {
        BlockIo { devices, chunks, nodesize }
    }

    /// Read and verify the tree block at logical `bytenr`, trying every
    /// mirror copy the chunk mapping names before giving up — a corrupt
    /// primary copy shouldn't abort the whole walk if a DUP/RAID1 mirror
    /// is intact.
    pub fn read_tree_block(&self, bytenr: u64) -> Result<NodeBuffer> {
        let copies = self.chunks.map_block(bytenr, self.nodesize as u64)?;
        let mut last_err = None;
        for (devid, phys) in copies {
            match self.devices.read_at(devid, phys, self.nodesize as usize, IoPhase::TreeWalk) {
                Ok(buf) => match Self::verify(&buf, bytenr) {
                    Ok(nb) => return Ok(nb),
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(BtrfsError::CorruptBlock { bytenr, reason: "no readable mirror" }))
    }

    /// Read `len` bytes of file-extent data at logical `(logical, len)`,
    /// trying every mirror copy in turn. Unlike [`Self::read_tree_block`]
    /// there's no per-block checksum to verify here — data-extent integrity
    /// is the checksum tree's job, not this read path's.
    pub fn read_data_extent(&self, logical: u64, len: u64) -> Result<Vec<u8>> {
        self.try_each_mirror(logical, len, |buf| Ok(buf.to_vec()))
    }

    /// Try `attempt` against every mirror copy of `(logical, len)` in turn,
    /// returning the first success. Retries the whole extent (read plus
    /// `attempt`) against the next mirror on any failure, not just a short
    /// read — used by the restore engine so a decompression failure on
    /// mirror 1 falls through to mirror 2 exactly like a short read does.
    pub fn try_each_mirror<T>(&self, logical: u64, len: u64, mut attempt: impl FnMut(&[u8]) -> Result<T>) -> Result<T> {
        let copies = self.chunks.map_block(logical, len)?;
        let mut last_err = None;
        for (devid, phys) in copies {
            match self.devices.read_at(devid, phys, len as usize, IoPhase::Extent) {
                Ok(buf) if buf.len() as u64 == len => match attempt(&buf) {
                    Ok(v) => return Ok(v),
                    Err(e) => last_err = Some(e),
                },
                Ok(_) => last_err = Some(BtrfsError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"))),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(BtrfsError::CorruptBlock { bytenr: logical, reason: "no readable mirror" }))
    }

    fn verify(buf: &[u8], expected_bytenr: u64) -> Result<NodeBuffer> {
        if buf.len() < 32 {
            return Err(BtrfsError::CorruptBlock { bytenr: expected_bytenr, reason: "short read" });
        }
        let computed = crc32c::crc32c(&buf[32..]);
        let stored = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if computed != stored {
            return Err(BtrfsError::CsumMismatch("tree block", expected_bytenr));
        }
        let nb = NodeBuffer::from_raw(buf.to_vec())?;
        if nb.bytenr() != expected_bytenr {
            return Err(BtrfsError::CorruptBlock { bytenr: expected_bytenr, reason: "bytenr mismatch" });
        }
        Ok(nb)
    }

    /// Write a freshly COW-ed or repaired block to every mirror copy,
    /// stamping the checksum first.
    pub fn write_tree_block(&self, node: &mut NodeBuffer) -> Result<()> {
        let bytenr = node.bytenr();
        let csum = crc32c::crc32c(&node.as_bytes()[32..]);
        node.raw_mut()[0..4].copy_from_slice(&csum.to_le_bytes());
        let copies = self.chunks.map_block(bytenr, self.nodesize as u64)?;
        for (devid, phys) in copies {
            self.devices.write_at(devid, phys, node.as_bytes())?;
        }
        Ok(())
    }
}
