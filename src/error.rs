use thiserror::Error;

/// Errors surfaced by the btrfs checker/restore engine.
///
/// Pure-computation errors (parse/validation) are returned as structured
/// values; I/O errors bubble to the nearest retry boundary (mirror loop or
/// tree-walk top level).
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number in {0}")]
    BadMagic(&'static str),

    #[error("parse error: {0}")]
    Parse(&'static str),

    #[error("checksum mismatch in {0} at bytenr {1}")]
    CsumMismatch(&'static str, u64),

    #[error("checksum algorithm {0:?} is not implemented")]
    UnsupportedChecksum(crate::disk::superblock::CsumType),

    #[error("chunk profile {0:#x} is not supported (striped profiles are out of scope)")]
    UnsupportedChunkProfile(u64),

    #[error("no device open for devid {0}")]
    DeviceNotOpen(u64),

    #[error("corrupt tree block at bytenr {bytenr}: {reason}")]
    CorruptBlock { bytenr: u64, reason: &'static str },

    #[error("decompression failed for algorithm {0:?}")]
    Decompress(crate::disk::types::CompressionType),

    #[error("no readable superblock mirror found")]
    NoValidSuperblock,

    #[error("extent record for ({start}, {len}) could not be reconciled: {reason}")]
    Irreconcilable {
        start: u64,
        len: u64,
        reason: &'static str,
    },

    #[error("repair aborted: {0}")]
    RepairAborted(&'static str),

    #[error("loop guard tripped after {0} iterations without progress")]
    LoopGuardTripped(u32),

    #[error("operation aborted by user")]
    UserAborted,
}

pub type Result<T> = std::result::Result<T, BtrfsError>;
