//! Device I/O boundary. Single-threaded, synchronous — no read-ahead or
//! batching engine: every tree walk in this crate is one block at a time,
//! cooperatively scheduled, with no parallel worker pool.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{BtrfsError, Result};

/// I/O phase labels for optional diagnostics, consumed by the trace
/// instrumentation below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPhase {
    Superblock,
    ChunkTree,
    TreeWalk,
    Extent,
    FreeSpace,
    Csum,
    Restore,
}

impl std::fmt::Display for IoPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Superblock => "superblock",
            Self::ChunkTree => "chunk_tree",
            Self::TreeWalk => "tree_walk",
            Self::Extent => "extent",
            Self::FreeSpace => "free_space",
            Self::Csum => "csum",
            Self::Restore => "restore",
        };
        write!(f, "{s}")
    }
}

/// Read access to one open device/image file.
pub trait DeviceReader {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn size(&self) -> u64;
}

pub struct FileDevice {
    file: File,
    size: u64,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileDevice { file, size })
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileDevice { file, size })
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }
}

impl DeviceReader for FileDevice {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size {
            return Err(BtrfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// All open devices belonging to one filesystem, keyed by `devid`.
/// Multi-device filesystems are read-only supported: a logical read whose
/// chunk mapping names a devid with no matching open file surfaces
/// [`BtrfsError::DeviceNotOpen`] rather than silently reading zeros.
#[derive(Default)]
pub struct DeviceSet {
    devices: HashMap<u64, FileDevice>,
    io_log: Option<std::cell::RefCell<std::io::BufWriter<File>>>,
}

impl DeviceSet {
    pub fn new() -> Self {
        let io_log = std::env::var("BTRFSCK_IO_LOG").ok().and_then(|path| {
            File::create(path).ok().map(|f| std::cell::RefCell::new(std::io::BufWriter::new(f)))
        });
        DeviceSet { devices: HashMap::new(), io_log }
    }

    pub fn insert(&mut self, devid: u64, device: FileDevice) {
        self.devices.insert(devid, device);
    }

    pub fn contains(&self, devid: u64) -> bool {
        self.devices.contains_key(&devid)
    }

    fn log(&self, phase: IoPhase, devid: u64, offset: u64, len: usize) {
        if let Some(log) = &self.io_log {
            use std::io::Write;
            let _ = writeln!(log.borrow_mut(), "{phase},{devid},{offset},{len}");
        }
    }

    pub fn read_at(&self, devid: u64, offset: u64, len: usize, phase: IoPhase) -> Result<Vec<u8>> {
        let dev = self.devices.get(&devid).ok_or(BtrfsError::DeviceNotOpen(devid))?;
        self.log(phase, devid, offset, len);
        dev.read_at(offset, len)
    }

    pub fn write_at(&self, devid: u64, offset: u64, data: &[u8]) -> Result<()> {
        let dev = self.devices.get(&devid).ok_or(BtrfsError::DeviceNotOpen(devid))?;
        dev.write_at(offset, data)
    }

    pub fn device_size(&self, devid: u64) -> Option<u64> {
        self.devices.get(&devid).map(|d| d.size())
    }

    pub fn primary_devid(&self) -> Option<u64> {
        self.devices.keys().copied().min()
    }
}
