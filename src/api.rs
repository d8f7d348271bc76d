//! Library entry points: a thin function-per-operation facade over the
//! orchestration modules, rather than a type the caller has to construct
//! by hand. `check`/`restore` return one finished report from a batch run
//! rather than streaming per-item callbacks — there is no per-item event
//! a caller could usefully act on mid-run.

use std::path::Path;

use crate::check::run::{run_check, CheckOptions, CheckReport};
use crate::error::Result;
use crate::fs::open_fs;
use crate::restore::{run_restore, RestoreOptions, RestoreReport};

/// Run a full consistency check against the filesystem image at
/// `device_path`.
pub fn check(device_path: &Path, options: &CheckOptions) -> Result<CheckReport> {
    let read_write = options.repair || options.init_csum_tree || options.init_extent_tree;
    let fs = open_fs(device_path, options.superblock_mirror, read_write)?;
    run_check(&fs, options)
}

/// Extract files from the filesystem image at `device_path` into
/// `out_dir`.
pub fn restore(device_path: &Path, out_dir: &Path, options: &RestoreOptions) -> Result<RestoreReport> {
    let fs = open_fs(device_path, options.superblock_mirror, false)?;
    run_restore(&fs, out_dir, options)
}
