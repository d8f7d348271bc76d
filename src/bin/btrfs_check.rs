//! `btrfs-check`: thin CLI wrapper that parses exactly the documented
//! flags and hands off to [`btrfsck::check`]. A `clap`-derived `Opt`
//! struct, `anyhow` only at this binary boundary to print one final
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use btrfsck::check::run::CheckOptions;

/// Check (and optionally repair) a btrfs filesystem image offline.
#[derive(Parser)]
#[command(name = "btrfs-check")]
struct Opt {
    /// Select superblock mirror N (0 <= N < 3).
    #[arg(short = 's', value_name = "N")]
    superblock_mirror: Option<u32>,

    /// Enable the repair path. Implies read-write open.
    #[arg(long)]
    repair: bool,

    /// Reinitialise the checksum tree to empty. Implies read-write.
    #[arg(long = "init-csum-tree")]
    init_csum_tree: bool,

    /// Reinitialise the extent tree (accepted; same as `--init-csum-tree`
    /// for reinit purposes).
    #[arg(long = "init-extent-tree")]
    init_extent_tree: bool,

    /// Path to the unmounted device or filesystem image.
    device: PathBuf,
}

fn main() -> ExitCode {
    let opt = Opt::parse();

    let options = CheckOptions {
        superblock_mirror: opt.superblock_mirror,
        repair: opt.repair,
        init_csum_tree: opt.init_csum_tree,
        init_extent_tree: opt.init_extent_tree,
    };

    match run(&opt.device, &options) {
        Ok(true) => ExitCode::from(0),
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("btrfs-check: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns `Ok(true)` when the filesystem is clean, `Ok(false)` when
/// `check` ran to completion but found inconsistencies (exit code `1`);
/// I/O or open failures bubble up as `Err` (a nonzero process exit
/// distinct from "errors found").
fn run(device: &std::path::Path, options: &CheckOptions) -> anyhow::Result<bool> {
    let report = btrfsck::check(device, options).with_context(|| format!("checking {}", device.display()))?;

    println!("roots walked:      {}", report.stats.roots_walked);
    println!("inodes checked:    {}", report.stats.inodes_checked);
    println!("extents reconciled:{}", report.stats.extents_reconciled);
    println!("tree blocks read:  {}", report.stats.tree_blocks_read);
    println!("csummed bytes:     {}", report.stats.data_bytes_csummed);

    for f in &report.inode_findings {
        println!("root {} inode {}: {:?}", f.root, f.ino, f.errors);
    }
    for f in &report.extent_findings {
        println!(
            "extent ({:#x}, {:#x}): declared_refs={} walked_refs={}",
            f.start, f.len, f.declared_refs, f.walked_refs
        );
    }
    for root in &report.unreachable_roots {
        println!("unreachable root: {root}");
    }
    for err in &report.freespace_errors {
        println!("free-space: {err}");
    }
    for err in &report.csum_errors {
        println!("csum: {err}");
    }
    for bytenr in &report.repaired {
        println!("repaired extent at {bytenr:#x}");
    }

    Ok(report.is_clean())
}
