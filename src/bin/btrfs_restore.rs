//! `btrfs-restore`: thin CLI wrapper over [`btrfsck::restore_fs`]. Prompts
//! on stdin for the loop-guard's `y/N` continue-or-abort decision, the one
//! piece of interactive behavior the library itself deliberately has no
//! terminal access for.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use btrfsck::restore::RestoreOptions;

/// Recover files from a (possibly damaged) btrfs filesystem image.
#[derive(Parser)]
#[command(name = "btrfs-restore")]
struct Opt {
    /// Also restore snapshots.
    #[arg(short = 's')]
    get_snaps: bool,

    /// Verbose output.
    #[arg(short = 'v')]
    verbose: bool,

    /// Ignore errors and keep going.
    #[arg(short = 'i')]
    ignore_errors: bool,

    /// Overwrite existing files at the destination.
    #[arg(short = 'o')]
    overwrite: bool,

    /// Heuristically locate the first directory instead of trusting the
    /// declared root dirid.
    #[arg(short = 'd')]
    find_first_dir: bool,

    /// List roots and exit; no destination directory required.
    #[arg(short = 'l')]
    list_roots: bool,

    /// Byte offset of the tree-root node, if the superblock's is unreadable.
    #[arg(short = 't', value_name = "BYTENR")]
    tree_loc: Option<u64>,

    /// Byte offset of the fs-root node, if the default is unreadable.
    #[arg(short = 'f', value_name = "BYTENR")]
    fs_loc: Option<u64>,

    /// Superblock mirror to start from.
    #[arg(short = 'u', value_name = "N")]
    mirror: Option<u32>,

    /// Explicit subvolume objectid to restore from.
    #[arg(short = 'r', value_name = "ROOT_ID")]
    root_id: Option<u64>,

    /// Path to the unmounted device or filesystem image.
    device: PathBuf,

    /// Destination directory on the host filesystem. Not required with
    /// `-l`.
    outdir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let opt = Opt::parse();
    match run(opt) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("btrfs-restore: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(opt: Opt) -> anyhow::Result<()> {
    if !opt.list_roots && opt.outdir.is_none() {
        anyhow::bail!("an output directory is required unless -l is given");
    }

    let verbose = opt.verbose;
    let options = RestoreOptions {
        get_snaps: opt.get_snaps,
        verbose,
        ignore_errors: opt.ignore_errors,
        overwrite: opt.overwrite,
        find_first_dir: opt.find_first_dir,
        list_roots: opt.list_roots,
        tree_loc: opt.tree_loc,
        fs_loc: opt.fs_loc,
        superblock_mirror: opt.mirror,
        root_id: opt.root_id,
        on_loop_guard: Some(Box::new(prompt_continue)),
    };

    let outdir = opt.outdir.clone().unwrap_or_else(|| PathBuf::from("."));
    let report = btrfsck::restore_fs(&opt.device, &outdir, &options).with_context(|| format!("restoring {}", opt.device.display()))?;

    if options.list_roots {
        for (objectid, root_dirid) in &report.roots {
            println!("{objectid}\t{root_dirid}");
        }
        return Ok(());
    }

    if verbose {
        println!("directories created: {}", report.dirs_created);
        println!("files restored:      {}", report.files_restored);
        println!("bytes written:        {}", report.bytes_written);
    }
    for err in &report.errors {
        eprintln!("warning: {err}");
    }
    Ok(())
}

/// Loop-guard prompt: `y/N` to continue past >1024 stalled iterations on
/// the current file/directory, or abort it.
fn prompt_continue(what: &str) -> bool {
    eprint!("{what} appears to be stuck (no progress after 1024 iterations); continue? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}
