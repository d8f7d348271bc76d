//! Checksum verifier: scans the checksum tree, coalesces contiguous csum
//! items, and at every discontinuity verifies an extent covers the
//! preceding logical range.

use crate::error::{BtrfsError, Result};

/// One coalesced run of contiguous checksum coverage, in logical byte space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsumRun {
    pub start: u64,
    pub end: u64,
}

/// Incrementally coalesces csum items presented in increasing key (logical
/// offset) order, `sectorsize` bytes at a time.
#[derive(Debug, Default)]
pub struct CsumCoalescer {
    current: Option<CsumRun>,
    pub runs: Vec<CsumRun>,
}

impl CsumCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `EXTENT_CSUM` item: `key.offset` is the logical start,
    /// `count * sectorsize` is the covered length.
    pub fn feed(&mut self, offset: u64, count: usize, sectorsize: u64) {
        let len = count as u64 * sectorsize;
        let end = offset + len;
        match &mut self.current {
            Some(run) if run.end == offset => run.end = end,
            Some(run) => {
                self.runs.push(*run);
                self.current = Some(CsumRun { start: offset, end });
            }
            None => self.current = Some(CsumRun { start: offset, end }),
        }
    }

    pub fn finish(mut self) -> Vec<CsumRun> {
        if let Some(run) = self.current.take() {
            self.runs.push(run);
        }
        self.runs
    }
}

/// Verify every coalesced csum run is covered by at least one extent from
/// `extents` (sorted `(start, len)` pairs drawn from the extent tree).
pub fn verify_coverage(runs: &[CsumRun], extents: &[(u64, u64)]) -> Result<()> {
    'runs: for run in runs {
        let mut cursor = run.start;
        while cursor < run.end {
            let covering = extents
                .iter()
                .find(|&&(start, len)| start <= cursor && cursor < start + len);
            match covering {
                Some(&(start, len)) => cursor = (start + len).min(run.end).max(cursor + 1),
                None => {
                    return Err(BtrfsError::Irreconcilable {
                        start: run.start,
                        len: run.end - run.start,
                        reason: "checksum range not covered by any extent",
                    });
                }
            }
            if cursor >= run.end {
                continue 'runs;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_items_coalesce() {
        let mut c = CsumCoalescer::new();
        c.feed(0, 1, 4096);
        c.feed(4096, 1, 4096);
        c.feed(8192, 1, 4096);
        let runs = c.finish();
        assert_eq!(runs, vec![CsumRun { start: 0, end: 12288 }]);
    }

    #[test]
    fn gap_starts_a_new_run() {
        let mut c = CsumCoalescer::new();
        c.feed(0, 1, 4096);
        c.feed(8192, 1, 4096);
        let runs = c.finish();
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn uncovered_run_is_an_error() {
        let runs = vec![CsumRun { start: 0, end: 4096 }];
        assert!(verify_coverage(&runs, &[]).is_err());
        assert!(verify_coverage(&runs, &[(0, 4096)]).is_ok());
    }
}
