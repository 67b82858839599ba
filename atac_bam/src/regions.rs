//! Includable-region restriction.
//!
//! The includable genome is every reference contig span minus blacklist
//! intervals minus any fully excluded contigs (typically the mitochondrial
//! one). A record stays when its alignment span overlaps at least one
//! includable interval.

use anyhow::{Context, Result};
use atac_types::peaks::PeakSet;
use itertools::Itertools;
use rust_htslib::bam;
use rust_htslib::bam::Read;
use std::collections::HashMap;
use std::path::Path;

/// Per-tid sorted, non-overlapping includable intervals (0-based half-open).
#[derive(Clone, Debug)]
pub struct IncludableRegions {
    per_tid: Vec<Vec<(i64, i64)>>,
}

impl IncludableRegions {
    /// Build the includable intervals for the reference described by
    /// `header`. Blacklist entries on contigs the header does not know are
    /// ignored with a warning.
    pub fn build(
        header: &bam::HeaderView,
        blacklist: Option<&Path>,
        exclude_contigs: &[String],
    ) -> Result<IncludableRegions> {
        let n_targets = header.target_count() as usize;
        let mut contig_lens = Vec::with_capacity(n_targets);
        for tid in 0..n_targets {
            let len = header
                .target_len(tid as u32)
                .with_context(|| format!("Missing length for reference sequence {tid}"))?;
            contig_lens.push(len as i64);
        }

        let mut blocked: HashMap<usize, Vec<(i64, i64)>> = HashMap::new();
        if let Some(path) = blacklist {
            let entries = PeakSet::from_bed(path, "blacklist")?;
            for peak in &entries.peaks {
                match header.tid(peak.chrom.as_bytes()) {
                    Some(tid) => {
                        blocked
                            .entry(tid as usize)
                            .or_default()
                            .push((peak.start, peak.end));
                    }
                    None => log::warn!(
                        "Blacklist interval {}:{}-{} names a contig the alignments do not have",
                        peak.chrom,
                        peak.start,
                        peak.end
                    ),
                }
            }
        }

        let excluded_tids: Vec<usize> = exclude_contigs
            .iter()
            .filter_map(|name| header.tid(name.as_bytes()).map(|tid| tid as usize))
            .collect();

        let per_tid = contig_lens
            .iter()
            .enumerate()
            .map(|(tid, &len)| {
                if excluded_tids.contains(&tid) {
                    return Vec::new();
                }
                match blocked.remove(&tid) {
                    Some(intervals) => subtract(len, intervals),
                    None => vec![(0, len)],
                }
            })
            .collect();

        Ok(IncludableRegions { per_tid })
    }

    /// Build against the header of the BAM at `path`.
    pub fn from_bam(
        path: &Path,
        blacklist: Option<&Path>,
        exclude_contigs: &[String],
    ) -> Result<IncludableRegions> {
        let reader = bam::Reader::from_path(path)
            .with_context(|| format!("Error opening BAM {}", path.display()))?;
        IncludableRegions::build(reader.header(), blacklist, exclude_contigs)
    }

    /// Does the span [start, end) on `tid` overlap any includable interval?
    pub fn contains(&self, tid: i32, start: i64, end: i64) -> bool {
        if tid < 0 {
            return false;
        }
        let Some(intervals) = self.per_tid.get(tid as usize) else {
            return false;
        };
        let idx = intervals.partition_point(|&(_, interval_end)| interval_end <= start);
        intervals
            .get(idx)
            .is_some_and(|&(interval_start, _)| interval_start < end)
    }

    /// Total number of includable intervals.
    pub fn interval_count(&self) -> usize {
        self.per_tid.iter().map(Vec::len).sum()
    }
}

/// Complement of `blocked` within [0, len). Blocked intervals may overlap
/// each other and may extend past the contig end.
fn subtract(len: i64, blocked: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    let mut result = Vec::new();
    let mut cursor = 0;
    for (start, end) in blocked
        .into_iter()
        .map(|(s, e)| (s.clamp(0, len), e.clamp(0, len)))
        .sorted()
    {
        if start > cursor {
            result.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if cursor < len {
        result.push((cursor, len));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::two_contig_header;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn header_view() -> bam::HeaderView {
        bam::HeaderView::from_header(&two_contig_header())
    }

    #[test]
    fn test_subtract() {
        assert_eq!(subtract(100, vec![]), vec![(0, 100)]);
        assert_eq!(subtract(100, vec![(10, 20)]), vec![(0, 10), (20, 100)]);
        assert_eq!(subtract(100, vec![(0, 30), (20, 40)]), vec![(40, 100)]);
        assert_eq!(subtract(100, vec![(90, 150)]), vec![(0, 90)]);
        assert_eq!(subtract(100, vec![(0, 100)]), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn test_full_genome_without_blacklist() {
        let regions = IncludableRegions::build(&header_view(), None, &[]).unwrap();
        assert_eq!(regions.interval_count(), 2);
        assert!(regions.contains(0, 0, 1));
        assert!(regions.contains(1, 7999, 8000));
        assert!(!regions.contains(-1, 0, 1));
    }

    #[test]
    fn test_excluded_contig() {
        let regions =
            IncludableRegions::build(&header_view(), None, &["chr2".to_string()]).unwrap();
        assert!(regions.contains(0, 100, 200));
        assert!(!regions.contains(1, 100, 200));
    }

    #[test]
    fn test_blacklist_subtraction() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = dir.path().join("blacklist.bed");
        let mut file = std::fs::File::create(&blacklist).unwrap();
        writeln!(file, "chr1\t1000\t2000").unwrap();
        writeln!(file, "chrUn\t0\t100").unwrap();
        drop(file);

        let regions =
            IncludableRegions::build(&header_view(), Some(&blacklist), &[]).unwrap();

        assert!(regions.contains(0, 500, 600));
        assert!(!regions.contains(0, 1200, 1300));
        // overlap with the boundary keeps the record
        assert!(regions.contains(0, 950, 1050));
        assert!(regions.contains(0, 1950, 2050));
        // fully inside the blacklist from both sides
        assert!(!regions.contains(0, 1000, 2000));
        assert_eq!(regions.interval_count(), 3);
    }
}
