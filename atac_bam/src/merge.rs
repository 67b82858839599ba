//! Native merging of coordinate-sorted BAMs.
//!
//! Inputs must be coordinate sorted against the same reference; a k-way heap
//! merge preserves global order without re-sorting. Unmapped records sort
//! after all mapped ones, and records at equal coordinates come out in input
//! rank order so merges are deterministic.

use anyhow::{bail, Context, Result};
use atac_types::errors::AlignmentError;
use rust_htslib::bam::record::Record;
use rust_htslib::bam::{self, Read};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

#[derive(Serialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct MergeStats {
    pub inputs: usize,
    pub records: u64,
}

struct QueuedRecord {
    tid: i64,
    pos: i64,
    rank: usize,
    rec: Record,
}

impl QueuedRecord {
    fn new(rec: Record, rank: usize) -> QueuedRecord {
        let tid = if rec.tid() < 0 {
            // unmapped records sort after every mapped one
            i64::MAX
        } else {
            i64::from(rec.tid())
        };
        QueuedRecord {
            tid,
            pos: rec.pos(),
            rank,
            rec,
        }
    }

    fn sort_key(&self) -> (i64, i64, usize) {
        (self.tid, self.pos, self.rank)
    }
}

impl PartialEq for QueuedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueuedRecord {}

impl PartialOrd for QueuedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRecord {
    // reversed: BinaryHeap is a max-heap and we pop smallest coordinates first
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}

/// The SO field of the @HD line, or None when the header does not state one.
fn header_sort_order(header: &bam::HeaderView) -> Option<String> {
    let text = String::from_utf8_lossy(header.as_bytes()).into_owned();
    let hd = text.lines().find(|line| line.starts_with("@HD"))?;
    hd.split('\t')
        .find_map(|field| field.strip_prefix("SO:").map(String::from))
}

fn ensure_coordinate_sorted(header: &bam::HeaderView, path: &Path) -> Result<()> {
    let sort_order = header_sort_order(header).unwrap_or_else(|| "unknown".to_string());
    if sort_order != "coordinate" {
        return Err(AlignmentError::NotCoordinateSorted {
            path: path.to_path_buf(),
            sort_order,
        }
        .into());
    }
    Ok(())
}

/// Verify that `header` describes the same reference sequences as `first`.
fn ensure_same_reference(
    first_header: &bam::HeaderView,
    first_path: &Path,
    header: &bam::HeaderView,
    path: &Path,
) -> Result<()> {
    let mismatch = |detail: String| AlignmentError::HeaderMismatch {
        path: path.to_path_buf(),
        first: first_path.to_path_buf(),
        detail,
    };

    if first_header.target_count() != header.target_count() {
        return Err(mismatch(format!(
            "{} reference sequences here, {} there",
            header.target_count(),
            first_header.target_count()
        ))
        .into());
    }
    for tid in 0..header.target_count() {
        let name = String::from_utf8_lossy(header.target_names()[tid as usize]);
        let first_name = String::from_utf8_lossy(first_header.target_names()[tid as usize]);
        if name != first_name {
            return Err(mismatch(format!(
                "reference sequence {tid} is '{name}' here and '{first_name}' there"
            ))
            .into());
        }
        if header.target_len(tid) != first_header.target_len(tid) {
            return Err(mismatch(format!("reference sequence '{name}' differs in length")).into());
        }
    }
    Ok(())
}

fn next_record(
    reader: &mut bam::Reader,
    rank: usize,
    path: &Path,
) -> Result<Option<QueuedRecord>> {
    let mut rec = Record::new();
    match reader.read(&mut rec) {
        Some(result) => {
            result.with_context(|| format!("Error reading record from {}", path.display()))?;
            Ok(Some(QueuedRecord::new(rec, rank)))
        }
        None => Ok(None),
    }
}

/// Merge coordinate-sorted BAMs into one coordinate-sorted BAM.
pub fn merge_coordinate_sorted(inputs: &[PathBuf], output: &Path) -> Result<MergeStats> {
    if inputs.is_empty() {
        bail!("BAM merge called without inputs");
    }

    let mut readers = Vec::with_capacity(inputs.len());
    for path in inputs {
        let reader = bam::Reader::from_path(path)
            .with_context(|| format!("Error opening BAM {}", path.display()))?;
        ensure_coordinate_sorted(reader.header(), path)?;
        readers.push(reader);
    }
    for (path, reader) in inputs.iter().zip(&readers).skip(1) {
        ensure_same_reference(readers[0].header(), &inputs[0], reader.header(), path)?;
    }

    let mut header = bam::header::Header::from_template(readers[0].header());
    let mut pg = bam::header::HeaderRecord::new(b"PG");
    pg.push_tag(b"ID", "atacranger_merge");
    header.push_record(&pg);
    let mut writer = bam::Writer::from_path(output, &header, bam::Format::Bam)
        .with_context(|| format!("Error creating BAM {}", output.display()))?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (rank, reader) in readers.iter_mut().enumerate() {
        if let Some(queued) = next_record(reader, rank, &inputs[rank])? {
            heap.push(queued);
        }
    }

    let mut stats = MergeStats {
        inputs: inputs.len(),
        records: 0,
    };
    while let Some(queued) = heap.pop() {
        writer.write(&queued.rec)?;
        stats.records += 1;
        let rank = queued.rank;
        if let Some(next) = next_record(&mut readers[rank], rank, &inputs[rank])? {
            heap.push(next);
        }
    }

    Ok(stats)
}

/// Stand in for a merge with exactly one input: hard link when the filesystem
/// allows it, otherwise copy.
pub fn alias_or_copy(input: &Path, output: &Path) -> Result<()> {
    std::fs::hard_link(input, output)
        .or_else(|_| std::fs::copy(input, output).map(|_| ()))
        .with_context(|| {
            format!(
                "Error linking {} to {}",
                input.display(),
                output.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{proper_pair, read_coordinates, two_contig_header, write_bam};
    use atac_types::errors::AlignmentError;
    use pretty_assertions::assert_eq;
    use rust_htslib::bam::header::{Header, HeaderRecord};

    #[test]
    fn test_merge_preserves_coordinate_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let b = dir.path().join("b.bam");
        let out = dir.path().join("merged.bam");

        let header = two_contig_header();
        let a1 = proper_pair("a1", "chr1", 100, 200);
        let a2 = proper_pair("a2", "chr2", 50, 150);
        write_bam(&a, &header, &[&a1[0], &a1[1], &a2[0], &a2[1]]);
        let b1 = proper_pair("b1", "chr1", 150, 260);
        write_bam(&b, &header, &[&b1[0], &b1[1]]);

        let stats = merge_coordinate_sorted(&[a.clone(), b.clone()], &out).unwrap();
        assert_eq!(stats, MergeStats { inputs: 2, records: 6 });

        let coords = read_coordinates(&out);
        let names: Vec<&str> = coords.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a1", "b1", "a1", "b1", "a2", "a2"]);
        let positions: Vec<(i32, i64)> = coords.iter().map(|&(_, tid, pos)| (tid, pos)).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_merge_ties_resolve_by_input_rank() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let b = dir.path().join("b.bam");
        let out = dir.path().join("merged.bam");

        let header = two_contig_header();
        let first = proper_pair("from_a", "chr1", 100, 200);
        let second = proper_pair("from_b", "chr1", 100, 200);
        write_bam(&a, &header, &[&first[0], &first[1]]);
        write_bam(&b, &header, &[&second[0], &second[1]]);

        merge_coordinate_sorted(&[a.clone(), b.clone()], &out).unwrap();
        let names: Vec<String> = read_coordinates(&out).into_iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["from_a", "from_b", "from_a", "from_b"]);

        let out_swapped = dir.path().join("swapped.bam");
        merge_coordinate_sorted(&[b, a], &out_swapped).unwrap();
        let names: Vec<String> = read_coordinates(&out_swapped)
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert_eq!(names, vec!["from_b", "from_a", "from_b", "from_a"]);
    }

    #[test]
    fn test_merge_rejects_unsorted_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let out = dir.path().join("merged.bam");

        let mut header = Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", "1.6");
        hd.push_tag(b"SO", "queryname");
        header.push_record(&hd);
        crate::fixtures::push_contig(&mut header, "chr1", 10000);
        let pair = proper_pair("a1", "chr1", 100, 200);
        write_bam(&a, &header, &[&pair[0], &pair[1]]);

        let err = merge_coordinate_sorted(&[a], &out).unwrap_err();
        match err.downcast_ref::<AlignmentError>() {
            Some(AlignmentError::NotCoordinateSorted { sort_order, .. }) => {
                assert_eq!(sort_order, "queryname");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_merge_rejects_mismatched_references() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let b = dir.path().join("b.bam");
        let out = dir.path().join("merged.bam");

        let header_a = two_contig_header();
        let pair_a = proper_pair("a1", "chr1", 100, 200);
        write_bam(&a, &header_a, &[&pair_a[0], &pair_a[1]]);

        let mut header_b = Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", "1.6");
        hd.push_tag(b"SO", "coordinate");
        header_b.push_record(&hd);
        crate::fixtures::push_contig(&mut header_b, "chr1", 10000);
        let pair_b = proper_pair("b1", "chr1", 100, 200);
        write_bam(&b, &header_b, &[&pair_b[0], &pair_b[1]]);

        let err = merge_coordinate_sorted(&[a, b], &out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlignmentError>(),
            Some(AlignmentError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_alias_single_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bam");
        let out = dir.path().join("aliased.bam");

        let header = two_contig_header();
        let pair = proper_pair("a1", "chr1", 100, 200);
        write_bam(&a, &header, &[&pair[0], &pair[1]]);

        alias_or_copy(&a, &out).unwrap();
        assert_eq!(read_coordinates(&out).len(), 2);
    }
}
