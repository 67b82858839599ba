//! Mate-orphan removal.
//!
//! Record-level filters can drop one mate of a pair while keeping the other.
//! Downstream paired-end tooling chokes on such widows, so after filtering a
//! paired-end BAM we keep only qnames that still have both mates. Two passes:
//! count qname occurrences, then rewrite keeping complete pairs in input
//! order.

use anyhow::{Context, Result};
use rust_htslib::bam::record::Record;
use rust_htslib::bam::{self, Read};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct OrphanStats {
    pub records_in: u64,
    pub records_out: u64,
    pub orphans_dropped: u64,
}

/// Rewrite `input` into `output` keeping only qnames seen exactly twice.
pub fn remove_orphans(input: &Path, output: &Path) -> Result<OrphanStats> {
    let mut mate_counts: HashMap<Vec<u8>, u32> = HashMap::new();
    {
        let mut reader = bam::Reader::from_path(input)
            .with_context(|| format!("Error opening BAM {}", input.display()))?;
        let mut rec = Record::new();
        while let Some(result) = reader.read(&mut rec) {
            result.with_context(|| format!("Error reading record from {}", input.display()))?;
            *mate_counts.entry(rec.qname().to_vec()).or_insert(0) += 1;
        }
    }

    let mut reader = bam::Reader::from_path(input)
        .with_context(|| format!("Error opening BAM {}", input.display()))?;
    let header = bam::header::Header::from_template(reader.header());
    let mut writer = bam::Writer::from_path(output, &header, bam::Format::Bam)
        .with_context(|| format!("Error creating BAM {}", output.display()))?;

    let mut stats = OrphanStats::default();
    let mut rec = Record::new();
    while let Some(result) = reader.read(&mut rec) {
        result.with_context(|| format!("Error reading record from {}", input.display()))?;
        stats.records_in += 1;
        if mate_counts[rec.qname()] == 2 {
            writer.write(&rec)?;
            stats.records_out += 1;
        } else {
            stats.orphans_dropped += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{proper_pair, read_qnames, two_contig_header, write_bam};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_orphans_removed_pairs_kept() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bam");
        let output = dir.path().join("out.bam");

        let header = two_contig_header();
        let complete = proper_pair("complete", "chr1", 100, 200);
        let widowed = proper_pair("widowed", "chr1", 150, 250);
        // only the first mate of "widowed" survives upstream filtering
        write_bam(
            &input,
            &header,
            &[&complete[0], &widowed[0], &complete[1]],
        );

        let stats = remove_orphans(&input, &output).unwrap();
        assert_eq!(
            stats,
            OrphanStats {
                records_in: 3,
                records_out: 2,
                orphans_dropped: 1,
            }
        );
        assert_eq!(read_qnames(&output), vec!["complete", "complete"]);
    }

    #[test]
    fn test_no_orphans_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bam");
        let output = dir.path().join("out.bam");

        let header = two_contig_header();
        let a = proper_pair("a", "chr1", 100, 200);
        let b = proper_pair("b", "chr2", 100, 200);
        write_bam(&input, &header, &[&a[0], &a[1], &b[0], &b[1]]);

        let stats = remove_orphans(&input, &output).unwrap();
        assert_eq!(stats.orphans_dropped, 0);
        assert_eq!(read_qnames(&output), vec!["a", "a", "b", "b"]);
    }
}
