//! Consensus peak construction.
//!
//! All peak sets of one aggregation level are pooled, sorted, and swept into
//! clusters of intervals that overlap or are book-ended. Each cluster
//! becomes one consensus interval spanning its members, carrying the names
//! of the contributing peaks and the per-source presence pattern. Intervals
//! supported by fewer than `min_support` distinct sources are dropped, and
//! identifiers are assigned only to the survivors.
//!
//! Coordinates stay 0-based half-open except in the SAF export, which is
//! 1-based inclusive as the read counter expects.

use anyhow::{bail, Result};
use atac_types::metrics::JsonReporter;
use atac_types::peaks::PeakSet;
use bio_types::strand::Strand;
use itertools::Itertools;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::discriminant;
use std::path::Path;

/// Options for consensus construction.
#[derive(Clone, Copy, Debug)]
pub struct ConsensusOptions {
    /// Minimum number of distinct sources an interval needs to survive.
    pub min_support: usize,
}

impl Default for ConsensusOptions {
    fn default() -> ConsensusOptions {
        ConsensusOptions { min_support: 1 }
    }
}

/// One consensus interval.
#[derive(Clone, Debug)]
pub struct ConsensusInterval {
    /// `Interval_<n>`, numbered over surviving intervals only.
    pub id: String,
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    /// Number of distinct sources with at least one contributing peak.
    pub support: usize,
    /// Total contributing peaks, double-counting sources.
    pub peak_count: usize,
    /// Uniform strand of the contributing peaks, or unknown when they mix.
    pub strand: Strand,
    /// Names of the contributing peaks, in sweep order.
    pub names: Vec<String>,
    /// Presence flag per source, aligned with [`ConsensusBuild::sources`].
    pub present: Vec<bool>,
}

/// The consensus over one level's peak sets.
#[derive(Clone, Debug)]
pub struct ConsensusBuild {
    /// Source ids of the contributing peak sets, in input order.
    pub sources: Vec<String>,
    /// Surviving intervals in coordinate order.
    pub intervals: Vec<ConsensusInterval>,
    /// Clusters formed before the support filter.
    pub clusters_total: usize,
    /// Clusters dropped for insufficient support.
    pub dropped_low_support: usize,
}

struct TaggedPeak<'a> {
    set_idx: usize,
    peak: &'a atac_types::peaks::Peak,
}

/// Build the consensus over `sets`. Set order determines tie-breaking and
/// matrix column order, so callers pass sets sorted by source id.
pub fn build_consensus(sets: &[PeakSet], opts: &ConsensusOptions) -> Result<ConsensusBuild> {
    if sets.is_empty() {
        bail!("Consensus construction needs at least one peak set");
    }
    let sources: Vec<String> = sets.iter().map(|s| s.source.clone()).collect();
    if let Some(dup) = sources.iter().duplicates().next() {
        bail!("Duplicate peak set source '{dup}' in consensus construction");
    }
    let min_support = opts.min_support.max(1);
    if min_support > sets.len() {
        log::warn!(
            "Minimum support {min_support} exceeds the {} available peak sets; \
             every consensus interval will be dropped",
            sets.len()
        );
    }

    let mut tagged: Vec<TaggedPeak<'_>> = sets
        .iter()
        .enumerate()
        .flat_map(|(set_idx, set)| set.peaks.iter().map(move |peak| TaggedPeak { set_idx, peak }))
        .collect();
    // Stable sort: equal coordinates keep source order, which keeps every
    // downstream export deterministic.
    tagged.sort_by(|a, b| {
        (&a.peak.chrom, a.peak.start, a.peak.end).cmp(&(&b.peak.chrom, b.peak.start, b.peak.end))
    });

    let mut clusters: Vec<Vec<TaggedPeak<'_>>> = Vec::new();
    let mut current: Vec<TaggedPeak<'_>> = Vec::new();
    let mut current_end = 0;
    for t in tagged {
        // Book-ended intervals (next.start == current end) merge too.
        let extends = current
            .first()
            .is_some_and(|f| f.peak.chrom == t.peak.chrom && t.peak.start <= current_end);
        if extends {
            current_end = current_end.max(t.peak.end);
        } else {
            if !current.is_empty() {
                clusters.push(std::mem::take(&mut current));
            }
            current_end = t.peak.end;
        }
        current.push(t);
    }
    if !current.is_empty() {
        clusters.push(current);
    }

    let clusters_total = clusters.len();
    let mut intervals = Vec::new();
    for cluster in &clusters {
        let support = cluster.iter().map(|m| m.set_idx).unique().count();
        if support < min_support {
            continue;
        }
        let mut present = vec![false; sets.len()];
        for m in cluster {
            present[m.set_idx] = true;
        }
        intervals.push(ConsensusInterval {
            id: format!("Interval_{}", intervals.len() + 1),
            chrom: cluster[0].peak.chrom.clone(),
            start: cluster[0].peak.start,
            end: cluster.iter().map(|m| m.peak.end).max().unwrap_or(0),
            support,
            peak_count: cluster.len(),
            strand: collapse_strand(cluster),
            names: cluster.iter().map(|m| m.peak.name.clone()).collect(),
            present,
        });
    }

    Ok(ConsensusBuild {
        sources,
        dropped_low_support: clusters_total - intervals.len(),
        clusters_total,
        intervals,
    })
}

fn collapse_strand(cluster: &[TaggedPeak<'_>]) -> Strand {
    let first = cluster[0].peak.strand;
    if cluster
        .iter()
        .all(|m| discriminant(&m.peak.strand) == discriminant(&first))
    {
        first
    } else {
        Strand::Unknown
    }
}

fn strand_symbol(strand: Strand) -> &'static str {
    match strand {
        Strand::Forward => "+",
        Strand::Reverse => "-",
        Strand::Unknown => ".",
    }
}

impl ConsensusBuild {
    /// Consensus intervals as BED6, with the support count in the score
    /// column.
    pub fn write_bed(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for iv in &self.intervals {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}",
                iv.chrom,
                iv.start,
                iv.end,
                iv.id,
                iv.support,
                strand_symbol(iv.strand)
            )?;
        }
        Ok(())
    }

    /// Consensus intervals as SAF (1-based, inclusive end) for the read
    /// counter.
    pub fn write_saf(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        writer.write_record(["GeneID", "Chr", "Start", "End", "Strand"])?;
        for iv in &self.intervals {
            writer.write_record([
                iv.id.clone(),
                iv.chrom.clone(),
                (iv.start + 1).to_string(),
                iv.end.to_string(),
                strand_symbol(iv.strand).to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Boolean presence matrix: one row per interval, one `<source>.bool`
    /// column per contributing set, plus the collapsed peak names.
    pub fn write_boolean_matrix(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        let mut header = vec![
            "chrom".to_string(),
            "start".to_string(),
            "end".to_string(),
            "interval_id".to_string(),
            "num_peaks".to_string(),
            "num_samples".to_string(),
        ];
        header.extend(self.sources.iter().map(|s| format!("{s}.bool")));
        header.push("peak_names".to_string());
        writer.write_record(&header)?;

        for iv in &self.intervals {
            let mut record = vec![
                iv.chrom.clone(),
                iv.start.to_string(),
                iv.end.to_string(),
                iv.id.clone(),
                iv.peak_count.to_string(),
                iv.support.to_string(),
            ];
            record.extend(iv.present.iter().map(|&p| p.to_string()));
            record.push(iv.names.iter().join(","));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Construction metrics.
    pub fn to_reporter(&self) -> JsonReporter {
        let mut reporter = JsonReporter::new();
        reporter.insert("consensus_source_count", self.sources.len());
        reporter.insert("consensus_clusters_total", self.clusters_total);
        reporter.insert("consensus_interval_count", self.intervals.len());
        reporter.insert("consensus_dropped_low_support", self.dropped_low_support);
        reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atac_types::peaks::Peak;
    use pretty_assertions::assert_eq;

    fn peak(chrom: &str, start: i64, end: i64, name: &str, strand: Strand) -> Peak {
        Peak {
            chrom: chrom.to_string(),
            start,
            end,
            name: name.to_string(),
            score: 0.0,
            strand,
            summit_offset: None,
        }
    }

    fn set(source: &str, peaks: Vec<Peak>) -> PeakSet {
        PeakSet {
            source: source.to_string(),
            peaks,
        }
    }

    #[test]
    fn test_overlapping_peaks_from_two_sets_merge_and_low_support_drops() {
        let sets = vec![
            set("WT_R01", vec![peak("chr1", 100, 200, "a1", Strand::Unknown)]),
            set("WT_R02", vec![peak("chr1", 150, 250, "b1", Strand::Unknown)]),
            set("WT_R03", vec![peak("chr1", 900, 950, "c1", Strand::Unknown)]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions { min_support: 2 }).unwrap();

        assert_eq!(build.clusters_total, 2);
        assert_eq!(build.dropped_low_support, 1);
        assert_eq!(build.intervals.len(), 1);

        let iv = &build.intervals[0];
        assert_eq!(iv.id, "Interval_1");
        assert_eq!((iv.chrom.as_str(), iv.start, iv.end), ("chr1", 100, 250));
        assert_eq!(iv.support, 2);
        assert_eq!(iv.peak_count, 2);
        assert_eq!(iv.names, vec!["a1", "b1"]);
        assert_eq!(iv.present, vec![true, true, false]);
    }

    #[test]
    fn test_book_ended_intervals_merge_but_gapped_do_not() {
        let sets = vec![
            set("A", vec![peak("chr1", 100, 200, "a1", Strand::Unknown)]),
            set(
                "B",
                vec![
                    peak("chr1", 200, 300, "b1", Strand::Unknown),
                    peak("chr1", 301, 400, "b2", Strand::Unknown),
                ],
            ),
        ];
        let build = build_consensus(&sets, &ConsensusOptions::default()).unwrap();
        assert_eq!(build.intervals.len(), 2);
        assert_eq!(
            (build.intervals[0].start, build.intervals[0].end),
            (100, 300)
        );
        assert_eq!(
            (build.intervals[1].start, build.intervals[1].end),
            (301, 400)
        );
    }

    #[test]
    fn test_support_counts_distinct_sources_not_peaks() {
        let sets = vec![
            set(
                "A",
                vec![
                    peak("chr1", 100, 200, "a1", Strand::Unknown),
                    peak("chr1", 150, 260, "a2", Strand::Unknown),
                ],
            ),
            set("B", vec![]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions { min_support: 2 }).unwrap();
        // Two peaks, one source: support stays 1 and the interval drops.
        assert_eq!(build.clusters_total, 1);
        assert_eq!(build.intervals.len(), 0);
        assert_eq!(build.dropped_low_support, 1);
    }

    #[test]
    fn test_interval_ids_number_survivors_only() {
        let sets = vec![
            set(
                "A",
                vec![
                    peak("chr1", 100, 200, "a1", Strand::Unknown),
                    peak("chr1", 500, 600, "a2", Strand::Unknown),
                ],
            ),
            set("B", vec![peak("chr1", 550, 650, "b1", Strand::Unknown)]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions { min_support: 2 }).unwrap();
        assert_eq!(build.intervals.len(), 1);
        // The surviving cluster is the second by coordinate but gets id 1.
        assert_eq!(build.intervals[0].id, "Interval_1");
        assert_eq!(build.intervals[0].start, 500);
    }

    #[test]
    fn test_strand_collapse() {
        let sets = vec![
            set("A", vec![peak("chr1", 100, 200, "a1", Strand::Forward)]),
            set("B", vec![peak("chr1", 150, 250, "b1", Strand::Forward)]),
            set("C", vec![peak("chr2", 100, 200, "c1", Strand::Reverse)]),
            set("D", vec![peak("chr2", 150, 250, "d1", Strand::Forward)]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions::default()).unwrap();
        assert!(matches!(build.intervals[0].strand, Strand::Forward));
        assert!(matches!(build.intervals[1].strand, Strand::Unknown));
    }

    #[test]
    fn test_single_source_disjoint_peaks_pass_through_sorted() {
        let sets = vec![set(
            "only",
            vec![
                peak("chr2", 50, 120, "p3", Strand::Unknown),
                peak("chr1", 400, 500, "p2", Strand::Unknown),
                peak("chr1", 100, 200, "p1", Strand::Unknown),
            ],
        )];
        let build = build_consensus(&sets, &ConsensusOptions::default()).unwrap();

        // Nothing overlaps, so every input peak comes back as its own
        // interval, in coordinate order.
        let coords: Vec<(&str, i64, i64)> = build
            .intervals
            .iter()
            .map(|iv| (iv.chrom.as_str(), iv.start, iv.end))
            .collect();
        assert_eq!(
            coords,
            vec![("chr1", 100, 200), ("chr1", 400, 500), ("chr2", 50, 120)]
        );
        for pair in build.intervals.windows(2) {
            assert!(pair[0].chrom < pair[1].chrom || pair[0].end < pair[1].start);
        }
        assert!(build.intervals.iter().all(|iv| iv.present == vec![true]));
    }

    #[test]
    fn test_identical_coordinates_keep_source_order() {
        let sets = vec![
            set("Z_late", vec![peak("chr1", 100, 200, "z1", Strand::Unknown)]),
            set("A_early", vec![peak("chr1", 100, 200, "a1", Strand::Unknown)]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions::default()).unwrap();
        // Stable sort: ties keep the order the sets were passed in.
        assert_eq!(build.intervals[0].names, vec!["z1", "a1"]);
    }

    #[test]
    fn test_empty_input_and_duplicate_sources_are_rejected() {
        assert!(build_consensus(&[], &ConsensusOptions::default()).is_err());
        let sets = vec![set("A", vec![]), set("A", vec![])];
        let err = build_consensus(&sets, &ConsensusOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Duplicate peak set source 'A'"));
    }

    #[test]
    fn test_exports() {
        let dir = tempfile::tempdir().unwrap();
        let sets = vec![
            set("WT", vec![peak("chr1", 100, 200, "w1", Strand::Unknown)]),
            set("KO", vec![peak("chr1", 150, 250, "k1", Strand::Unknown)]),
        ];
        let build = build_consensus(&sets, &ConsensusOptions::default()).unwrap();

        let bed = dir.path().join("consensus.bed");
        build.write_bed(&bed).unwrap();
        assert_eq!(
            std::fs::read_to_string(&bed).unwrap(),
            "chr1\t100\t250\tInterval_1\t2\t.\n"
        );

        let saf = dir.path().join("consensus.saf");
        build.write_saf(&saf).unwrap();
        assert_eq!(
            std::fs::read_to_string(&saf).unwrap(),
            "GeneID\tChr\tStart\tEnd\tStrand\nInterval_1\tchr1\t101\t250\t.\n"
        );

        let matrix = dir.path().join("consensus.boolean.txt");
        build.write_boolean_matrix(&matrix).unwrap();
        assert_eq!(
            std::fs::read_to_string(&matrix).unwrap(),
            "chrom\tstart\tend\tinterval_id\tnum_peaks\tnum_samples\tWT.bool\tKO.bool\tpeak_names\n\
             chr1\t100\t250\tInterval_1\t2\t2\ttrue\ttrue\tw1,k1\n"
        );
    }
}
