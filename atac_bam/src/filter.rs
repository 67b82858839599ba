//! Streaming alignment record filters.
//!
//! One pass over a coordinate-sorted BAM applies three layers: the flag
//! policy, the includable-region restriction and the optional declarative
//! rule set. Records fail on the first layer that rejects them and every
//! rejection is counted by reason.

use crate::regions::IncludableRegions;
use anyhow::{bail, Context, Result};
use atac_types::metrics::JsonReporter;
use rust_htslib::bam::record::{Cigar, Record};
use rust_htslib::bam::{self, Read};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Flag-level filter policy.
///
/// Duplicate handling differs per aggregation level: replicate builds mark
/// duplicates but retain them (`drop_duplicates: false`), condition builds
/// strip the flagged records.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct FlagFilter {
    pub paired: bool,
    pub min_mapq: u8,
    pub drop_duplicates: bool,
    pub keep_secondary: bool,
    pub keep_supplementary: bool,
}

impl FlagFilter {
    /// Policy for replicate-level builds: duplicates flagged upstream stay.
    pub fn replicate_level(paired: bool, min_mapq: u8) -> FlagFilter {
        FlagFilter {
            paired,
            min_mapq,
            drop_duplicates: false,
            keep_secondary: false,
            keep_supplementary: false,
        }
    }

    /// Policy for condition-level builds: inputs are already filtered, only
    /// duplicate-flagged records are removed.
    pub fn condition_level() -> FlagFilter {
        FlagFilter {
            paired: false,
            min_mapq: 0,
            drop_duplicates: true,
            keep_secondary: true,
            keep_supplementary: true,
        }
    }
}

/// Declarative per-record rules, loaded from a json file.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct FilterRules {
    /// Minimum absolute template length, applied to paired records.
    pub min_insert_size: Option<i64>,
    /// Maximum absolute template length, applied to paired records.
    pub max_insert_size: Option<i64>,
    /// Maximum fraction of the read allowed to be soft clipped.
    pub max_soft_clip_fraction: Option<f64>,
}

impl FilterRules {
    pub fn from_json(path: &Path) -> Result<FilterRules> {
        let file = File::open(path)
            .with_context(|| format!("Error opening filter rules file {}", path.display()))?;
        let rules: FilterRules = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Error parsing filter rules file {}", path.display()))?;
        if let (Some(min), Some(max)) = (rules.min_insert_size, rules.max_insert_size) {
            if max < min {
                bail!(
                    "Filter rules file {} sets max_insert_size ({max}) below \
                     min_insert_size ({min})",
                    path.display()
                );
            }
        }
        Ok(rules)
    }

    pub fn is_noop(&self) -> bool {
        *self == FilterRules::default()
    }

    pub fn passes(&self, rec: &Record) -> bool {
        if rec.is_paired() {
            let tlen = rec.insert_size().abs();
            if tlen > 0 {
                if let Some(min) = self.min_insert_size {
                    if tlen < min {
                        return false;
                    }
                }
                if let Some(max) = self.max_insert_size {
                    if tlen > max {
                        return false;
                    }
                }
            }
        }

        if let Some(max_fraction) = self.max_soft_clip_fraction {
            let clipped: i64 = rec
                .cigar()
                .iter()
                .map(|c| match c {
                    Cigar::SoftClip(n) => i64::from(*n),
                    _ => 0,
                })
                .sum();
            let read_len = rec.seq_len() as i64;
            if read_len > 0 && clipped as f64 / read_len as f64 > max_fraction {
                return false;
            }
        }

        true
    }
}

/// Why a record was dropped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DropReason {
    Unmapped,
    Secondary,
    Supplementary,
    LowMapq,
    MateUnmapped,
    MateDifferentContig,
    NotProperPair,
    Duplicate,
    OffTarget,
    FailedRule,
}

/// Per-reason drop counts for one filtering pass.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct FilterMetrics {
    pub reads_in: u64,
    pub reads_out: u64,
    pub dropped_unmapped: u64,
    pub dropped_secondary: u64,
    pub dropped_supplementary: u64,
    pub dropped_low_mapq: u64,
    pub dropped_mate_unmapped: u64,
    pub dropped_mate_different_contig: u64,
    pub dropped_not_proper_pair: u64,
    pub dropped_duplicate: u64,
    pub dropped_off_target: u64,
    pub dropped_failed_rule: u64,
}

impl FilterMetrics {
    fn record_drop(&mut self, reason: DropReason) {
        let slot = match reason {
            DropReason::Unmapped => &mut self.dropped_unmapped,
            DropReason::Secondary => &mut self.dropped_secondary,
            DropReason::Supplementary => &mut self.dropped_supplementary,
            DropReason::LowMapq => &mut self.dropped_low_mapq,
            DropReason::MateUnmapped => &mut self.dropped_mate_unmapped,
            DropReason::MateDifferentContig => &mut self.dropped_mate_different_contig,
            DropReason::NotProperPair => &mut self.dropped_not_proper_pair,
            DropReason::Duplicate => &mut self.dropped_duplicate,
            DropReason::OffTarget => &mut self.dropped_off_target,
            DropReason::FailedRule => &mut self.dropped_failed_rule,
        };
        *slot += 1;
    }

    pub fn dropped_total(&self) -> u64 {
        self.reads_in - self.reads_out
    }

    pub fn to_reporter(&self) -> JsonReporter {
        let mut reporter = JsonReporter::new();
        reporter.insert("reads_in", self.reads_in);
        reporter.insert("reads_out", self.reads_out);
        reporter.insert("dropped_unmapped", self.dropped_unmapped);
        reporter.insert("dropped_secondary", self.dropped_secondary);
        reporter.insert("dropped_supplementary", self.dropped_supplementary);
        reporter.insert("dropped_low_mapq", self.dropped_low_mapq);
        reporter.insert("dropped_mate_unmapped", self.dropped_mate_unmapped);
        reporter.insert(
            "dropped_mate_different_contig",
            self.dropped_mate_different_contig,
        );
        reporter.insert("dropped_not_proper_pair", self.dropped_not_proper_pair);
        reporter.insert("dropped_duplicate", self.dropped_duplicate);
        reporter.insert("dropped_off_target", self.dropped_off_target);
        reporter.insert("dropped_failed_rule", self.dropped_failed_rule);
        reporter
    }
}

/// Decide the fate of one record. None means keep.
pub fn drop_reason(
    rec: &Record,
    flags: &FlagFilter,
    regions: Option<&IncludableRegions>,
    rules: Option<&FilterRules>,
) -> Option<DropReason> {
    if rec.is_unmapped() {
        return Some(DropReason::Unmapped);
    }
    if rec.is_secondary() && !flags.keep_secondary {
        return Some(DropReason::Secondary);
    }
    if rec.is_supplementary() && !flags.keep_supplementary {
        return Some(DropReason::Supplementary);
    }
    if rec.mapq() < flags.min_mapq {
        return Some(DropReason::LowMapq);
    }
    if flags.paired {
        if rec.is_mate_unmapped() {
            return Some(DropReason::MateUnmapped);
        }
        if rec.tid() != rec.mtid() {
            return Some(DropReason::MateDifferentContig);
        }
        if !rec.is_proper_pair() {
            return Some(DropReason::NotProperPair);
        }
    }
    if flags.drop_duplicates && rec.is_duplicate() {
        return Some(DropReason::Duplicate);
    }
    if let Some(regions) = regions {
        let end = rec.cigar().end_pos();
        if !regions.contains(rec.tid(), rec.pos(), end) {
            return Some(DropReason::OffTarget);
        }
    }
    if let Some(rules) = rules {
        if !rules.passes(rec) {
            return Some(DropReason::FailedRule);
        }
    }
    None
}

/// Stream `input` through the filters into `output`, returning the counts.
pub fn filter_bam(
    input: &Path,
    output: &Path,
    flags: &FlagFilter,
    regions: Option<&IncludableRegions>,
    rules: Option<&FilterRules>,
) -> Result<FilterMetrics> {
    let mut reader = bam::Reader::from_path(input)
        .with_context(|| format!("Error opening BAM {}", input.display()))?;

    let mut header = bam::header::Header::from_template(reader.header());
    let mut pg = bam::header::HeaderRecord::new(b"PG");
    pg.push_tag(b"ID", "atacranger_filter");
    header.push_record(&pg);
    let mut writer = bam::Writer::from_path(output, &header, bam::Format::Bam)
        .with_context(|| format!("Error creating BAM {}", output.display()))?;

    let mut metrics = FilterMetrics::default();
    let mut rec = Record::new();
    while let Some(result) = reader.read(&mut rec) {
        result.with_context(|| format!("Error reading record from {}", input.display()))?;
        metrics.reads_in += 1;
        match drop_reason(&rec, flags, regions, rules) {
            Some(reason) => metrics.record_drop(reason),
            None => {
                writer.write(&rec)?;
                metrics.reads_out += 1;
            }
        }
    }

    Ok(metrics)
}
