//! Build one replicate's artifact from its library alignments.
//!
//! Libraries are merged (a lone library is aliased, not rewritten), then the
//! merge is duplicate-flagged, flag- and region-filtered, and orphan pairs
//! are dropped for paired-end data. Duplicates are marked here but kept;
//! only the condition-level aggregation strips them. A replicate with a
//! single library receives exactly the same treatments as one with many.

use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::tools;
use anyhow::Result;
use atac_bam::filter::{filter_bam, FilterMetrics, FilterRules, FlagFilter};
use atac_bam::merge::{alias_or_copy, merge_coordinate_sorted};
use atac_bam::orphans::{remove_orphans, OrphanStats};
use atac_bam::regions::IncludableRegions;
use atac_types::metrics::FlagstatSummary;
use atac_types::{AlignmentArtifact, ReplicateKey};
use std::path::{Path, PathBuf};

pub struct MergeReplicateInputs<'a> {
    pub key: &'a ReplicateKey,
    /// Library artifacts of this replicate, sorted by artifact id.
    pub libraries: Vec<&'a AlignmentArtifact>,
    pub paired_end: bool,
    pub min_mapq: u8,
    pub blacklist: Option<&'a Path>,
    pub exclude_contigs: &'a [String],
    pub rules: Option<&'a FilterRules>,
    pub threads: usize,
}

pub struct MergeReplicateOutputs {
    pub artifact: AlignmentArtifact,
    pub filter_metrics: FilterMetrics,
    pub orphans: Option<OrphanStats>,
    pub flagstat: FlagstatSummary,
}

/// The treatments recorded in the artifact's provenance, in the order they
/// are applied. Input count never changes this list.
pub fn applied_filters(paired_end: bool, regions_active: bool, rules_active: bool) -> Vec<String> {
    let mut filters = vec!["mark_duplicates".to_string(), "flag_filter".to_string()];
    if regions_active {
        filters.push("region_filter".to_string());
    }
    if rules_active {
        filters.push("custom_rules".to_string());
    }
    if paired_end {
        filters.push("orphan_removal".to_string());
    }
    filters
}

pub fn run(
    args: &MergeReplicateInputs<'_>,
    layout: &OutputLayout,
) -> Result<MergeReplicateOutputs> {
    let id = args.key.to_string();
    let level = AggregationLevel::Replicate;
    log::info!(
        "Building replicate artifact {id} from {} libraries",
        args.libraries.len()
    );

    let merged = layout.merged_bam(level, &id);
    let bams: Vec<PathBuf> = args.libraries.iter().map(|a| a.bam.clone()).collect();
    if let [only] = bams.as_slice() {
        alias_or_copy(only, &merged)?;
    } else {
        merge_coordinate_sorted(&bams, &merged)?;
    }

    let markdup = layout.markdup_bam(&id);
    tools::run(&tools::picard_mark_duplicates(
        &merged,
        &markdup,
        &layout.markdup_metrics(&id),
    ))?;

    let regions_active = args.blacklist.is_some() || !args.exclude_contigs.is_empty();
    let regions = if regions_active {
        Some(IncludableRegions::from_bam(
            &markdup,
            args.blacklist,
            args.exclude_contigs,
        )?)
    } else {
        None
    };
    let rules_active = args.rules.is_some_and(|r| !r.is_noop());

    let final_bam = layout.final_bam(level, &id);
    let flag_filter = FlagFilter::replicate_level(args.paired_end, args.min_mapq);
    let (filter_metrics, orphans) = if args.paired_end {
        let filtered = layout.filtered_bam(level, &id);
        let metrics = filter_bam(&markdup, &filtered, &flag_filter, regions.as_ref(), args.rules)?;
        let orphans = remove_orphans(&filtered, &final_bam)?;
        (metrics, Some(orphans))
    } else {
        let metrics = filter_bam(
            &markdup,
            &final_bam,
            &flag_filter,
            regions.as_ref(),
            args.rules,
        )?;
        (metrics, None)
    };

    tools::run(&tools::samtools_index(&final_bam, args.threads))?;
    let flagstat =
        FlagstatSummary::parse(&tools::run_capture(&tools::samtools_flagstat(&final_bam))?)?;

    let mut summary = filter_metrics.to_reporter();
    summary.add_prefix("filter");
    let mut flagstat_report = flagstat.to_reporter();
    flagstat_report.add_prefix("flagstat");
    summary.merge(flagstat_report);
    if let Some(orphans) = &orphans {
        summary.insert("orphans_dropped", orphans.orphans_dropped);
    }
    summary.insert("libraries_merged", args.libraries.len());
    summary.insert("scale_factor", flagstat.scale_factor());
    summary.report(&layout.summary_json(level, &id))?;

    let mut artifact = AlignmentArtifact::new(&id, &final_bam);
    artifact.index = Some(tools::bai_path(&final_bam));
    artifact.provenance.sources = args.libraries.iter().map(|a| a.id.clone()).collect();
    artifact.provenance.filters = applied_filters(args.paired_end, regions_active, rules_active);
    artifact.write_provenance()?;

    Ok(MergeReplicateOutputs {
        artifact,
        filter_metrics,
        orphans,
        flagstat,
    })
}
