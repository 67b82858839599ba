//! Build one condition's artifact from its replicate artifacts.
//!
//! Replicate artifacts arrive already duplicate-flagged and filtered, so
//! this stage only merges them and strips the records the duplicate marker
//! flagged. This is the one place flagged duplicates actually leave the
//! data.

use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::tools;
use anyhow::Result;
use atac_bam::filter::{filter_bam, FilterMetrics, FlagFilter};
use atac_bam::merge::{alias_or_copy, merge_coordinate_sorted};
use atac_types::metrics::FlagstatSummary;
use atac_types::{AlignmentArtifact, ConditionKey};
use std::path::PathBuf;

pub struct MergeConditionInputs<'a> {
    pub key: &'a ConditionKey,
    /// Replicate artifacts of this condition, sorted by artifact id.
    pub replicates: Vec<&'a AlignmentArtifact>,
    pub threads: usize,
}

pub struct MergeConditionOutputs {
    pub artifact: AlignmentArtifact,
    pub filter_metrics: FilterMetrics,
    pub flagstat: FlagstatSummary,
}

pub fn run(
    args: &MergeConditionInputs<'_>,
    layout: &OutputLayout,
) -> Result<MergeConditionOutputs> {
    let id = args.key.to_string();
    let level = AggregationLevel::Condition;
    log::info!(
        "Building condition artifact {id} from {} replicates",
        args.replicates.len()
    );

    let merged = layout.merged_bam(level, &id);
    let bams: Vec<PathBuf> = args.replicates.iter().map(|a| a.bam.clone()).collect();
    if let [only] = bams.as_slice() {
        alias_or_copy(only, &merged)?;
    } else {
        merge_coordinate_sorted(&bams, &merged)?;
    }

    let final_bam = layout.final_bam(level, &id);
    let filter_metrics = filter_bam(
        &merged,
        &final_bam,
        &FlagFilter::condition_level(),
        None,
        None,
    )?;

    tools::run(&tools::samtools_index(&final_bam, args.threads))?;
    let flagstat =
        FlagstatSummary::parse(&tools::run_capture(&tools::samtools_flagstat(&final_bam))?)?;

    let mut summary = filter_metrics.to_reporter();
    summary.add_prefix("filter");
    let mut flagstat_report = flagstat.to_reporter();
    flagstat_report.add_prefix("flagstat");
    summary.merge(flagstat_report);
    summary.insert("replicates_merged", args.replicates.len());
    summary.insert("scale_factor", flagstat.scale_factor());
    summary.report(&layout.summary_json(level, &id))?;

    let mut artifact = AlignmentArtifact::new(&id, &final_bam);
    artifact.index = Some(tools::bai_path(&final_bam));
    artifact.provenance.sources = args.replicates.iter().map(|a| a.id.clone()).collect();
    artifact.provenance.filters = vec!["remove_duplicates".to_string()];
    artifact.write_provenance()?;

    Ok(MergeConditionOutputs {
        artifact,
        filter_metrics,
        flagstat,
    })
}
