//! Run conduction.
//!
//! The conductor walks the planned stage graph in order, fanning each
//! per-key stage over its keys on a bounded worker pool. A failed branch is
//! recorded and abandoned; unrelated branches keep running. A fan-in stage
//! refuses to run unless every expected input exists, reporting the missing
//! keys instead of aggregating a partial set.
//!
//! Determinism: keys fan out in sorted order, aggregation inputs are sorted
//! by artifact id, and peak sets reach the consensus sorted by source id.

use crate::layout::OutputLayout;
use crate::plan::{AggregationLevel, PlanOptions, StageGraph, StageId};
use crate::stages::align_library::{self, AlignLibraryInputs, AlignLibraryOutputs};
use crate::stages::call_peaks::{self, CallPeaksInputs, CallPeaksOutputs};
use crate::stages::consensus_peaks::{
    self, AnnotationConfig, ConsensusPeaksInputs, ConsensusPeaksOutputs,
};
use crate::stages::differential::{self, DifferentialInputs};
use crate::stages::merge_condition::{self, MergeConditionInputs, MergeConditionOutputs};
use crate::stages::merge_replicate::{self, MergeReplicateInputs, MergeReplicateOutputs};
use crate::tools;
use anyhow::{Context, Result};
use atac_bam::filter::FilterRules;
use atac_types::errors::AggregationError;
use atac_types::peaks::PeakSet;
use atac_types::{AlignmentArtifact, ConditionKey, DesignTable, LibraryKey, ReplicateKey};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Everything a run needs beyond the resolved design.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Reference FASTA, doubling as the aligner index prefix.
    pub reference: PathBuf,
    /// Region blacklist BED, subtracted from the includable genome.
    pub blacklist: Option<PathBuf>,
    /// Contigs excluded entirely, typically the mitochondrial one.
    pub exclude_contigs: Vec<String>,
    /// Optional read-level filter rules.
    pub rules: Option<FilterRules>,
    /// Mapping quality floor for replicate-level filtering.
    pub min_mapq: u8,
    /// Effective genome size for the peak caller. None disables peak
    /// calling and everything downstream of it.
    pub genome_size: Option<String>,
    /// Minimum distinct sources for a consensus interval.
    pub min_support: usize,
    /// Suppress the condition-level aggregation branch.
    pub skip_merge_replicates: bool,
    /// Peak annotation inputs, when annotation is wanted.
    pub annotation: Option<AnnotationConfig>,
    /// Driver script for the differential engine.
    pub deseq2_script: PathBuf,
    /// Concurrent branches.
    pub jobs: usize,
    /// Threads handed to each external tool.
    pub threads: usize,
    /// Whole-job memory hint in GB, for the sorter.
    pub mem_gb: Option<usize>,
}

impl RunConfig {
    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            peak_calling: self.genome_size.is_some(),
            skip_merge_replicates: self.skip_merge_replicates,
        }
    }
}

/// One branch that stopped.
#[derive(Debug)]
pub struct BranchFailure {
    pub stage: StageId,
    /// Rendered key of the branch, or the level name for fan-in stages.
    pub key: String,
    pub error: anyhow::Error,
}

/// What a run did: per-stage successful branch counts plus every failure.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<(StageId, usize)>,
    pub failures: Vec<BranchFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

fn split_results<K, V>(
    stage: StageId,
    results: Vec<(K, Result<V>)>,
    summary: &mut RunSummary,
) -> BTreeMap<K, V>
where
    K: Ord + fmt::Display,
{
    let mut ok = BTreeMap::new();
    for (key, result) in results {
        match result {
            Ok(v) => {
                ok.insert(key, v);
            }
            Err(error) => {
                log::error!("Stage {stage} branch '{key}' failed: {error:#}");
                summary.failures.push(BranchFailure {
                    stage,
                    key: key.to_string(),
                    error,
                });
            }
        }
    }
    summary.completed.push((stage, ok.len()));
    ok
}

fn record_fan_in<V>(
    stage: StageId,
    level: AggregationLevel,
    result: Result<V>,
    summary: &mut RunSummary,
) -> Option<V> {
    match result {
        Ok(v) => {
            summary.completed.push((stage, 1));
            Some(v)
        }
        Err(error) => {
            log::error!("Stage {stage} failed: {error:#}");
            summary.failures.push(BranchFailure {
                stage,
                key: level.to_string(),
                error,
            });
            summary.completed.push((stage, 0));
            None
        }
    }
}

/// Collect the artifacts for `wanted` keys, sorted by artifact id, or fail
/// with the missing keys when any upstream branch did not deliver.
fn gather_artifacts<'a, K, V, F>(
    stage: StageId,
    key: &dyn fmt::Display,
    wanted: &[K],
    available: &'a BTreeMap<K, V>,
    artifact_of: F,
) -> Result<Vec<&'a AlignmentArtifact>>
where
    K: Ord + fmt::Display,
    F: Fn(&'a V) -> &'a AlignmentArtifact,
{
    let missing: Vec<String> = wanted
        .iter()
        .filter(|k| !available.contains_key(k))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(AggregationError::IncompleteFanIn {
            stage: stage.to_string(),
            key: key.to_string(),
            missing,
        }
        .into());
    }
    let mut artifacts: Vec<&AlignmentArtifact> = wanted
        .iter()
        .filter_map(|k| available.get(k))
        .map(artifact_of)
        .collect();
    artifacts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(artifacts)
}

/// Collect every expected peak set for a consensus, in key order, or fail
/// with the missing keys.
fn gather_peak_sets<K>(
    stage: StageId,
    level: AggregationLevel,
    expected: &[K],
    peaks: &BTreeMap<K, CallPeaksOutputs>,
) -> Result<Vec<PeakSet>>
where
    K: Ord + fmt::Display,
{
    let missing: Vec<String> = expected
        .iter()
        .filter(|k| !peaks.contains_key(k))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(AggregationError::IncompleteFanIn {
            stage: stage.to_string(),
            key: level.to_string(),
            missing,
        }
        .into());
    }
    Ok(expected
        .iter()
        .filter_map(|k| peaks.get(k))
        .map(|o| o.peaks.clone())
        .collect())
}

fn missing_upstream(stage: StageId, level: AggregationLevel, upstream: StageId) -> anyhow::Error {
    AggregationError::IncompleteFanIn {
        stage: stage.to_string(),
        key: level.to_string(),
        missing: vec![upstream.to_string()],
    }
    .into()
}

/// Plan and run the whole pipeline for `design`.
pub fn execute(
    design: &DesignTable,
    config: &RunConfig,
    layout: &OutputLayout,
) -> Result<RunSummary> {
    let graph = StageGraph::plan(design.shape(), &config.plan_options());
    execute_planned(design, &graph, config, layout)
}

/// Run an already planned graph.
pub fn execute_planned(
    design: &DesignTable,
    graph: &StageGraph,
    config: &RunConfig,
    layout: &OutputLayout,
) -> Result<RunSummary> {
    layout.create_dirs(graph)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs.max(1))
        .build()
        .context("Error building the branch worker pool")?;

    let mut summary = RunSummary::default();
    let paired_end = design.is_paired_end();
    let sort_mem_mb = tools::sort_mem_mb(config.mem_gb, config.threads);

    // Library level: one branch per design row.
    log::info!("Stage align_library: {} libraries", design.rows().len());
    let align_results: Vec<(LibraryKey, Result<AlignLibraryOutputs>)> = pool.install(|| {
        design
            .rows()
            .par_iter()
            .map(|row| {
                let result = align_library::run(
                    &AlignLibraryInputs {
                        row,
                        reference: &config.reference,
                        threads: config.threads,
                        sort_mem_mb,
                    },
                    layout,
                );
                (row.key.clone(), result)
            })
            .collect()
    });
    let libraries = split_results(StageId::AlignLibrary, align_results, &mut summary);

    // Replicate level.
    let replicate_groups = design.replicate_groups();
    log::info!(
        "Stage merge_replicate: {} replicates",
        replicate_groups.len()
    );
    let replicate_results: Vec<(ReplicateKey, Result<MergeReplicateOutputs>)> =
        pool.install(|| {
            replicate_groups
                .par_iter()
                .map(|(key, rows)| {
                    let wanted: Vec<LibraryKey> = rows.iter().map(|r| r.key.clone()).collect();
                    let result = gather_artifacts(
                        StageId::MergeReplicate,
                        key,
                        &wanted,
                        &libraries,
                        |o| &o.artifact,
                    )
                    .and_then(|artifacts| {
                        merge_replicate::run(
                            &MergeReplicateInputs {
                                key,
                                libraries: artifacts,
                                paired_end,
                                min_mapq: config.min_mapq,
                                blacklist: config.blacklist.as_deref(),
                                exclude_contigs: &config.exclude_contigs,
                                rules: config.rules.as_ref(),
                                threads: config.threads,
                            },
                            layout,
                        )
                    });
                    (key.clone(), result)
                })
                .collect()
        });
    let replicates = split_results(StageId::MergeReplicate, replicate_results, &mut summary);

    // Condition level, when planned.
    let condition_groups = design.condition_groups();
    let mut conditions: BTreeMap<ConditionKey, MergeConditionOutputs> = BTreeMap::new();
    if graph.is_active(StageId::MergeCondition) {
        log::info!(
            "Stage merge_condition: {} conditions",
            condition_groups.len()
        );
        let condition_results: Vec<(ConditionKey, Result<MergeConditionOutputs>)> =
            pool.install(|| {
                condition_groups
                    .par_iter()
                    .map(|(key, replicate_keys)| {
                        let result = gather_artifacts(
                            StageId::MergeCondition,
                            key,
                            replicate_keys,
                            &replicates,
                            |o| &o.artifact,
                        )
                        .and_then(|artifacts| {
                            merge_condition::run(
                                &MergeConditionInputs {
                                    key,
                                    replicates: artifacts,
                                    threads: config.threads,
                                },
                                layout,
                            )
                        });
                        (key.clone(), result)
                    })
                    .collect()
            });
        conditions = split_results(StageId::MergeCondition, condition_results, &mut summary);
    }

    // Peak calling fans over whichever artifacts their merge delivered; a
    // missing key means that branch already failed and was reported.
    let mut replicate_peaks: BTreeMap<ReplicateKey, CallPeaksOutputs> = BTreeMap::new();
    let mut condition_peaks: BTreeMap<ConditionKey, CallPeaksOutputs> = BTreeMap::new();
    if let Some(genome_size) = &config.genome_size {
        if graph.is_active(StageId::CallPeaksReplicate) {
            log::info!("Stage call_peaks_replicate: {} artifacts", replicates.len());
            let results: Vec<(ReplicateKey, Result<CallPeaksOutputs>)> = pool.install(|| {
                replicates
                    .par_iter()
                    .map(|(key, out)| {
                        let result = call_peaks::run(
                            &CallPeaksInputs {
                                artifact: &out.artifact,
                                level: AggregationLevel::Replicate,
                                genome_size,
                                paired_end,
                                mapped_reads: out.flagstat.mapped,
                                annotation: config.annotation.as_ref(),
                            },
                            layout,
                        );
                        (key.clone(), result)
                    })
                    .collect()
            });
            replicate_peaks = split_results(StageId::CallPeaksReplicate, results, &mut summary);
        }
        if graph.is_active(StageId::CallPeaksCondition) {
            log::info!("Stage call_peaks_condition: {} artifacts", conditions.len());
            let results: Vec<(ConditionKey, Result<CallPeaksOutputs>)> = pool.install(|| {
                conditions
                    .par_iter()
                    .map(|(key, out)| {
                        let result = call_peaks::run(
                            &CallPeaksInputs {
                                artifact: &out.artifact,
                                level: AggregationLevel::Condition,
                                genome_size,
                                paired_end,
                                mapped_reads: out.flagstat.mapped,
                                annotation: config.annotation.as_ref(),
                            },
                            layout,
                        );
                        (key.clone(), result)
                    })
                    .collect()
            });
            condition_peaks = split_results(StageId::CallPeaksCondition, results, &mut summary);
        }
    }

    // Consensus construction is all-or-nothing over its level's peak sets.
    let expected_replicates: Vec<ReplicateKey> =
        replicate_groups.iter().map(|(k, _)| k.clone()).collect();
    let expected_conditions: Vec<ConditionKey> =
        condition_groups.iter().map(|(k, _)| k.clone()).collect();

    let mut replicate_consensus: Option<ConsensusPeaksOutputs> = None;
    if graph.is_active(StageId::ConsensusReplicate) {
        log::info!("Stage consensus_replicate");
        let result = gather_peak_sets(
            StageId::ConsensusReplicate,
            AggregationLevel::Replicate,
            &expected_replicates,
            &replicate_peaks,
        )
        .and_then(|sets| {
            consensus_peaks::run(
                &ConsensusPeaksInputs {
                    level: AggregationLevel::Replicate,
                    peak_sets: &sets,
                    min_support: config.min_support,
                    annotation: config.annotation.as_ref(),
                },
                layout,
            )
        });
        replicate_consensus = record_fan_in(
            StageId::ConsensusReplicate,
            AggregationLevel::Replicate,
            result,
            &mut summary,
        );
    }

    let mut condition_consensus: Option<ConsensusPeaksOutputs> = None;
    if graph.is_active(StageId::ConsensusCondition) {
        log::info!("Stage consensus_condition");
        let result = gather_peak_sets(
            StageId::ConsensusCondition,
            AggregationLevel::Condition,
            &expected_conditions,
            &condition_peaks,
        )
        .and_then(|sets| {
            consensus_peaks::run(
                &ConsensusPeaksInputs {
                    level: AggregationLevel::Condition,
                    peak_sets: &sets,
                    min_support: config.min_support,
                    annotation: config.annotation.as_ref(),
                },
                layout,
            )
        });
        condition_consensus = record_fan_in(
            StageId::ConsensusCondition,
            AggregationLevel::Condition,
            result,
            &mut summary,
        );
    }

    // Differential analysis needs the consensus and every artifact of its
    // level.
    let comparisons = design.comparison_pairs();
    if graph.is_active(StageId::DifferentialReplicate) {
        log::info!("Stage differential_replicate: {} contrasts", comparisons.len());
        let stage = StageId::DifferentialReplicate;
        let level = AggregationLevel::Replicate;
        let result = replicate_consensus
            .as_ref()
            .ok_or_else(|| missing_upstream(stage, level, StageId::ConsensusReplicate))
            .and_then(|consensus| {
                let artifacts = gather_artifacts(
                    stage,
                    &level,
                    &expected_replicates,
                    &replicates,
                    |o| &o.artifact,
                )?;
                differential::run(
                    &DifferentialInputs {
                        level,
                        saf: &consensus.saf,
                        artifacts,
                        comparisons: &comparisons,
                        paired_end,
                        script: &config.deseq2_script,
                        threads: config.threads,
                    },
                    layout,
                )
            });
        record_fan_in(stage, level, result, &mut summary);
    }

    if graph.is_active(StageId::DifferentialCondition) {
        log::info!("Stage differential_condition: {} contrasts", comparisons.len());
        let stage = StageId::DifferentialCondition;
        let level = AggregationLevel::Condition;
        let result = condition_consensus
            .as_ref()
            .ok_or_else(|| missing_upstream(stage, level, StageId::ConsensusCondition))
            .and_then(|consensus| {
                let artifacts = gather_artifacts(
                    stage,
                    &level,
                    &expected_conditions,
                    &conditions,
                    |o| &o.artifact,
                )?;
                differential::run(
                    &DifferentialInputs {
                        level,
                        saf: &consensus.saf,
                        artifacts,
                        comparisons: &comparisons,
                        paired_end,
                        script: &config.deseq2_script,
                        threads: config.threads,
                    },
                    layout,
                )
            });
        record_fan_in(stage, level, result, &mut summary);
    }

    for failure in &summary.failures {
        log::warn!(
            "Branch '{}' of stage {} did not finish",
            failure.key,
            failure.stage
        );
    }
    Ok(summary)
}

/// The resolved design and the planned stages, as printed in dry-run mode.
pub fn describe_plan(design: &DesignTable, graph: &StageGraph, layout: &OutputLayout) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Output root: {}", layout.root().display()));
    lines.push(format!(
        "Design: {} libraries, {} replicates, {} conditions, {}",
        design.rows().len(),
        design.replicate_groups().len(),
        design.condition_groups().len(),
        if design.is_paired_end() {
            "paired-end"
        } else {
            "single-end"
        }
    ));
    for row in design.rows() {
        let reads = row
            .reads
            .paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("  {}: {reads}", row.key));
    }
    lines.push("Stages:".to_string());
    for node in graph.nodes() {
        let keys = match node.level {
            AggregationLevel::Library => design.rows().len(),
            AggregationLevel::Replicate => design.replicate_groups().len(),
            AggregationLevel::Condition => design.condition_groups().len(),
        };
        let detail = match node.fan {
            crate::plan::FanMode::PerKey => format!("{keys} branches"),
            crate::plan::FanMode::AllKeys => format!("fan-in over {keys} keys"),
        };
        let status = if node.active { "run " } else { "skip" };
        lines.push(format!(
            "  [{status}] {} ({} level, {detail})",
            node.id, node.level
        ));
    }
    lines.join("\n") + "\n"
}

/// Every external command the planned run would spawn, in conduction order,
/// as printed in dry-run mode. In-process treatments (BAM merging, flag and
/// region filtering, orphan removal) never shell out and are not listed.
pub fn describe_commands(
    design: &DesignTable,
    graph: &StageGraph,
    config: &RunConfig,
    layout: &OutputLayout,
) -> String {
    let paired_end = design.is_paired_end();
    let threads = config.threads;
    let sort_mem_mb = tools::sort_mem_mb(config.mem_gb, threads);
    let mut lines = vec!["Commands:".to_string()];

    lines.push(format!("  {}:", StageId::AlignLibrary));
    for row in design.rows() {
        let id = row.key.to_string();
        let bam = layout.library_bam(&id);
        lines.push(format!(
            "    {} | {}",
            tools::bwa_mem(
                &config.reference,
                &row.reads,
                &align_library::read_group(row),
                threads
            ),
            tools::samtools_sort(&bam, threads, sort_mem_mb)
        ));
        lines.push(format!("    {}", tools::samtools_index(&bam, threads)));
        lines.push(format!("    {}", tools::samtools_flagstat(&bam)));
    }

    let replicate_groups = design.replicate_groups();
    let condition_groups = design.condition_groups();
    let level_ids = |level: AggregationLevel| -> Vec<String> {
        match level {
            AggregationLevel::Library => design.rows().iter().map(|r| r.key.to_string()).collect(),
            AggregationLevel::Replicate => {
                replicate_groups.iter().map(|(k, _)| k.to_string()).collect()
            }
            AggregationLevel::Condition => {
                condition_groups.iter().map(|(k, _)| k.to_string()).collect()
            }
        }
    };

    lines.push(format!("  {}:", StageId::MergeReplicate));
    for id in level_ids(AggregationLevel::Replicate) {
        let level = AggregationLevel::Replicate;
        lines.push(format!(
            "    {}",
            tools::picard_mark_duplicates(
                &layout.merged_bam(level, &id),
                &layout.markdup_bam(&id),
                &layout.markdup_metrics(&id),
            )
        ));
        let final_bam = layout.final_bam(level, &id);
        lines.push(format!("    {}", tools::samtools_index(&final_bam, threads)));
        lines.push(format!("    {}", tools::samtools_flagstat(&final_bam)));
    }

    if graph.is_active(StageId::MergeCondition) {
        lines.push(format!("  {}:", StageId::MergeCondition));
        for id in level_ids(AggregationLevel::Condition) {
            let final_bam = layout.final_bam(AggregationLevel::Condition, &id);
            lines.push(format!("    {}", tools::samtools_index(&final_bam, threads)));
            lines.push(format!("    {}", tools::samtools_flagstat(&final_bam)));
        }
    }

    if let Some(genome_size) = &config.genome_size {
        for (stage, level) in [
            (StageId::CallPeaksReplicate, AggregationLevel::Replicate),
            (StageId::CallPeaksCondition, AggregationLevel::Condition),
        ] {
            if !graph.is_active(stage) {
                continue;
            }
            lines.push(format!("  {stage}:"));
            for id in level_ids(level) {
                let bam = layout.final_bam(level, &id);
                lines.push(format!(
                    "    {}",
                    tools::macs2_callpeak(
                        &bam,
                        &id,
                        &layout.peaks_dir(level),
                        genome_size,
                        paired_end
                    )
                ));
                lines.push(format!(
                    "    {}",
                    tools::samtools_count_in_regions(&bam, &layout.narrow_peak(level, &id))
                ));
                if let Some(annotation) = &config.annotation {
                    lines.push(format!(
                        "    {}",
                        tools::annotate_peaks(
                            &layout.narrow_peak(level, &id),
                            &annotation.fasta,
                            &annotation.gtf
                        )
                    ));
                }
            }
        }
    }

    if let Some(annotation) = &config.annotation {
        for (stage, level) in [
            (StageId::ConsensusReplicate, AggregationLevel::Replicate),
            (StageId::ConsensusCondition, AggregationLevel::Condition),
        ] {
            if !graph.is_active(stage) {
                continue;
            }
            lines.push(format!("  {stage}:"));
            lines.push(format!(
                "    {}",
                tools::annotate_peaks(
                    &layout.consensus_bed(level),
                    &annotation.fasta,
                    &annotation.gtf
                )
            ));
        }
    }

    let comparisons = design.comparison_pairs();
    for (stage, level) in [
        (StageId::DifferentialReplicate, AggregationLevel::Replicate),
        (StageId::DifferentialCondition, AggregationLevel::Condition),
    ] {
        if !graph.is_active(stage) {
            continue;
        }
        lines.push(format!("  {stage}:"));
        let bams: Vec<PathBuf> = level_ids(level)
            .iter()
            .map(|id| layout.final_bam(level, id))
            .collect();
        lines.push(format!(
            "    {}",
            tools::feature_counts(
                &layout.consensus_saf(level),
                &layout.counts_table(level),
                &bams,
                paired_end,
                threads
            )
        ));
        for (a, b) in &comparisons {
            let name = differential::comparison_name(a, b);
            lines.push(format!(
                "    {}",
                tools::differential_analysis(
                    &config.deseq2_script,
                    &layout.counts_table(level),
                    &layout.comparison_dir(level, &name),
                    &name
                )
            ));
        }
    }

    lines.join("\n") + "\n"
}
