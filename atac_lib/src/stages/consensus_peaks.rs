//! Build and export one level's consensus peak set.
//!
//! The consensus is written three ways: BED for browsers and region
//! filtering, SAF for the read counter, and a boolean presence matrix for
//! set-membership questions. When annotation inputs are configured the
//! consensus BED is also run through the annotation engine.

use crate::consensus::{build_consensus, ConsensusBuild, ConsensusOptions};
use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::tools;
use anyhow::{Context, Result};
use atac_types::peaks::PeakSet;
use std::path::PathBuf;

/// Inputs for the peak annotation engine.
#[derive(Clone, Debug)]
pub struct AnnotationConfig {
    pub fasta: PathBuf,
    pub gtf: PathBuf,
}

pub struct ConsensusPeaksInputs<'a> {
    pub level: AggregationLevel,
    /// All peak sets of the level, sorted by source id.
    pub peak_sets: &'a [PeakSet],
    pub min_support: usize,
    pub annotation: Option<&'a AnnotationConfig>,
}

pub struct ConsensusPeaksOutputs {
    pub build: ConsensusBuild,
    pub bed: PathBuf,
    pub saf: PathBuf,
}

pub fn run(args: &ConsensusPeaksInputs<'_>, layout: &OutputLayout) -> Result<ConsensusPeaksOutputs> {
    log::info!(
        "Building {} consensus from {} peak sets",
        args.level,
        args.peak_sets.len()
    );
    let build = build_consensus(
        args.peak_sets,
        &ConsensusOptions {
            min_support: args.min_support,
        },
    )?;

    let bed = layout.consensus_bed(args.level);
    let saf = layout.consensus_saf(args.level);
    build.write_bed(&bed)?;
    build.write_saf(&saf)?;
    build.write_boolean_matrix(&layout.consensus_matrix(args.level))?;
    build.to_reporter().report(&layout.consensus_summary(args.level))?;

    if let Some(annotation) = args.annotation {
        let table = tools::run_capture(&tools::annotate_peaks(
            &bed,
            &annotation.fasta,
            &annotation.gtf,
        ))?;
        let path = layout.consensus_annotation(args.level);
        std::fs::write(&path, table)
            .with_context(|| format!("Error writing annotation table {}", path.display()))?;
    }

    Ok(ConsensusPeaksOutputs { build, bed, saf })
}
