//! Count reads in consensus intervals and test the configured contrasts.
//!
//! One count table is produced per level, covering every artifact, and the
//! differential engine then runs once per condition pair against that
//! table. Each contrast writes into its own `<a>_vs_<b>` directory.

use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::tools;
use anyhow::{Context, Result};
use atac_types::{AlignmentArtifact, ConditionKey};
use std::path::{Path, PathBuf};

pub struct DifferentialInputs<'a> {
    pub level: AggregationLevel,
    /// Consensus intervals in SAF format.
    pub saf: &'a Path,
    /// Artifacts of every key at the level, sorted by artifact id.
    pub artifacts: Vec<&'a AlignmentArtifact>,
    /// Condition pairs to contrast, in sorted order.
    pub comparisons: &'a [(ConditionKey, ConditionKey)],
    pub paired_end: bool,
    pub script: &'a Path,
    pub threads: usize,
}

pub struct DifferentialOutputs {
    pub counts: PathBuf,
    /// Contrast name and its output directory, per comparison.
    pub comparisons: Vec<(String, PathBuf)>,
}

/// `<a>_vs_<b>` for a condition pair.
pub fn comparison_name(a: &ConditionKey, b: &ConditionKey) -> String {
    format!("{a}_vs_{b}")
}

pub fn run(args: &DifferentialInputs<'_>, layout: &OutputLayout) -> Result<DifferentialOutputs> {
    log::info!(
        "Differential analysis at {} level: {} artifacts, {} contrasts",
        args.level,
        args.artifacts.len(),
        args.comparisons.len()
    );

    let counts = layout.counts_table(args.level);
    let bams: Vec<PathBuf> = args.artifacts.iter().map(|a| a.bam.clone()).collect();
    tools::run(&tools::feature_counts(
        args.saf,
        &counts,
        &bams,
        args.paired_end,
        args.threads,
    ))?;

    let mut comparisons = Vec::new();
    for (a, b) in args.comparisons {
        let name = comparison_name(a, b);
        let outdir = layout.comparison_dir(args.level, &name);
        std::fs::create_dir_all(&outdir)
            .with_context(|| format!("Error creating contrast directory {}", outdir.display()))?;
        tools::run(&tools::differential_analysis(
            args.script,
            &counts,
            &outdir,
            &name,
        ))?;
        comparisons.push((name, outdir));
    }

    Ok(DifferentialOutputs { counts, comparisons })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_comparison_name() {
        let a = ConditionKey {
            condition: "treated".to_string(),
        };
        let b = ConditionKey {
            condition: "control".to_string(),
        };
        assert_eq!(comparison_name(&a, &b), "treated_vs_control");
    }
}
