//! Pre-run environment checks.
//!
//! Everything here fails fast on problems the run would otherwise only trip
//! over mid-flight, after hours of alignment. Checks cover the resources
//! named in the configuration, not the design CSV, which is validated
//! during resolution.

use crate::exec::RunConfig;
use crate::layout::OutputLayout;
use crate::plan::{StageGraph, StageId};
use anyhow::{bail, Context, Result};
use atac_types::errors::ConfigError;
use atac_types::peaks::PeakSet;
use atac_types::DesignTable;
use std::fs::File;
use std::path::{Path, PathBuf};

fn check_exists(what: &'static str, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(ConfigError::MissingResource {
            what,
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// The reference FASTA and its aligner index must both be present.
pub fn check_reference(reference: &Path) -> Result<()> {
    check_exists("reference FASTA", reference)?;
    let mut bwt = reference.as_os_str().to_os_string();
    bwt.push(".bwt");
    check_exists("aligner index", &PathBuf::from(bwt))?;
    Ok(())
}

/// The blacklist must exist and parse as BED.
pub fn check_blacklist(path: &Path) -> Result<()> {
    check_exists("blacklist BED", path)?;
    PeakSet::from_bed(path, "blacklist")
        .with_context(|| format!("Error validating blacklist {}", path.display()))?;
    Ok(())
}

/// The effective genome size is one of the caller's shortcuts or a positive
/// number (scientific notation included).
pub fn check_genome_size(genome_size: &str) -> Result<()> {
    const SHORTCUTS: [&str; 4] = ["hs", "mm", "ce", "dm"];
    if SHORTCUTS.contains(&genome_size)
        || genome_size.parse::<f64>().is_ok_and(|v| v > 0.0)
    {
        Ok(())
    } else {
        bail!(
            "Invalid effective genome size '{genome_size}'. Use one of hs, mm, ce, dm \
             or a positive number such as 2700000000 or 2.7e9."
        );
    }
}

/// The run directory must be creatable and writable.
pub fn check_writable(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Error creating output directory {}", root.display()))?;
    let probe = root.join(".write_test");
    File::create(&probe)
        .with_context(|| format!("Output directory {} is not writable", root.display()))?;
    std::fs::remove_file(&probe)
        .with_context(|| format!("Error removing probe file {}", probe.display()))?;
    Ok(())
}

/// All pre-run checks for one configured run.
pub fn check_run(design: &DesignTable, config: &RunConfig, layout: &OutputLayout) -> Result<()> {
    check_reference(&config.reference)?;
    if let Some(blacklist) = &config.blacklist {
        check_blacklist(blacklist)?;
    }
    if let Some(genome_size) = &config.genome_size {
        check_genome_size(genome_size)?;
    }
    if let Some(annotation) = &config.annotation {
        check_exists("annotation FASTA", &annotation.fasta)?;
        check_exists("annotation GTF", &annotation.gtf)?;
    }
    let graph = StageGraph::plan(design.shape(), &config.plan_options());
    if graph.is_active(StageId::DifferentialReplicate)
        || graph.is_active(StageId::DifferentialCondition)
    {
        check_exists("differential analysis script", &config.deseq2_script)?;
    }
    check_writable(layout.root())?;
    Ok(())
}
