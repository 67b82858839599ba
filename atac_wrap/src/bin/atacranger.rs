//! atacranger
#![deny(missing_docs)]

use anyhow::{bail, Result};
use atac_bam::filter::FilterRules;
use atac_lib::consensus::{build_consensus, ConsensusOptions};
use atac_lib::exec::{self, RunConfig};
use atac_lib::layout::OutputLayout;
use atac_lib::plan::{StageGraph, StageId};
use atac_lib::preflight;
use atac_lib::stages::consensus_peaks::AnnotationConfig;
use atac_types::peaks::PeakSet;
use atac_types::DesignTable;
use atac_wrap::job_args::JobArgs;
use atac_wrap::utils::{print_error_chain, validate_id, CliPath};
use clap::Parser;
use env_logger::Env;
use itertools::Itertools;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

const CMD: &str = "atacranger";

/// Effective genome size accepted by the peak caller: one of its species
/// shortcuts or a positive number.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
struct GenomeSize(String);

impl FromStr for GenomeSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<GenomeSize> {
        preflight::check_genome_size(s)?;
        Ok(GenomeSize(s.to_string()))
    }
}

/// Process chromatin accessibility (ATAC-seq) data from raw reads to
/// consensus peaks and differential accessibility.
#[derive(Parser, Debug)]
#[clap(
    name = CMD,
    version = env!("CARGO_PKG_VERSION"),
    before_help = format!("{CMD} {}", env!("CARGO_PKG_VERSION"))
)]
struct AtacRanger {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Align, filter, aggregate, call peaks and compare conditions for a
    /// full design table.
    #[clap(name = "run")]
    Run(Run),

    /// Build consensus intervals from peak files that already exist.
    #[clap(name = "consensus")]
    Consensus(Consensus),
}

/// Runs the pipeline end to end: alignment per library, aggregation per
/// replicate and condition, peak calling, consensus construction and
/// differential analysis, with the stage set resolved from the design.
#[derive(Parser, Debug, Clone, Serialize)]
struct Run {
    /// A unique run id and output folder name [a-zA-Z0-9_-]+.
    #[clap(long, value_name = "ID", value_parser = validate_id, required = true)]
    id: String,

    /// Run description to embed in output files.
    #[clap(long, default_value = "", value_name = "TEXT")]
    description: String,

    /// CSV file declaring input libraries, with header
    /// condition,replicate,fastq_1[,fastq_2].
    #[clap(long, value_name = "CSV", required = true)]
    design: CliPath,

    /// Reference genome FASTA, doubling as the aligner index prefix.
    #[clap(long, value_name = "PATH", required = true)]
    reference: CliPath,

    /// Treat libraries as paired-end; the design must then carry fastq_2.
    #[clap(long)]
    paired_end: bool,

    /// BED file of blacklisted regions dropped from every artifact.
    #[clap(long, value_name = "BED")]
    blacklist: Option<CliPath>,

    /// Contig excluded entirely, e.g. chrM. May be given multiple times.
    #[clap(long = "exclude-contig", value_name = "NAME")]
    exclude_contigs: Vec<String>,

    /// JSON file of declarative read filter rules (insert size bounds,
    /// soft-clip fraction cap).
    #[clap(long, value_name = "JSON")]
    filter_rules: Option<CliPath>,

    /// Minimum mapping quality kept by replicate-level filtering.
    #[clap(long, default_value_t = 20, value_name = "NUM")]
    min_mapq: u8,

    /// Effective genome size for the peak caller: hs, mm, ce, dm or a
    /// positive number. Omit to disable peak calling and every stage
    /// downstream of it.
    #[clap(long, value_name = "SIZE")]
    genome_size: Option<GenomeSize>,

    /// Minimum number of distinct sources supporting a consensus interval.
    #[clap(long, default_value_t = 1, value_name = "NUM")]
    min_support: usize,

    /// Do not aggregate replicates into per-condition artifacts.
    #[clap(long)]
    skip_merge_replicates: bool,

    /// GTF gene annotation; enables peak annotation against --reference.
    #[clap(long, value_name = "GTF")]
    gtf: Option<CliPath>,

    /// Driver script for the differential analysis engine. Required when
    /// the design produces condition contrasts.
    #[clap(long, value_name = "SCRIPT")]
    deseq2_script: Option<CliPath>,

    #[clap(flatten)]
    job: JobArgs,

    /// Print the resolved plan and every external command, then stop.
    #[clap(long)]
    dry: bool,
}

impl Run {
    fn to_config(&self) -> Result<RunConfig> {
        let rules = match &self.filter_rules {
            Some(path) => Some(FilterRules::from_json(path)?),
            None => None,
        };
        let annotation = self.gtf.as_ref().map(|gtf| AnnotationConfig {
            fasta: self.reference.to_path_buf(),
            gtf: gtf.to_path_buf(),
        });
        Ok(RunConfig {
            reference: self.reference.to_path_buf(),
            blacklist: self.blacklist.as_ref().map(|b| b.to_path_buf()),
            exclude_contigs: self.exclude_contigs.clone(),
            rules,
            min_mapq: self.min_mapq,
            genome_size: self.genome_size.as_ref().map(|g| g.0.clone()),
            min_support: self.min_support,
            skip_merge_replicates: self.skip_merge_replicates,
            annotation,
            deseq2_script: self
                .deseq2_script
                .as_ref()
                .map_or_else(PathBuf::new, |s| s.to_path_buf()),
            jobs: self.job.jobs(),
            threads: self.job.localcores(),
            mem_gb: self.job.localmem(),
        })
    }

    fn execute(&self) -> Result<ExitCode> {
        let design = DesignTable::from_csv(&self.design, self.paired_end)?;
        let config = self.to_config()?;
        let graph = StageGraph::plan(design.shape(), &config.plan_options());
        let layout = OutputLayout::new(&self.id);

        if self.deseq2_script.is_none()
            && (graph.is_active(StageId::DifferentialReplicate)
                || graph.is_active(StageId::DifferentialCondition))
        {
            bail!(
                "This design produces condition contrasts; supply the differential \
                 driver script with --deseq2-script."
            );
        }

        if self.dry {
            println!("Dry Run Mode");
            println!();
            print!("{}", exec::describe_plan(&design, &graph, &layout));
            println!();
            print!(
                "{}",
                exec::describe_commands(&design, &graph, &config, &layout)
            );
            return Ok(ExitCode::SUCCESS);
        }

        preflight::check_run(&design, &config, &layout)?;
        record_invocation(&layout, self)?;

        let summary = exec::execute_planned(&design, &graph, &config, &layout)?;
        if summary.is_success() {
            println!("{CMD} run {} complete", self.id);
            Ok(ExitCode::SUCCESS)
        } else {
            println!(
                "{CMD} run {} finished with {} failed branches",
                self.id,
                summary.failures.len()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Persist the invocation in the run directory: the literal command line in
/// `_cmdline` and the parsed parameter set in `_invocation.json`.
fn record_invocation(layout: &OutputLayout, run: &Run) -> Result<()> {
    std::fs::write(
        layout.root().join("_cmdline"),
        std::env::args().join(" ") + "\n",
    )?;
    let json = serde_json::to_string_pretty(run)?;
    std::fs::write(layout.root().join("_invocation.json"), json + "\n")?;
    Ok(())
}

/// Builds one consensus interval set from peak files produced earlier,
/// without touching alignments. Sources are named after the file stems.
#[derive(Parser, Debug, Clone, Serialize)]
struct Consensus {
    /// narrowPeak or BED peak files, one per source. At least two.
    #[clap(value_name = "PEAKS", num_args = 2.., required = true)]
    peaks: Vec<CliPath>,

    /// Directory the BED, SAF, boolean matrix and summary are written to.
    #[clap(long, value_name = "DIR", default_value = "consensus")]
    outdir: PathBuf,

    /// Minimum number of distinct sources supporting an interval.
    #[clap(long, default_value_t = 1, value_name = "NUM")]
    min_support: usize,

    /// Print the sources and output paths, then stop.
    #[clap(long)]
    dry: bool,
}

/// Source id for a peak file: the file stem, with the peak caller's
/// `_peaks` suffix stripped.
fn peak_source_id(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("peaks");
    stem.strip_suffix("_peaks").unwrap_or(stem).to_string()
}

impl Consensus {
    fn execute(&self) -> Result<ExitCode> {
        let mut sets = Vec::with_capacity(self.peaks.len());
        for path in &self.peaks {
            sets.push(PeakSet::from_bed(path, peak_source_id(path))?);
        }
        let opts = ConsensusOptions {
            min_support: self.min_support,
        };

        if self.dry {
            println!("Dry Run Mode");
            println!();
            println!("Consensus over {} sources:", sets.len());
            for set in &sets {
                println!("  {}: {} peaks", set.source, set.peaks.len());
            }
            println!("Output directory: {}", self.outdir.display());
            return Ok(ExitCode::SUCCESS);
        }

        let build = build_consensus(&sets, &opts)?;
        std::fs::create_dir_all(&self.outdir)?;
        build.write_bed(&self.outdir.join("consensus_peaks.bed"))?;
        build.write_saf(&self.outdir.join("consensus_peaks.saf"))?;
        build.write_boolean_matrix(&self.outdir.join("consensus_peaks.boolean.txt"))?;
        build
            .to_reporter()
            .report(&self.outdir.join("consensus_peaks_summary.json"))?;
        println!(
            "Wrote {} consensus intervals from {} sources to {}",
            build.intervals.len(),
            build.sources.len(),
            self.outdir.display()
        );
        Ok(ExitCode::SUCCESS)
    }
}

fn inner_main() -> Result<ExitCode> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = AtacRanger::parse();
    match opts.subcmd {
        SubCommand::Run(run) => run.execute(),
        SubCommand::Consensus(consensus) => consensus.execute(),
    }
}

fn main() -> ExitCode {
    match inner_main() {
        Ok(exit_code) => exit_code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
