//! External collaborator commands.
//!
//! Every tool the pipeline shells out to is assembled here as a
//! [`ToolInvocation`] by a pure builder, so command lines can be asserted in
//! tests and printed verbatim in dry-run mode. Nothing in this module runs a
//! process except [`run`], [`run_capture`] and [`run_piped`].

use anyhow::{ensure, Context, Result};
use atac_types::ReadFiles;
use itertools::Itertools;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// samtools sort default memory per thread, used when the run gives no hint.
pub const DEFAULT_SORT_MEM_MB: usize = 768;

/// One external command, held as program plus argument strings.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ToolInvocation {
    /// Executable name, resolved through PATH.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl ToolInvocation {
    fn new(program: &str, args: Vec<String>) -> ToolInvocation {
        ToolInvocation {
            program: program.to_string(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.iter().join(" "))
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// The index file samtools writes for `bam`.
pub fn bai_path(bam: &Path) -> PathBuf {
    let mut name = bam.as_os_str().to_os_string();
    name.push(".bai");
    PathBuf::from(name)
}

/// Resolve the per-thread sort memory from an optional whole-job hint in GB.
/// A missing hint is not an error: warn and use the samtools default.
pub fn sort_mem_mb(mem_gb_hint: Option<usize>, threads: usize) -> usize {
    match mem_gb_hint {
        Some(gb) => ((gb * 1024) / threads.max(1)).max(1),
        None => {
            log::warn!(
                "No memory hint for sorting; using the default of {DEFAULT_SORT_MEM_MB}M per thread"
            );
            DEFAULT_SORT_MEM_MB
        }
    }
}

/// bwa mem, emitting SAM on stdout. `-M` keeps shorter split hits secondary
/// so the duplicate marker accepts them.
pub fn bwa_mem(index: &Path, reads: &ReadFiles, read_group: &str, threads: usize) -> ToolInvocation {
    let mut args = vec![
        "mem".to_string(),
        "-t".to_string(),
        threads.to_string(),
        "-M".to_string(),
        "-R".to_string(),
        read_group.to_string(),
        path_arg(index),
    ];
    args.extend(reads.paths().into_iter().map(path_arg));
    ToolInvocation::new("bwa", args)
}

/// samtools sort reading SAM from stdin and writing a coordinate-sorted BAM.
pub fn samtools_sort(output: &Path, threads: usize, mem_mb: usize) -> ToolInvocation {
    ToolInvocation::new(
        "samtools",
        vec![
            "sort".to_string(),
            "-@".to_string(),
            threads.to_string(),
            "-m".to_string(),
            format!("{mem_mb}M"),
            "-O".to_string(),
            "bam".to_string(),
            "-o".to_string(),
            path_arg(output),
            "-".to_string(),
        ],
    )
}

/// samtools index, producing `<bam>.bai`.
pub fn samtools_index(bam: &Path, threads: usize) -> ToolInvocation {
    ToolInvocation::new(
        "samtools",
        vec![
            "index".to_string(),
            "-b".to_string(),
            "-@".to_string(),
            threads.to_string(),
            path_arg(bam),
        ],
    )
}

/// samtools flagstat; parse the captured stdout with
/// [`atac_types::metrics::FlagstatSummary`].
pub fn samtools_flagstat(bam: &Path) -> ToolInvocation {
    ToolInvocation::new(
        "samtools",
        vec!["flagstat".to_string(), path_arg(bam)],
    )
}

/// Count the records of `bam` overlapping the intervals in `regions`
/// (BED-compatible, so a narrowPeak file works directly).
pub fn samtools_count_in_regions(bam: &Path, regions: &Path) -> ToolInvocation {
    ToolInvocation::new(
        "samtools",
        vec![
            "view".to_string(),
            "-c".to_string(),
            "-L".to_string(),
            path_arg(regions),
            path_arg(bam),
        ],
    )
}

/// picard MarkDuplicates in flag-only mode: duplicates are marked but kept,
/// so each aggregation level can decide what to drop.
pub fn picard_mark_duplicates(input: &Path, output: &Path, metrics: &Path) -> ToolInvocation {
    ToolInvocation::new(
        "picard",
        vec![
            "MarkDuplicates".to_string(),
            "--INPUT".to_string(),
            path_arg(input),
            "--OUTPUT".to_string(),
            path_arg(output),
            "--METRICS_FILE".to_string(),
            path_arg(metrics),
            "--REMOVE_DUPLICATES".to_string(),
            "false".to_string(),
            "--ASSUME_SORT_ORDER".to_string(),
            "coordinate".to_string(),
            "--VALIDATION_STRINGENCY".to_string(),
            "LENIENT".to_string(),
        ],
    )
}

/// macs2 callpeak on one alignment. Duplicate handling already happened
/// upstream, so the caller keeps every record it is given.
pub fn macs2_callpeak(
    treatment: &Path,
    name: &str,
    outdir: &Path,
    genome_size: &str,
    paired_end: bool,
) -> ToolInvocation {
    let format = if paired_end { "BAMPE" } else { "BAM" };
    ToolInvocation::new(
        "macs2",
        vec![
            "callpeak".to_string(),
            "-t".to_string(),
            path_arg(treatment),
            "-f".to_string(),
            format.to_string(),
            "-g".to_string(),
            genome_size.to_string(),
            "-n".to_string(),
            name.to_string(),
            "--outdir".to_string(),
            path_arg(outdir),
            "--keep-dup".to_string(),
            "all".to_string(),
        ],
    )
}

/// featureCounts over the consensus SAF, one column per input BAM.
pub fn feature_counts(
    annotation_saf: &Path,
    output: &Path,
    bams: &[PathBuf],
    paired_end: bool,
    threads: usize,
) -> ToolInvocation {
    let mut args = vec![
        "-F".to_string(),
        "SAF".to_string(),
        "-O".to_string(),
        "--fracOverlap".to_string(),
        "0.2".to_string(),
        "-T".to_string(),
        threads.to_string(),
        "-a".to_string(),
        path_arg(annotation_saf),
        "-o".to_string(),
        path_arg(output),
    ];
    if paired_end {
        args.push("-p".to_string());
        args.push("--countReadPairs".to_string());
    }
    args.extend(bams.iter().map(|b| path_arg(b)));
    ToolInvocation::new("featureCounts", args)
}

/// HOMER annotatePeaks.pl; the annotation table arrives on stdout.
pub fn annotate_peaks(peaks: &Path, fasta: &Path, gtf: &Path) -> ToolInvocation {
    ToolInvocation::new(
        "annotatePeaks.pl",
        vec![
            path_arg(peaks),
            path_arg(fasta),
            "-gid".to_string(),
            "-gtf".to_string(),
            path_arg(gtf),
        ],
    )
}

/// The DESeq2 driver script for one contrast, e.g. `treated_vs_control`.
pub fn differential_analysis(
    script: &Path,
    counts: &Path,
    outdir: &Path,
    contrast: &str,
) -> ToolInvocation {
    ToolInvocation::new(
        "Rscript",
        vec![
            path_arg(script),
            "--counts".to_string(),
            path_arg(counts),
            "--outdir".to_string(),
            path_arg(outdir),
            "--contrast".to_string(),
            contrast.to_string(),
        ],
    )
}

/// Run `inv`, requiring a zero exit status.
pub fn run(inv: &ToolInvocation) -> Result<()> {
    log::info!("Running: {inv}");
    let status = inv
        .command()
        .status()
        .with_context(|| format!("Failed to run {}", inv.program))?;
    ensure!(status.success(), "{} failed: {status}", inv.program);
    Ok(())
}

/// Run `inv` and capture stdout, requiring a zero exit status.
pub fn run_capture(inv: &ToolInvocation) -> Result<String> {
    log::info!("Running: {inv}");
    let output = inv
        .command()
        .output()
        .with_context(|| format!("Failed to run {}", inv.program))?;
    ensure!(
        output.status.success(),
        "{} failed: {}\n{}",
        inv.program,
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .with_context(|| format!("{} produced non-UTF8 output", inv.program))
}

/// Run `producer | consumer`, requiring zero exit status from both.
pub fn run_piped(producer: &ToolInvocation, consumer: &ToolInvocation) -> Result<()> {
    log::info!("Running: {producer} | {consumer}");
    let mut producer_child = producer
        .command()
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", producer.program))?;
    let producer_stdout = producer_child
        .stdout
        .take()
        .with_context(|| format!("Failed to open stdout of {}", producer.program))?;

    let consumer_status = consumer
        .command()
        .stdin(Stdio::from(producer_stdout))
        .status()
        .with_context(|| format!("Failed to run {}", consumer.program))?;
    let producer_status = producer_child
        .wait()
        .with_context(|| format!("Failed to wait for {}", producer.program))?;

    ensure!(
        producer_status.success(),
        "{} failed: {producer_status}",
        producer.program
    );
    ensure!(
        consumer_status.success(),
        "{} failed: {consumer_status}",
        consumer.program
    );
    Ok(())
}
