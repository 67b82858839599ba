//! Call peaks for one artifact and measure enrichment.
//!
//! The caller's narrowPeak output is read back as the key's peak set for
//! consensus construction, and the fraction of reads in peaks (FRiP) is
//! measured by counting records overlapping the called intervals. When
//! annotation inputs are configured the narrowPeak is also run through the
//! annotation engine.

use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::stages::consensus_peaks::AnnotationConfig;
use crate::tools;
use anyhow::{Context, Result};
use atac_types::metrics::JsonReporter;
use atac_types::peaks::PeakSet;
use atac_types::AlignmentArtifact;

pub struct CallPeaksInputs<'a> {
    pub artifact: &'a AlignmentArtifact,
    pub level: AggregationLevel,
    /// Effective genome size passed to the peak caller, e.g. `hs` or
    /// `2600000000`.
    pub genome_size: &'a str,
    pub paired_end: bool,
    /// Mapped records of the artifact, from its flagstat.
    pub mapped_reads: u64,
    pub annotation: Option<&'a AnnotationConfig>,
}

pub struct CallPeaksOutputs {
    pub peaks: PeakSet,
    pub reads_in_peaks: u64,
    pub frip: Option<f64>,
}

/// Fraction of reads in peaks. None when the artifact had nothing mapped.
pub fn frip(reads_in_peaks: u64, mapped_reads: u64) -> Option<f64> {
    (mapped_reads > 0).then(|| reads_in_peaks as f64 / mapped_reads as f64)
}

pub fn run(args: &CallPeaksInputs<'_>, layout: &OutputLayout) -> Result<CallPeaksOutputs> {
    let id = &args.artifact.id;
    log::info!("Calling peaks on {} artifact {id}", args.level);

    let outdir = layout.peaks_dir(args.level);
    tools::run(&tools::macs2_callpeak(
        &args.artifact.bam,
        id,
        &outdir,
        args.genome_size,
        args.paired_end,
    ))?;

    // The caller writes an empty narrowPeak when it finds nothing; that is
    // a valid, empty peak set.
    let narrow_peak = layout.narrow_peak(args.level, id);
    let peaks = PeakSet::from_bed(&narrow_peak, id.clone())?;

    let count_text = tools::run_capture(&tools::samtools_count_in_regions(
        &args.artifact.bam,
        &narrow_peak,
    ))?;
    let reads_in_peaks: u64 = count_text
        .trim()
        .parse()
        .with_context(|| format!("Error parsing region read count '{}'", count_text.trim()))?;
    let frip = frip(reads_in_peaks, args.mapped_reads);

    let mut summary = JsonReporter::new();
    summary.insert("peaks_called", peaks.len());
    summary.insert("reads_in_peaks", reads_in_peaks);
    summary.insert("frip", frip);
    summary.report(&layout.peaks_summary(args.level, id))?;

    if let Some(annotation) = args.annotation {
        let table = tools::run_capture(&tools::annotate_peaks(
            &narrow_peak,
            &annotation.fasta,
            &annotation.gtf,
        ))?;
        let path = layout.peaks_annotation(args.level, id);
        std::fs::write(&path, table)
            .with_context(|| format!("Error writing annotation table {}", path.display()))?;
    }

    Ok(CallPeaksOutputs {
        peaks,
        reads_in_peaks,
        frip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frip() {
        assert_eq!(frip(250, 1000), Some(0.25));
        assert_eq!(frip(0, 1000), Some(0.0));
        assert_eq!(frip(0, 0), None);
    }
}
