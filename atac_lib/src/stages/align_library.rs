//! Align one technical library and coordinate-sort the result.
//!
//! The aligner streams SAM straight into the sorter, so no unsorted
//! intermediate ever touches disk. The sorted BAM is indexed and its
//! flagstat captured as the library's summary metrics.

use crate::layout::OutputLayout;
use crate::plan::AggregationLevel;
use crate::tools;
use anyhow::Result;
use atac_types::metrics::FlagstatSummary;
use atac_types::{AlignmentArtifact, DesignRow};
use std::path::Path;

pub struct AlignLibraryInputs<'a> {
    pub row: &'a DesignRow,
    /// Aligner index prefix, i.e. the reference FASTA.
    pub reference: &'a Path,
    pub threads: usize,
    pub sort_mem_mb: usize,
}

pub struct AlignLibraryOutputs {
    pub artifact: AlignmentArtifact,
    pub flagstat: FlagstatSummary,
}

/// The read group stamped on every record: the library key identifies the
/// group, the replicate key the sample it belongs to.
pub fn read_group(row: &DesignRow) -> String {
    format!(
        "@RG\\tID:{id}\\tSM:{sample}\\tLB:{id}\\tPL:ILLUMINA",
        id = row.key,
        sample = row.key.replicate_key()
    )
}

pub fn run(args: &AlignLibraryInputs<'_>, layout: &OutputLayout) -> Result<AlignLibraryOutputs> {
    let id = args.row.key.to_string();
    log::info!("Aligning library {id}");
    let bam = layout.library_bam(&id);

    tools::run_piped(
        &tools::bwa_mem(
            args.reference,
            &args.row.reads,
            &read_group(args.row),
            args.threads,
        ),
        &tools::samtools_sort(&bam, args.threads, args.sort_mem_mb),
    )?;
    tools::run(&tools::samtools_index(&bam, args.threads))?;

    let flagstat =
        FlagstatSummary::parse(&tools::run_capture(&tools::samtools_flagstat(&bam))?)?;
    let mut summary = flagstat.to_reporter();
    summary.add_prefix("flagstat");
    summary.insert("mapped_rate", flagstat.mapped_rate());
    summary.insert("scale_factor", flagstat.scale_factor());
    summary.report(&layout.summary_json(AggregationLevel::Library, &id))?;

    let mut artifact = AlignmentArtifact::new(&id, &bam);
    artifact.index = Some(tools::bai_path(&bam));
    artifact.provenance.sources = args
        .row
        .reads
        .paths()
        .into_iter()
        .map(|p| p.display().to_string())
        .collect();
    artifact.provenance.filters = vec!["align".to_string(), "coordinate_sort".to_string()];
    artifact.write_provenance()?;

    Ok(AlignLibraryOutputs { artifact, flagstat })
}

#[cfg(test)]
mod tests {
    use super::*;
    use atac_types::{LibraryKey, ReadFiles};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_read_group_names_library_and_sample() {
        let row = DesignRow {
            key: LibraryKey {
                condition: "treated".to_string(),
                replicate: 1,
                technical: 2,
            },
            reads: ReadFiles::Single("r1.fastq.gz".into()),
        };
        assert_eq!(
            read_group(&row),
            "@RG\\tID:treated_R01_T02\\tSM:treated_R01\\tLB:treated_R01_T02\\tPL:ILLUMINA"
        );
    }
}
