//! On-disk layout of a run directory.
//!
//! Every stage resolves its paths through [`OutputLayout`] so that file
//! naming stays in one place. The tree groups outputs by aggregation level
//! first and by concern second:
//!
//! ```text
//! <root>/<level>/alignment/    merged and sorted BAMs
//! <root>/<level>/filtering/    filtered BAMs and their run summaries
//! <root>/<level>/peaks/        per-key peak calls
//! <root>/<level>/consensus/    the level's consensus peak set
//! <root>/<level>/differential/ count tables and per-contrast results
//! ```

use crate::plan::{AggregationLevel, StageGraph, StageId};
use anyhow::{Context, Result};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

/// Path vocabulary for one run directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// A layout rooted at `root`. Nothing is created until
    /// [`OutputLayout::create_dirs`].
    pub fn new(root: impl Into<PathBuf>) -> OutputLayout {
        OutputLayout { root: root.into() }
    }

    /// The run directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn level_dir(&self, level: AggregationLevel) -> PathBuf {
        self.root.join(level.to_string())
    }

    /// Directory holding merged and sorted BAMs for `level`.
    pub fn alignment_dir(&self, level: AggregationLevel) -> PathBuf {
        self.level_dir(level).join("alignment")
    }

    /// Directory holding filtered BAMs for `level`.
    pub fn filtering_dir(&self, level: AggregationLevel) -> PathBuf {
        self.level_dir(level).join("filtering")
    }

    /// Directory holding per-key peak calls for `level`.
    pub fn peaks_dir(&self, level: AggregationLevel) -> PathBuf {
        self.level_dir(level).join("peaks")
    }

    /// Directory holding the consensus peak set for `level`.
    pub fn consensus_dir(&self, level: AggregationLevel) -> PathBuf {
        self.level_dir(level).join("consensus")
    }

    /// Directory holding count tables and contrast results for `level`.
    pub fn differential_dir(&self, level: AggregationLevel) -> PathBuf {
        self.level_dir(level).join("differential")
    }

    /// Directory for one named contrast, e.g. `treated_vs_control`.
    pub fn comparison_dir(&self, level: AggregationLevel, comparison: &str) -> PathBuf {
        self.differential_dir(level).join(comparison)
    }

    /// The aligned, coordinate-sorted BAM for one library.
    pub fn library_bam(&self, id: &str) -> PathBuf {
        self.alignment_dir(AggregationLevel::Library)
            .join(format!("{id}.sorted.bam"))
    }

    /// The raw merge of a key's inputs, before any filtering.
    pub fn merged_bam(&self, level: AggregationLevel, id: &str) -> PathBuf {
        self.alignment_dir(level).join(format!("{id}.merged.bam"))
    }

    /// The duplicate-flagged replicate BAM.
    pub fn markdup_bam(&self, id: &str) -> PathBuf {
        self.alignment_dir(AggregationLevel::Replicate)
            .join(format!("{id}.markdup.bam"))
    }

    /// The duplicate-marking metrics file that goes with
    /// [`OutputLayout::markdup_bam`].
    pub fn markdup_metrics(&self, id: &str) -> PathBuf {
        self.alignment_dir(AggregationLevel::Replicate)
            .join(format!("{id}.markdup_metrics.txt"))
    }

    /// Intermediate flag-filtered BAM, before orphan removal.
    pub fn filtered_bam(&self, level: AggregationLevel, id: &str) -> PathBuf {
        self.filtering_dir(level).join(format!("{id}.filtered.bam"))
    }

    /// The final artifact BAM for a key at `level`. Downstream stages read
    /// this path.
    pub fn final_bam(&self, level: AggregationLevel, id: &str) -> PathBuf {
        match level {
            AggregationLevel::Library => self.library_bam(id),
            _ => self.filtering_dir(level).join(format!("{id}.bam")),
        }
    }

    /// Per-key JSON metrics summary.
    pub fn summary_json(&self, level: AggregationLevel, id: &str) -> PathBuf {
        let dir = match level {
            AggregationLevel::Library => self.alignment_dir(level),
            _ => self.filtering_dir(level),
        };
        dir.join(format!("{id}_summary.json"))
    }

    /// The narrowPeak file the peak caller writes for `id`.
    pub fn narrow_peak(&self, level: AggregationLevel, id: &str) -> PathBuf {
        self.peaks_dir(level).join(format!("{id}_peaks.narrowPeak"))
    }

    /// Per-key peak-calling metrics summary.
    pub fn peaks_summary(&self, level: AggregationLevel, id: &str) -> PathBuf {
        self.peaks_dir(level)
            .join(format!("{id}_peaks_summary.json"))
    }

    /// Annotation table for one key's called peaks, when annotation is
    /// configured.
    pub fn peaks_annotation(&self, level: AggregationLevel, id: &str) -> PathBuf {
        self.peaks_dir(level).join(format!("{id}_peaks.annotation.txt"))
    }

    /// Consensus intervals in BED format.
    pub fn consensus_bed(&self, level: AggregationLevel) -> PathBuf {
        self.consensus_dir(level).join("consensus_peaks.bed")
    }

    /// Consensus intervals in SAF format, for read counting.
    pub fn consensus_saf(&self, level: AggregationLevel) -> PathBuf {
        self.consensus_dir(level).join("consensus_peaks.saf")
    }

    /// Boolean presence matrix over the contributing peak sets.
    pub fn consensus_matrix(&self, level: AggregationLevel) -> PathBuf {
        self.consensus_dir(level).join("consensus_peaks.boolean.txt")
    }

    /// Consensus-construction metrics summary.
    pub fn consensus_summary(&self, level: AggregationLevel) -> PathBuf {
        self.consensus_dir(level).join("consensus_peaks_summary.json")
    }

    /// Annotation table for the consensus intervals, when annotation is
    /// configured.
    pub fn consensus_annotation(&self, level: AggregationLevel) -> PathBuf {
        self.consensus_dir(level).join("consensus_peaks.annotation.txt")
    }

    /// The read-count table over consensus intervals for `level`.
    pub fn counts_table(&self, level: AggregationLevel) -> PathBuf {
        self.differential_dir(level)
            .join("consensus_peaks.featureCounts.txt")
    }

    /// Create the directories every active stage writes into. Contrast
    /// subdirectories are created later, by the differential stage itself.
    pub fn create_dirs(&self, graph: &StageGraph) -> Result<()> {
        let mut dirs = vec![self.root.clone()];
        for node in graph.active_nodes() {
            match node.id {
                StageId::AlignLibrary => dirs.push(self.alignment_dir(node.level)),
                StageId::MergeReplicate | StageId::MergeCondition => {
                    dirs.push(self.alignment_dir(node.level));
                    dirs.push(self.filtering_dir(node.level));
                }
                StageId::CallPeaksReplicate | StageId::CallPeaksCondition => {
                    dirs.push(self.peaks_dir(node.level));
                }
                StageId::ConsensusReplicate | StageId::ConsensusCondition => {
                    dirs.push(self.consensus_dir(node.level));
                }
                StageId::DifferentialReplicate | StageId::DifferentialCondition => {
                    dirs.push(self.differential_dir(node.level));
                }
            }
        }
        for dir in dirs {
            create_dir_all(&dir)
                .with_context(|| format!("Error creating output directory {}", dir.display()))?;
        }
        Ok(())
    }
}
