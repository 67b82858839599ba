//! Error taxonomy for the pipeline.
//!
//! Configuration problems abort a run before any stage starts. Alignment and
//! aggregation problems are fatal to the branch that hit them but leave
//! independent branches running.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The provided design CSV file is empty: {path:?}")]
    EmptyDesign { path: PathBuf },

    #[error(
        "Invalid replicate number '{value}' in line {line} of the design CSV file {path:?}. \
         Replicate numbers are 1-based positive integers."
    )]
    InvalidReplicate {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error(
        "Invalid character '{invalid}' in condition name '{condition}' in line {line} of the \
         design CSV. Condition names may only use letters, numbers, hyphens and underscores."
    )]
    InvalidConditionName {
        condition: String,
        invalid: char,
        line: usize,
    },

    #[error("The read file {path:?} referenced in line {line} of the design CSV does not exist.")]
    ReadFileMissing { path: PathBuf, line: usize },

    #[error(
        "The read file {path:?} appears more than once in the design CSV \
         (lines {first_line} and {line}). Every FASTQ may be listed only once."
    )]
    DuplicateReadFile {
        path: PathBuf,
        line: usize,
        first_line: usize,
    },

    #[error(
        "Line {line} of the design CSV has no 'fastq_2' entry, but the run is configured as \
         paired-end. Provide a mate file for every library or rerun in single-end mode."
    )]
    MissingMateFile { line: usize },

    #[error(
        "Line {line} of the design CSV provides a 'fastq_2' entry, but the run is configured as \
         single-end. Remove the mate files or rerun in paired-end mode."
    )]
    UnexpectedMateFile { line: usize },

    #[error("The {what} {path:?} does not exist.")]
    MissingResource { what: &'static str, path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum AlignmentError {
    #[error(
        "The BAM file {path:?} is not coordinate sorted (SO:{sort_order}). \
         Aggregation requires coordinate-sorted inputs."
    )]
    NotCoordinateSorted { path: PathBuf, sort_order: String },

    #[error(
        "The BAM file {path:?} was aligned against a different reference than {first:?}: {detail}. \
         All inputs of one aggregation must share the same reference sequences."
    )]
    HeaderMismatch {
        path: PathBuf,
        first: PathBuf,
        detail: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error(
        "Stage {stage} cannot build '{key}': upstream outputs are missing for {}. \
         The failures above explain why those branches stopped.",
        missing.join(", ")
    )]
    IncompleteFanIn {
        stage: String,
        key: String,
        missing: Vec<String>,
    },
}
