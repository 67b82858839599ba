//! Alignment artifacts and their provenance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// How an artifact came to be: the artifact ids (or read files) it was built
/// from and the treatments applied along the way, in order.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Provenance {
    pub sources: Vec<String>,
    pub filters: Vec<String>,
}

/// A coordinate-sorted BAM at some aggregation level.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct AlignmentArtifact {
    /// Rendered aggregation key this artifact belongs to.
    pub id: String,
    pub bam: PathBuf,
    pub index: Option<PathBuf>,
    pub provenance: Provenance,
}

impl AlignmentArtifact {
    pub fn new(id: impl Into<String>, bam: impl Into<PathBuf>) -> AlignmentArtifact {
        AlignmentArtifact {
            id: id.into(),
            bam: bam.into(),
            index: None,
            provenance: Provenance::default(),
        }
    }

    /// The sidecar json describing this artifact's provenance.
    pub fn provenance_path(&self) -> PathBuf {
        self.bam.with_extension("provenance.json")
    }

    pub fn write_provenance(&self) -> Result<()> {
        let path = self.provenance_path();
        let file = File::create(&path)
            .with_context(|| format!("Error creating provenance file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.provenance)?;
        Ok(())
    }

    pub fn read_provenance(path: &Path) -> Result<Provenance> {
        let file = File::open(path)
            .with_context(|| format!("Error opening provenance file {}", path.display()))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
