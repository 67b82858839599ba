//! Called peak intervals.
//!
//! Peaks use BED conventions throughout: 0-based half-open coordinates. The
//! parser accepts narrowPeak (BED6+4) as written by the peak caller and any
//! BED-like file with at least chrom/start/end columns.

use anyhow::{bail, Context, Result};
use bio_types::strand::Strand;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One called peak.
#[derive(Clone, Debug)]
pub struct Peak {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    pub name: String,
    pub score: f64,
    pub strand: Strand,
    /// Offset of the summit from `start`, when the caller reports one.
    pub summit_offset: Option<i64>,
}

impl Peak {
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, chrom: &str, start: i64, end: i64) -> bool {
        self.chrom == chrom && self.start < end && start < self.end
    }
}

/// The peaks called for one artifact, tagged with the artifact id they came
/// from.
#[derive(Clone, Debug)]
pub struct PeakSet {
    pub source: String,
    pub peaks: Vec<Peak>,
}

impl PeakSet {
    pub fn new(source: impl Into<String>) -> PeakSet {
        PeakSet {
            source: source.into(),
            peaks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Load peaks from a narrowPeak or BED file. Lines starting with `#`,
    /// `track` or `browser` are ignored.
    pub fn from_bed(path: &Path, source: impl Into<String>) -> Result<PeakSet> {
        let source = source.into();
        let file = File::open(path)
            .with_context(|| format!("Error opening peak file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut peaks = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("Error reading peak file {}", path.display()))?;
            let line = line.trim_end();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 3 {
                bail!(
                    "Line {} of peak file {} has {} tab-separated columns, expected at least 3",
                    i + 1,
                    path.display(),
                    fields.len()
                );
            }

            let parse_pos = |field: &str, what: &str| -> Result<i64> {
                field.parse().with_context(|| {
                    format!(
                        "Line {} of peak file {}: cannot parse {what} '{field}'",
                        i + 1,
                        path.display()
                    )
                })
            };
            let chrom = fields[0].to_string();
            let start = parse_pos(fields[1], "start position")?;
            let end = parse_pos(fields[2], "end position")?;
            if start < 0 || end <= start {
                bail!(
                    "Line {} of peak file {} has an invalid interval {start}-{end}",
                    i + 1,
                    path.display()
                );
            }

            let name = match fields.get(3) {
                Some(&name) if !name.is_empty() && name != "." => name.to_string(),
                _ => format!("{source}_peak_{}", peaks.len() + 1),
            };
            let score = match fields.get(4) {
                Some(&score) if !score.is_empty() && score != "." => {
                    score.parse::<f64>().with_context(|| {
                        format!(
                            "Line {} of peak file {}: cannot parse score '{score}'",
                            i + 1,
                            path.display()
                        )
                    })?
                }
                _ => 0.0,
            };
            let strand = match fields.get(5) {
                Some(&"+") => Strand::Forward,
                Some(&"-") => Strand::Reverse,
                _ => Strand::Unknown,
            };
            let summit_offset = match fields.get(9) {
                Some(&summit) if !summit.is_empty() => {
                    let offset = parse_pos(summit, "summit offset")?;
                    (offset >= 0).then_some(offset)
                }
                _ => None,
            };

            peaks.push(Peak {
                chrom,
                start,
                end,
                name,
                score,
                strand,
                summit_offset,
            });
        }

        Ok(PeakSet { source, peaks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_peaks(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peaks.narrowPeak");
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_narrow_peak() {
        let (_dir, path) = write_peaks(
            "chr1\t100\t500\tWT_R01_peak_1\t250\t.\t5.1\t10.2\t8.3\t150\n\
             chr2\t0\t80\tWT_R01_peak_2\t90\t+\t2.0\t3.0\t1.5\t-1\n",
        );
        let set = PeakSet::from_bed(&path, "WT_R01").unwrap();
        assert_eq!(set.len(), 2);

        let first = &set.peaks[0];
        assert_eq!(first.chrom, "chr1");
        assert_eq!(first.start, 100);
        assert_eq!(first.end, 500);
        assert_eq!(first.name, "WT_R01_peak_1");
        assert_eq!(first.score, 250.0);
        assert_eq!(first.summit_offset, Some(150));

        let second = &set.peaks[1];
        assert_eq!(second.summit_offset, None);
        assert!(matches!(second.strand, Strand::Forward));
    }

    #[test]
    fn test_parse_minimal_bed_synthesizes_names() {
        let (_dir, path) = write_peaks(
            "track name=test\n\
             # comment\n\
             chr1\t10\t20\n\
             chr1\t30\t40\n",
        );
        let set = PeakSet::from_bed(&path, "KO_R02").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.peaks[0].name, "KO_R02_peak_1");
        assert_eq!(set.peaks[1].name, "KO_R02_peak_2");
    }

    #[test]
    fn test_parse_rejects_inverted_interval() {
        let (_dir, path) = write_peaks("chr1\t500\t100\n");
        let err = PeakSet::from_bed(&path, "WT_R01").unwrap_err();
        assert!(err.to_string().contains("invalid interval"));
    }

    #[test]
    fn test_parse_rejects_garbage_coordinates() {
        let (_dir, path) = write_peaks("chr1\tabc\t100\n");
        let err = PeakSet::from_bed(&path, "WT_R01").unwrap_err();
        assert!(format!("{err:#}").contains("start position"));
    }

    #[test]
    fn test_overlap() {
        let peak = Peak {
            chrom: "chr1".to_string(),
            start: 100,
            end: 200,
            name: "p".to_string(),
            score: 0.0,
            strand: Strand::Unknown,
            summit_offset: None,
        };
        assert!(peak.overlaps("chr1", 150, 250));
        assert!(!peak.overlaps("chr1", 200, 250));
        assert!(!peak.overlaps("chr2", 150, 250));
    }
}
