//! Run metric reporting.
//!
//! Every stage folds its numbers into a [`JsonReporter`] which is written as
//! a summary json next to the artifacts it describes. Keys serialize in
//! sorted order so summaries diff cleanly between runs.

use anyhow::{bail, Context, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonReporter {
    map: BTreeMap<String, Value>,
}

impl Serialize for JsonReporter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.map.len()))?;
        for (k, v) in &self.map {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl JsonReporter {
    pub fn new() -> JsonReporter {
        JsonReporter::default()
    }

    /// Insert a new (key, value) pair. Panics if the key is already present.
    pub fn insert(&mut self, key: impl ToString, value: impl Into<Value>) {
        let key = key.to_string();
        assert!(!self.map.contains_key(&key));
        self.map.insert(key, value.into());
    }

    /// Insert a new (key, value) pair or replace the current value.
    pub fn insert_or_update(&mut self, key: impl ToString, value: impl Into<Value>) {
        self.map.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rewrite every key as `{prefix}_{key}`.
    pub fn add_prefix(&mut self, prefix: &str) {
        self.map = std::mem::take(&mut self.map)
            .into_iter()
            .map(|(k, v)| (format!("{prefix}_{k}"), v))
            .collect();
    }

    /// Fold another reporter into this one. Panics on key collisions.
    pub fn merge(&mut self, other: JsonReporter) {
        for (k, v) in other.map {
            self.insert(k, v);
        }
    }

    /// Write the metrics to `path` as pretty-printed json.
    pub fn report(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Error creating metrics file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(&mut writer)?;
        Ok(())
    }
}

/// Parsed `samtools flagstat` output. Counts are QC-passed reads only.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct FlagstatSummary {
    pub total: u64,
    pub secondary: u64,
    pub supplementary: u64,
    pub duplicates: u64,
    pub mapped: u64,
    pub paired: u64,
    pub properly_paired: u64,
}

impl FlagstatSummary {
    /// Parse the text emitted by `samtools flagstat`, tolerating both the
    /// classic layout and the newer one with `primary` breakdown lines.
    pub fn parse(text: &str) -> Result<FlagstatSummary> {
        let mut summary = FlagstatSummary::default();
        let mut saw_total = false;

        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[1] != "+" {
                continue;
            }
            let count: u64 = fields[0]
                .parse()
                .with_context(|| format!("Error parsing flagstat line '{line}'"))?;
            let what = fields[3..].join(" ");

            if what.starts_with("in total") {
                summary.total = count;
                saw_total = true;
            } else if what == "secondary" {
                summary.secondary = count;
            } else if what == "supplementary" {
                summary.supplementary = count;
            } else if what == "duplicates" {
                summary.duplicates = count;
            } else if what == "mapped" || what.starts_with("mapped (") {
                summary.mapped = count;
            } else if what.starts_with("paired in sequencing") {
                summary.paired = count;
            } else if what.starts_with("properly paired") {
                summary.properly_paired = count;
            }
        }

        if !saw_total {
            bail!("Unrecognized flagstat output: no 'in total' line found");
        }
        Ok(summary)
    }

    pub fn mapped_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.mapped as f64 / self.total as f64
        }
    }

    /// Per-million scale factor for coverage normalization, derived from the
    /// mapped read count. None when nothing mapped.
    pub fn scale_factor(&self) -> Option<f64> {
        if self.mapped == 0 {
            None
        } else {
            Some(1.0e6 / self.mapped as f64)
        }
    }

    pub fn to_reporter(&self) -> JsonReporter {
        let mut reporter = JsonReporter::new();
        reporter.insert("total", self.total);
        reporter.insert("secondary", self.secondary);
        reporter.insert("supplementary", self.supplementary);
        reporter.insert("duplicates", self.duplicates);
        reporter.insert("mapped", self.mapped);
        reporter.insert("paired", self.paired);
        reporter.insert("properly_paired", self.properly_paired);
        reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MODERN_FLAGSTAT: &str = "\
6243 + 0 in total (QC-passed reads + QC-failed reads)
6000 + 0 primary
193 + 0 secondary
50 + 0 supplementary
420 + 0 duplicates
420 + 0 primary duplicates
6100 + 0 mapped (97.71% : N/A)
5907 + 0 primary mapped (98.45% : N/A)
6000 + 0 paired in sequencing
3000 + 0 read1
3000 + 0 read2
5800 + 0 properly paired (96.67% : N/A)
5900 + 0 with itself and mate mapped
7 + 0 singletons (0.12% : N/A)
0 + 0 with mate mapped to a different chr
0 + 0 with mate mapped to a different chr (mapQ>=5)
";

    #[test]
    fn test_parse_modern_flagstat() {
        let summary = FlagstatSummary::parse(MODERN_FLAGSTAT).unwrap();
        assert_eq!(
            summary,
            FlagstatSummary {
                total: 6243,
                secondary: 193,
                supplementary: 50,
                duplicates: 420,
                mapped: 6100,
                paired: 6000,
                properly_paired: 5800,
            }
        );
    }

    #[test]
    fn test_parse_rejects_non_flagstat_text() {
        assert!(FlagstatSummary::parse("not a flagstat file\n").is_err());
    }

    #[test]
    fn test_scale_factor() {
        let summary = FlagstatSummary {
            mapped: 2_000_000,
            ..FlagstatSummary::default()
        };
        assert_eq!(summary.scale_factor(), Some(0.5));
        assert_eq!(FlagstatSummary::default().scale_factor(), None);
    }

    #[test]
    fn test_mapped_rate() {
        let summary = FlagstatSummary {
            total: 200,
            mapped: 150,
            ..FlagstatSummary::default()
        };
        assert_eq!(summary.mapped_rate(), 0.75);
        assert_eq!(FlagstatSummary::default().mapped_rate(), 0.0);
    }

    #[test]
    fn test_reporter_serializes_sorted() {
        let mut reporter = JsonReporter::new();
        reporter.insert("zulu", 1);
        reporter.insert("alpha", 2);
        reporter.insert("mike", 3);
        let json = serde_json::to_string(&reporter).unwrap();
        assert_eq!(json, r#"{"alpha":2,"mike":3,"zulu":1}"#);
    }

    #[test]
    fn test_reporter_prefix_and_merge() {
        let mut flagstat = FlagstatSummary {
            total: 10,
            mapped: 8,
            ..FlagstatSummary::default()
        }
        .to_reporter();
        flagstat.add_prefix("WT_R01");

        let mut reporter = JsonReporter::new();
        reporter.insert("peaks", 42);
        reporter.merge(flagstat);

        assert_eq!(reporter.get("WT_R01_mapped"), Some(&Value::from(8)));
        assert_eq!(reporter.get("peaks"), Some(&Value::from(42)));
    }
}
