//! Design table resolution.
//!
//! The design CSV names every sequencing library of the experiment with its
//! condition, its 1-based biological replicate number and its read files.
//! Technical replicate indices are never written in the CSV: rows sharing a
//! (condition, replicate) pair are the same library sequenced more than once,
//! and they receive technical indices 1..k in input order.

use crate::csv_parser::CsvParser;
use crate::errors::ConfigError;
use crate::keys::{ConditionKey, LibraryKey, ReplicateKey};
use anyhow::Result;
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const CONDITION_COL: &str = "condition";
const REPLICATE_COL: &str = "replicate";
const FASTQ_1_COL: &str = "fastq_1";
const FASTQ_2_COL: &str = "fastq_2";

/// Read files of one technical library.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub enum ReadFiles {
    Single(PathBuf),
    Paired(PathBuf, PathBuf),
}

impl ReadFiles {
    pub fn is_paired(&self) -> bool {
        matches!(self, ReadFiles::Paired(_, _))
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ReadFiles::Single(r1) => vec![r1],
            ReadFiles::Paired(r1, r2) => vec![r1, r2],
        }
    }
}

/// One design CSV row before technical index assignment. `line` is the
/// 1-based line number in the source file, used in error messages.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawDesignRow {
    pub condition: String,
    pub replicate: u32,
    pub fastq_1: PathBuf,
    pub fastq_2: Option<PathBuf>,
    pub line: usize,
}

/// One technical library with its resolved key.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct DesignRow {
    pub key: LibraryKey,
    pub reads: ReadFiles,
}

/// Shape predicates of the experiment, computed once during resolution and
/// immutable afterwards. Stage activation decisions read these.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct DesignShape {
    /// At least one condition has more than one biological replicate.
    pub replicates_exist: bool,
    /// The design names more than one condition.
    pub multiple_conditions: bool,
}

/// The resolved experiment design: every technical library with its key, in
/// input order, plus the shape predicates.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct DesignTable {
    rows: Vec<DesignRow>,
    shape: DesignShape,
    paired_end: bool,
}

fn validate_condition_name(condition: &str, line: usize) -> Result<(), ConfigError> {
    match condition
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(invalid) => Err(ConfigError::InvalidConditionName {
            condition: condition.to_string(),
            invalid,
            line,
        }),
        None => Ok(()),
    }
}

impl DesignTable {
    /// Load and resolve a design CSV with header
    /// `condition,replicate,fastq_1[,fastq_2]`.
    pub fn from_csv(path: &Path, paired_end: bool) -> Result<DesignTable> {
        let mut required = vec![CONDITION_COL, REPLICATE_COL, FASTQ_1_COL];
        if paired_end {
            required.push(FASTQ_2_COL);
        }
        let mut parser = CsvParser::new(path, required, "design")?;

        let mut raw = Vec::with_capacity(parser.len());
        for i in 0..parser.len() {
            parser.set_line(i);
            let condition = parser.require_string(CONDITION_COL)?;
            let replicate_field = parser.require_string(REPLICATE_COL)?;
            let replicate: u32 = replicate_field.parse().map_err(|_| {
                ConfigError::InvalidReplicate {
                    path: path.to_path_buf(),
                    line: parser.file_line(),
                    value: replicate_field.clone(),
                }
            })?;
            let fastq_1 = PathBuf::from(parser.require_string(FASTQ_1_COL)?);
            let fastq_2 = if parser.has_column(FASTQ_2_COL) {
                parser.try_get_string(FASTQ_2_COL).map(PathBuf::from)
            } else {
                None
            };
            raw.push(RawDesignRow {
                condition,
                replicate,
                fastq_1,
                fastq_2,
                line: parser.file_line(),
            });
        }

        DesignTable::resolve(raw, paired_end, path)
    }

    /// Resolve raw design rows into keyed libraries.
    ///
    /// Validates names, replicate numbers, read layout and file existence,
    /// assigns technical indices per (condition, replicate) group in input
    /// order, and computes the shape predicates.
    pub fn resolve(
        raw: Vec<RawDesignRow>,
        paired_end: bool,
        source: &Path,
    ) -> Result<DesignTable> {
        if raw.is_empty() {
            return Err(ConfigError::EmptyDesign {
                path: source.to_path_buf(),
            }
            .into());
        }

        let mut seen_files: HashMap<PathBuf, usize> = HashMap::new();
        let mut technical_counts: HashMap<(String, u32), u32> = HashMap::new();
        let mut rows = Vec::with_capacity(raw.len());

        for row in &raw {
            validate_condition_name(&row.condition, row.line)?;
            if row.replicate == 0 {
                return Err(ConfigError::InvalidReplicate {
                    path: source.to_path_buf(),
                    line: row.line,
                    value: row.replicate.to_string(),
                }
                .into());
            }

            let reads = match (paired_end, &row.fastq_2) {
                (true, Some(r2)) => ReadFiles::Paired(row.fastq_1.clone(), r2.clone()),
                (true, None) => {
                    return Err(ConfigError::MissingMateFile { line: row.line }.into());
                }
                (false, None) => ReadFiles::Single(row.fastq_1.clone()),
                (false, Some(_)) => {
                    return Err(ConfigError::UnexpectedMateFile { line: row.line }.into());
                }
            };

            for path in reads.paths() {
                if !path.exists() {
                    return Err(ConfigError::ReadFileMissing {
                        path: path.to_path_buf(),
                        line: row.line,
                    }
                    .into());
                }
                if let Some(&first_line) = seen_files.get(path) {
                    return Err(ConfigError::DuplicateReadFile {
                        path: path.to_path_buf(),
                        line: row.line,
                        first_line,
                    }
                    .into());
                }
                seen_files.insert(path.to_path_buf(), row.line);
            }

            let slot = technical_counts
                .entry((row.condition.clone(), row.replicate))
                .or_insert(0);
            *slot += 1;

            rows.push(DesignRow {
                key: LibraryKey {
                    condition: row.condition.clone(),
                    replicate: row.replicate,
                    technical: *slot,
                },
                reads,
            });
        }

        let replicates_exist = rows
            .iter()
            .map(|r| (&r.key.condition, r.key.replicate))
            .unique()
            .counts_by(|(condition, _)| condition.clone())
            .values()
            .any(|&n| n > 1);
        let multiple_conditions = rows.iter().map(|r| &r.key.condition).unique().count() > 1;

        Ok(DesignTable {
            rows,
            shape: DesignShape {
                replicates_exist,
                multiple_conditions,
            },
            paired_end,
        })
    }

    /// All technical libraries, in design input order.
    pub fn rows(&self) -> &[DesignRow] {
        &self.rows
    }

    pub fn shape(&self) -> DesignShape {
        self.shape
    }

    pub fn is_paired_end(&self) -> bool {
        self.paired_end
    }

    /// Libraries grouped per replicate, keyed in sorted order. Libraries
    /// within one group keep design input order.
    pub fn replicate_groups(&self) -> Vec<(ReplicateKey, Vec<&DesignRow>)> {
        let mut groups: BTreeMap<ReplicateKey, Vec<&DesignRow>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(row.key.replicate_key()).or_default().push(row);
        }
        groups.into_iter().collect()
    }

    /// Replicates grouped per condition, keys in sorted order.
    pub fn condition_groups(&self) -> Vec<(ConditionKey, Vec<ReplicateKey>)> {
        let mut groups: BTreeMap<ConditionKey, Vec<ReplicateKey>> = BTreeMap::new();
        for (replicate, _) in self.replicate_groups() {
            groups
                .entry(replicate.condition_key())
                .or_default()
                .push(replicate);
        }
        groups.into_iter().collect()
    }

    /// All unordered condition pairs, each pair and the sequence of pairs in
    /// sorted order. Differential analysis runs once per pair.
    pub fn comparison_pairs(&self) -> Vec<(ConditionKey, ConditionKey)> {
        self.condition_groups()
            .into_iter()
            .map(|(condition, _)| condition)
            .tuple_combinations()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap();
        path
    }

    fn raw(condition: &str, replicate: u32, fastq_1: &Path, line: usize) -> RawDesignRow {
        RawDesignRow {
            condition: condition.to_string(),
            replicate,
            fastq_1: fastq_1.to_path_buf(),
            fastq_2: None,
            line,
        }
    }

    fn config_err(err: &anyhow::Error) -> &ConfigError {
        err.downcast_ref::<ConfigError>().expect("ConfigError")
    }

    #[test]
    fn test_technical_indices_assigned_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");
        let b = touch(dir.path(), "b.fastq.gz");
        let c = touch(dir.path(), "c.fastq.gz");

        let table = DesignTable::resolve(
            vec![
                raw("WT", 1, &a, 2),
                raw("WT", 1, &b, 3),
                raw("WT", 2, &c, 4),
            ],
            false,
            Path::new("design.csv"),
        )
        .unwrap();

        let keys: Vec<String> = table.rows().iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["WT_R01_T01", "WT_R01_T02", "WT_R02_T01"]);
        assert_eq!(
            table.shape(),
            DesignShape {
                replicates_exist: true,
                multiple_conditions: false,
            }
        );
    }

    #[test]
    fn test_minimal_design_shape() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");

        let table =
            DesignTable::resolve(vec![raw("WT", 1, &a, 2)], false, Path::new("design.csv"))
                .unwrap();
        assert_eq!(
            table.shape(),
            DesignShape {
                replicates_exist: false,
                multiple_conditions: false,
            }
        );
    }

    #[test]
    fn test_noncontiguous_replicates_count_as_replicates() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");
        let b = touch(dir.path(), "b.fastq.gz");

        let table = DesignTable::resolve(
            vec![raw("KO", 1, &a, 2), raw("KO", 3, &b, 3)],
            false,
            Path::new("design.csv"),
        )
        .unwrap();
        assert!(table.shape().replicates_exist);
        assert!(!table.shape().multiple_conditions);
        let keys: Vec<String> = table.rows().iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["KO_R01_T01", "KO_R03_T01"]);
    }

    #[test]
    fn test_zero_replicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");

        let err = DesignTable::resolve(vec![raw("WT", 0, &a, 2)], false, Path::new("design.csv"))
            .unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::InvalidReplicate { line: 2, .. }
        ));
    }

    #[test]
    fn test_missing_read_file_rejected() {
        let err = DesignTable::resolve(
            vec![raw("WT", 1, Path::new("/no/such/reads.fastq.gz"), 2)],
            false,
            Path::new("design.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::ReadFileMissing { line: 2, .. }
        ));
    }

    #[test]
    fn test_empty_design_rejected() {
        let err =
            DesignTable::resolve(Vec::new(), false, Path::new("design.csv")).unwrap_err();
        assert!(matches!(config_err(&err), ConfigError::EmptyDesign { .. }));
    }

    #[test]
    fn test_duplicate_read_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");

        let err = DesignTable::resolve(
            vec![raw("WT", 1, &a, 2), raw("WT", 2, &a, 3)],
            false,
            Path::new("design.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::DuplicateReadFile {
                first_line: 2,
                line: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_condition_name_characters_checked() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");

        let err = DesignTable::resolve(
            vec![raw("WT stress", 1, &a, 2)],
            false,
            Path::new("design.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::InvalidConditionName { invalid: ' ', .. }
        ));
    }

    #[test]
    fn test_paired_end_requires_mate_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");

        let err = DesignTable::resolve(
            vec![raw("WT", 1, &a, 2)],
            true,
            Path::new("design.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::MissingMateFile { line: 2 }
        ));
    }

    #[test]
    fn test_single_end_rejects_mate_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");
        let b = touch(dir.path(), "b.fastq.gz");

        let mut row = raw("WT", 1, &a, 2);
        row.fastq_2 = Some(b);
        let err =
            DesignTable::resolve(vec![row], false, Path::new("design.csv")).unwrap_err();
        assert!(matches!(
            config_err(&err),
            ConfigError::UnexpectedMateFile { line: 2 }
        ));
    }

    #[test]
    fn test_from_csv_paired_end() {
        let dir = tempfile::tempdir().unwrap();
        let a1 = touch(dir.path(), "a_R1.fastq.gz");
        let a2 = touch(dir.path(), "a_R2.fastq.gz");
        let b1 = touch(dir.path(), "b_R1.fastq.gz");
        let b2 = touch(dir.path(), "b_R2.fastq.gz");

        let csv = dir.path().join("design.csv");
        std::fs::write(
            &csv,
            format!(
                "condition,replicate,fastq_1,fastq_2\n\
                 WT,1,{},{}\n\
                 KO,1,{},{}\n",
                a1.display(),
                a2.display(),
                b1.display(),
                b2.display()
            ),
        )
        .unwrap();

        let table = DesignTable::from_csv(&csv, true).unwrap();
        assert_eq!(table.rows().len(), 2);
        assert!(table.is_paired_end());
        assert!(table.rows()[0].reads.is_paired());
        assert_eq!(
            table.shape(),
            DesignShape {
                replicates_exist: false,
                multiple_conditions: true,
            }
        );
    }

    #[test]
    fn test_from_csv_rejects_missing_replicate_column() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("design.csv");
        std::fs::write(&csv, "condition,fastq_1\nWT,a.fastq.gz\n").unwrap();

        let err = DesignTable::from_csv(&csv, false).unwrap_err();
        assert!(err.to_string().contains("column named 'replicate'"));
    }

    #[test]
    fn test_from_csv_rejects_unparseable_replicate() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fastq.gz");
        let csv = dir.path().join("design.csv");
        std::fs::write(
            &csv,
            format!("condition,replicate,fastq_1\nWT,one,{}\n", a.display()),
        )
        .unwrap();

        let err = DesignTable::from_csv(&csv, false).unwrap_err();
        match config_err(&err) {
            ConfigError::InvalidReplicate { value, line, .. } => {
                assert_eq!(value, "one");
                assert_eq!(*line, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_groups_and_pairs_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..6)
            .map(|i| touch(dir.path(), &format!("f{i}.fastq.gz")))
            .collect();

        let table = DesignTable::resolve(
            vec![
                raw("ZEB", 1, &files[0], 2),
                raw("ALPHA", 2, &files[1], 3),
                raw("ALPHA", 1, &files[2], 4),
                raw("ALPHA", 1, &files[3], 5),
                raw("MID", 1, &files[4], 6),
                raw("ZEB", 2, &files[5], 7),
            ],
            false,
            Path::new("design.csv"),
        )
        .unwrap();

        let groups: Vec<String> = table
            .replicate_groups()
            .iter()
            .map(|(k, members)| format!("{k}:{}", members.len()))
            .collect();
        assert_eq!(
            groups,
            vec!["ALPHA_R01:2", "ALPHA_R02:1", "MID_R01:1", "ZEB_R01:1", "ZEB_R02:1"]
        );

        let pairs: Vec<String> = table
            .comparison_pairs()
            .iter()
            .map(|(a, b)| format!("{a}_vs_{b}"))
            .collect();
        assert_eq!(pairs, vec!["ALPHA_vs_MID", "ALPHA_vs_ZEB", "MID_vs_ZEB"]);
    }
}
