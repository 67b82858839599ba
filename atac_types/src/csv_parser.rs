use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Helper class for parsing configuration CSV files, validating them & providing good error messages
pub struct CsvParser {
    filetype: String,
    filename: PathBuf,
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    col_map: HashMap<String, usize>,
    line: usize,
}

impl CsvParser {
    /// Create a CSV parser / validator for file `filename`. `required_headers` are checked and an error will be
    /// returned if they're not present. `filetype` is a readable description of the kind of CSV file being parsed and
    /// will be used in error messages.
    pub fn new<T: AsRef<str>>(
        filename: &Path,
        required_headers: impl IntoIterator<Item = T>,
        filetype: &str,
    ) -> Result<CsvParser> {
        let file = File::open(filename).with_context(|| filename.display().to_string())?;
        let buf_rdr = BufReader::new(file);
        let mut rdr = csv::Reader::from_reader(buf_rdr);

        let mut headers = rdr.headers()?.clone();
        headers.trim();
        let headers: Vec<_> = headers.iter().map(String::from).collect();

        let mut rows = Vec::new();
        for result in rdr.records() {
            let mut record = result.with_context(|| {
                format!(
                    "Error reading {filetype} file '{}'",
                    filename.display()
                )
            })?;
            record.trim();
            rows.push(record);
        }

        let col_map = CsvParser::check_headers(filename, required_headers, &headers)?;

        Ok(CsvParser {
            filetype: filetype.to_string(),
            filename: filename.to_path_buf(),
            headers,
            rows,
            col_map,
            line: 0,
        })
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// File name
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Headers found in CSV
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, col: &str) -> bool {
        self.col_map.contains_key(col)
    }

    /// Set the data row (not including the header) to pull fields from
    pub fn set_line(&mut self, line: usize) {
        self.line = line;
    }

    /// 1-based line number of the current row in the file, counting the header
    pub fn file_line(&self) -> usize {
        self.line + 2
    }

    /// Get a value of type `T` from column `col` on the current line.
    /// Returns an error if the contents of the csv cannot be parsed as `T`.
    /// Panics if the column doesn't exist. Returns Ok(None) for an empty field.
    pub fn try_parse_field<T>(&self, col: &str, expected: &str) -> Result<Option<T>>
    where
        T: FromStr,
        Result<T, <T as FromStr>::Err>: anyhow::Context<T, <T as FromStr>::Err>,
    {
        let i = self.col_map[col];
        let v = self.rows[self.line][i].trim();
        if v.is_empty() {
            return Ok(None);
        }

        Ok(Some(v.parse::<T>().with_context(|| {
            format!(
                "Error in {} file '{}'. On line {} in '{col}' column: \
                 Expected a {expected} but received '{v}'",
                self.filetype,
                self.filename.display(),
                self.file_line()
            )
        })?))
    }

    /// Get a value of type `T` from column `col` on the current line.
    /// Returns an error on an empty field or one that cannot be parsed as `T`.
    /// Panics if the column doesn't exist.
    pub fn parse_field<T>(&self, col: &str, expected: &str) -> Result<T>
    where
        T: FromStr,
        Result<T, <T as FromStr>::Err>: anyhow::Context<T, <T as FromStr>::Err>,
    {
        match self.try_parse_field(col, expected) {
            Err(e) => Err(e),
            Ok(Some(v)) => Ok(v),
            Ok(None) => {
                bail!(
                    "Error in {} file '{}'. On line {} in '{col}' column: \
                     Expected a {expected}, but got empty value",
                    self.filetype,
                    self.filename.display(),
                    self.file_line(),
                );
            }
        }
    }

    /// Get a string from column `col` on the current line.
    /// Returns an error on an empty string, Panics if column doesn't exist
    pub fn require_string(&self, col: &str) -> Result<String> {
        self.try_get_string(col).ok_or_else(|| {
            anyhow!(
                "Error in {} file '{}'. On line {} in '{col}' column: \
                 Value required but cell is empty.",
                self.filetype,
                self.filename.display(),
                self.file_line(),
            )
        })
    }

    /// Get a string from column `col` on the current line.
    /// Returns None for an empty string, Panics if column doesn't exist
    pub fn try_get_string(&self, col: &str) -> Option<String> {
        let col = self.col_map[col];

        let val = self.rows[self.line][col].trim().to_string();

        if val.as_str() == "" {
            None
        } else {
            Some(val)
        }
    }

    fn check_headers<T: AsRef<str>>(
        file_arg: &Path,
        required: impl IntoIterator<Item = T>,
        headers: &[String],
    ) -> Result<HashMap<String, usize>> {
        // column name to column index map
        let mut result = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            if result.insert(h.to_string(), i).is_some() {
                bail!(
                    "The input file '{}' contains the column '{h}' more than once. \
                     Please check the headers in the CSV file.",
                    file_arg.display(),
                );
            }
        }

        // check that we have required headers
        for r in required {
            if !headers.contains(&r.as_ref().into()) {
                bail!(
                    "The input file '{}' must contain a column named '{}', but it was not found. \
                    Please check the headers in the CSV file.",
                    file_arg.display(),
                    r.as_ref()
                );
            }
        }

        Ok(result)
    }
}
