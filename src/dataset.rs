// src/dataset.rs

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;

use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{FactorError, Result};

/// Subjects (rows) by named numeric variables (columns).
///
/// Every cell is finite and there are at least two subjects, so the
/// downstream steps never have to deal with missing values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    names: Vec<String>,
    /// Shape: (n_subjects, n_variables)
    data: Array2<f64>,
}

impl Dataset {
    /// Builds a dataset from column names and a (n_subjects, n_variables) matrix.
    ///
    /// # Errors
    /// Returns `InvalidData` if the names do not match the column count, are
    /// empty or duplicated, if fewer than 2 subjects are present, or if any
    /// cell is NaN or infinite.
    pub fn new(names: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if names.len() != data.ncols() {
            return Err(FactorError::InvalidData(format!(
                "{} variable names given for {} columns",
                names.len(),
                data.ncols()
            )));
        }
        if data.ncols() == 0 {
            return Err(FactorError::InvalidData("dataset has no variables".to_string()));
        }
        if data.nrows() < 2 {
            return Err(FactorError::InvalidData(format!(
                "dataset needs at least 2 subjects, got {}",
                data.nrows()
            )));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if name.is_empty() {
                return Err(FactorError::InvalidData("empty variable name".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(FactorError::InvalidData(format!(
                    "duplicate variable name '{}'",
                    name
                )));
            }
        }
        if let Some(((row, col), _)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(FactorError::InvalidData(format!(
                "non-finite value at subject {} variable '{}'",
                row, names[col]
            )));
        }
        Ok(Self { names, data })
    }

    /// Parses whitespace-delimited text: a header row of variable names,
    /// then one row of numbers per subject.
    ///
    /// Blank lines and lines starting with `#` are skipped. When the header
    /// has exactly one token fewer than the data rows, the first token of
    /// each data row is taken as a row label and dropped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut header: Option<Vec<String>> = None;
        let mut has_row_labels: Option<bool> = None;
        let mut values: Vec<f64> = Vec::new();
        let mut n_rows = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let tokens: Vec<&str> = trimmed.split_whitespace().collect();

            let names = match &header {
                None => {
                    let names: Vec<String> = tokens.iter().map(|t| unquote(t).to_string()).collect();
                    let mut seen = HashSet::with_capacity(names.len());
                    if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
                        return Err(FactorError::parse(
                            line_no,
                            format!("duplicate variable name '{}'", dup),
                        ));
                    }
                    header = Some(names);
                    continue;
                }
                Some(names) => names,
            };

            let labelled = match has_row_labels {
                Some(flag) => flag,
                None => {
                    let flag = if tokens.len() == names.len() {
                        false
                    } else if tokens.len() == names.len() + 1 {
                        true
                    } else {
                        return Err(FactorError::parse(
                            line_no,
                            format!("expected {} fields, found {}", names.len(), tokens.len()),
                        ));
                    };
                    has_row_labels = Some(flag);
                    flag
                }
            };

            let fields = if labelled { &tokens[1..] } else { &tokens[..] };
            if fields.len() != names.len() {
                return Err(FactorError::parse(
                    line_no,
                    format!("expected {} fields, found {}", names.len(), fields.len()),
                ));
            }
            for (col, field) in fields.iter().enumerate() {
                let value = parse_cell(field).ok_or_else(|| {
                    FactorError::parse(
                        line_no,
                        format!("value '{}' for '{}' is not numeric", field, names[col]),
                    )
                })?;
                values.push(value);
            }
            n_rows += 1;
        }

        let names = header.ok_or_else(|| FactorError::parse(1, "input is empty"))?;
        if n_rows < 2 {
            return Err(FactorError::parse(
                n_rows + 1,
                format!("dataset needs at least 2 subjects, got {}", n_rows),
            ));
        }
        let data = Array2::from_shape_vec((n_rows, names.len()), values)
            .map_err(|e| FactorError::InvalidData(e.to_string()))?;
        debug!(
            "Parsed {} subjects x {} variables (row labels: {}).",
            n_rows,
            names.len(),
            has_row_labels.unwrap_or(false)
        );
        Self::new(names, data)
    }

    /// Reads a dataset from a local file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let dataset = Self::from_reader(BufReader::new(file))?;
        info!(
            "Loaded dataset from {}: {} subjects x {} variables.",
            path.as_ref().display(),
            dataset.n_subjects(),
            dataset.n_variables()
        );
        Ok(dataset)
    }

    /// Downloads and parses a dataset with a single blocking GET.
    ///
    /// Network failures and non-success status codes abort immediately.
    pub fn fetch(url: &str) -> Result<Self> {
        info!("Fetching dataset from {}", url);
        let response = reqwest::blocking::get(url)?.error_for_status()?;
        let body = response.text()?;
        let dataset = Self::from_reader(Cursor::new(body))?;
        info!(
            "Fetched dataset: {} subjects x {} variables.",
            dataset.n_subjects(),
            dataset.n_variables()
        );
        Ok(dataset)
    }

    /// Keeps only the named columns, in the given order.
    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|c| {
                self.index_of(c.as_ref()).ok_or_else(|| {
                    FactorError::InvalidData(format!("unknown variable '{}'", c.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let names = indices.iter().map(|&i| self.names[i].clone()).collect();
        let data = self.data.select(Axis(1), &indices);
        Self::new(names, data)
    }

    /// Removes the named columns (e.g. subject identifiers or demographics).
    pub fn drop_columns<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self> {
        for c in columns {
            if self.index_of(c.as_ref()).is_none() {
                return Err(FactorError::InvalidData(format!(
                    "unknown variable '{}'",
                    c.as_ref()
                )));
            }
        }
        let keep: Vec<&str> = self
            .names
            .iter()
            .map(String::as_str)
            .filter(|n| !columns.iter().any(|c| c.as_ref() == *n))
            .collect();
        self.select(&keep)
    }

    /// Column position of a variable.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Number of rows.
    pub fn n_subjects(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns.
    pub fn n_variables(&self) -> usize {
        self.data.ncols()
    }

    /// Variable names, in column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The raw values, shape (n_subjects, n_variables).
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Values of one variable, or `None` if no column has that name.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.index_of(name).map(|i| self.data.column(i))
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Array2<f64>) {
        (self.names, self.data)
    }
}

fn unquote(token: &str) -> &str {
    token.trim_matches('"')
}

fn parse_cell(token: &str) -> Option<f64> {
    let value: f64 = unquote(token).parse().ok()?;
    value.is_finite().then_some(value)
}
