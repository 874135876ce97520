//! Reference data files.
//!
//! Reference files are plain text with one record per line:
//!
//! ```text
//! # label        weight   value
//! e_mol_1-1      20.0     0.0
//! b_mol_1_1-2    100.0    1.534   # C1-C2
//! ```
//!
//! Lines starting with `-` are skipped, everything after `#` is ignored, and
//! only lines with exactly three columns are read.

use crate::datum::{Datum, DatumError};
use log::debug;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading or writing reference files.
#[derive(Error, Debug)]
pub enum ReferenceError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Label could not be interpreted
    #[error("{path}:{line}: {source}")]
    Label {
        /// Reference file
        path: String,
        /// 1-based line number
        line: usize,
        /// Underlying label error
        source: DatumError,
    },
    /// Weight or value column is not a number
    #[error("{path}:{line}: {message}")]
    Parse {
        /// Reference file
        path: String,
        /// 1-based line number
        line: usize,
        /// Description of the problem
        message: String,
    },
}

type Result<T> = std::result::Result<T, ReferenceError>;

/// Reads all records from a reference file.
pub fn read_reference(path: &Path) -> Result<Vec<Datum>> {
    let content = fs::read_to_string(path)?;
    let data = parse_reference(&content, &path.display().to_string())?;
    debug!("Read {} reference records from {}", data.len(), path.display());
    Ok(data)
}

/// Parses reference file content. `origin` is only used in error messages.
pub fn parse_reference(content: &str, origin: &str) -> Result<Vec<Datum>> {
    let mut data = Vec::new();

    for (i, line) in content.lines().enumerate() {
        if line.starts_with('-') {
            continue;
        }
        let line = line.split('#').next().unwrap_or("");
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() != 3 {
            continue;
        }

        let weight = parse_number(cols[1], "weight", origin, i + 1)?;
        let value = parse_number(cols[2], "value", origin, i + 1)?;
        let datum =
            Datum::from_label(cols[0], weight, value).map_err(|source| ReferenceError::Label {
                path: origin.to_string(),
                line: i + 1,
                source,
            })?;
        data.push(datum);
    }

    Ok(data)
}

/// Writes records as a reference file.
pub fn write_reference(path: &Path, data: &[Datum]) -> Result<()> {
    let mut content = String::new();
    for datum in data {
        content.push_str(&format!(
            "{:<40} {:>12.4} {:>16.6}\n",
            datum.label(),
            datum.weight_or_default(),
            datum.value
        ));
    }
    fs::write(path, content)?;
    Ok(())
}

fn parse_number(token: &str, what: &str, origin: &str, line: usize) -> Result<f64> {
    token.parse::<f64>().map_err(|_| ReferenceError::Parse {
        path: origin.to_string(),
        line,
        message: format!("invalid {} '{}'", what, token),
    })
}
