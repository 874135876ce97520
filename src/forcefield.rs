//! MM3-style force field files.
//!
//! Only the parameters of selected substructures are read. A substructure
//! starts at a line beginning with `C ` and ends at the next such line or at
//! a line starting with `-3`. Within it, parameter rows are recognised by
//! their first column:
//!
//! | row | term | parameters |
//! |-----|------|------------|
//! | `1` | bond | `be`, `bf` |
//! | `2` | angle | `ae`, `af` |
//! | `4` | torsion | `df` (three) |
//!
//! Values occupy 10-character columns starting at column 23. The file's raw
//! lines are kept so writing only touches those columns.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const VALUE_START: usize = 23;
const VALUE_WIDTH: usize = 10;

/// Errors reading, writing or filtering force fields.
#[derive(Error, Debug)]
pub enum ForceFieldError {
    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// A line could not be interpreted
    #[error("{path}, line {line}: {message}")]
    Parse {
        /// File path
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Description of the problem
        message: String,
    },
    /// Parameter refers to a line the retained file does not have
    #[error("Parameter on line {0} is outside the force field file")]
    MissingLine(usize),
}

type Result<T> = std::result::Result<T, ForceFieldError>;

/// Parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    /// Equilibrium bond length
    BondEq,
    /// Bond force constant
    BondForce,
    /// Equilibrium angle
    AngleEq,
    /// Angle force constant
    AngleForce,
    /// Torsion barrier
    Dihedral,
}

impl ParamType {
    /// Short name used in parameter files.
    pub fn tag(&self) -> &'static str {
        match self {
            ParamType::BondEq => "be",
            ParamType::BondForce => "bf",
            ParamType::AngleEq => "ae",
            ParamType::AngleForce => "af",
            ParamType::Dihedral => "df",
        }
    }

    /// Default differentiation step.
    pub fn default_step(&self) -> f64 {
        match self {
            ParamType::AngleEq => 1.0,
            _ => 0.1,
        }
    }

    /// Physically allowed range.
    pub fn allowed_range(&self) -> (f64, f64) {
        match self {
            ParamType::BondEq | ParamType::BondForce | ParamType::AngleForce => {
                (0.0, f64::INFINITY)
            }
            ParamType::AngleEq => (0.0, 180.0),
            ParamType::Dihedral => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "be" => Ok(ParamType::BondEq),
            "bf" => Ok(ParamType::BondForce),
            "ae" => Ok(ParamType::AngleEq),
            "af" => Ok(ParamType::AngleForce),
            "df" => Ok(ParamType::Dihedral),
            other => Err(format!("unknown parameter type '{}'", other)),
        }
    }
}

/// One adjustable force field parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter type
    pub ptype: ParamType,
    /// Current value
    pub value: f64,
    /// 1-based line in the force field file
    pub row: usize,
    /// 0-based value column within the line
    pub column: usize,
    /// Differentiation step
    pub step: f64,
}

impl Param {
    /// Clamps a value into the allowed range of the parameter type.
    pub fn clamp(&self, value: f64) -> f64 {
        let (low, high) = self.ptype.allowed_range();
        value.clamp(low, high)
    }
}

/// A force field: active parameters and the score they achieved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ForceField {
    /// File the force field was read from
    pub path: Option<PathBuf>,
    /// Active parameters
    pub params: Vec<Param>,
    /// Score of these parameter values, once known
    pub score: Option<f64>,
}

impl ForceField {
    /// Reads a force field file, returning it with the file's raw lines.
    pub fn read(path: &Path, sub_names: &[String]) -> Result<(Self, Vec<String>)> {
        let content = fs::read_to_string(path).map_err(|source| ForceFieldError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut ff = Self::parse(&content, sub_names, path)?;
        ff.path = Some(path.to_path_buf());
        debug!("Read {} parameters from {}", ff.params.len(), path.display());
        if ff.params.is_empty() {
            warn!(
                "No parameters found in {} for substructures {:?}",
                path.display(),
                sub_names
            );
        }
        Ok((ff, content.lines().map(String::from).collect()))
    }

    /// Parses force field content. `origin` is used in error messages.
    pub fn parse(content: &str, sub_names: &[String], origin: &Path) -> Result<Self> {
        let mut params = Vec::new();
        let mut in_section = false;

        for (i, line) in content.lines().enumerate() {
            let row = i + 1;
            if line.starts_with("C ") {
                in_section = sub_names.iter().any(|name| line.contains(name.as_str()));
                continue;
            }
            if line.starts_with("-3") {
                in_section = false;
                continue;
            }
            if !in_section {
                continue;
            }

            let types: &[ParamType] = match line.get(..2).map(str::trim) {
                Some("1") => &[ParamType::BondEq, ParamType::BondForce],
                Some("2") => &[ParamType::AngleEq, ParamType::AngleForce],
                Some("4") => &[ParamType::Dihedral; 3],
                _ => continue,
            };
            for (column, &ptype) in types.iter().enumerate() {
                let field = value_field(line, column).ok_or_else(|| ForceFieldError::Parse {
                    path: origin.to_path_buf(),
                    line: row,
                    message: format!("missing {} column", ptype),
                })?;
                let value = field.trim().parse::<f64>().map_err(|_| ForceFieldError::Parse {
                    path: origin.to_path_buf(),
                    line: row,
                    message: format!("invalid {} value '{}'", ptype, field.trim()),
                })?;
                params.push(Param {
                    ptype,
                    value,
                    row,
                    column,
                    step: ptype.default_step(),
                });
            }
        }

        Ok(Self {
            path: None,
            params,
            score: None,
        })
    }

    /// Parameter values in order.
    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// Copy of this force field with new parameter values, clamped to their
    /// allowed ranges, and no score.
    pub fn with_values(&self, values: &[f64]) -> Self {
        let mut ff = self.clone();
        for (param, &value) in ff.params.iter_mut().zip(values) {
            param.value = param.clamp(value);
        }
        ff.score = None;
        ff
    }
}

fn value_field(line: &str, column: usize) -> Option<&str> {
    let start = VALUE_START + column * VALUE_WIDTH;
    let end = (start + VALUE_WIDTH).min(line.len());
    line.get(start..end).filter(|s| !s.trim().is_empty())
}

/// Writes parameter values into the retained lines and saves them to `path`.
pub fn export_ff(path: &Path, params: &[Param], lines: &[String]) -> Result<()> {
    let mut lines = lines.to_vec();
    for param in params {
        let line = param
            .row
            .checked_sub(1)
            .and_then(|i| lines.get_mut(i))
            .ok_or(ForceFieldError::MissingLine(param.row))?;
        let start = VALUE_START + param.column * VALUE_WIDTH;
        let mut chars: Vec<char> = line.chars().collect();
        if chars.len() < start + VALUE_WIDTH {
            chars.resize(start + VALUE_WIDTH, ' ');
        }
        let formatted = format!("{:10.4}", param.value);
        let formatted: Vec<char> = formatted.chars().collect();
        // Wide values keep their trailing digits.
        let field = &formatted[formatted.len().saturating_sub(VALUE_WIDTH)..];
        chars.splice(start..start + VALUE_WIDTH, field.iter().copied());
        *line = chars.into_iter().collect();
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).map_err(|source| ForceFieldError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote {} parameters to {}", params.len(), path.display());
    Ok(())
}

/// Keeps only the parameters listed in a parameter file.
///
/// Each line names a force field line number, optionally followed by the
/// parameter types to keep from it; a bare line number keeps every parameter
/// of that line. Text after `#` is ignored.
pub fn trim_params_by_file(params: Vec<Param>, path: &Path) -> Result<Vec<Param>> {
    let content = fs::read_to_string(path).map_err(|source| ForceFieldError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut wanted: Vec<(usize, Vec<ParamType>)> = Vec::new();
    for (i, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let parse_error = |message: String| ForceFieldError::Parse {
            path: path.to_path_buf(),
            line: i + 1,
            message,
        };
        let mut cols = line.split_whitespace();
        let row = cols
            .next()
            .unwrap_or("")
            .parse::<usize>()
            .map_err(|_| parse_error(format!("invalid line number in '{}'", line)))?;
        let types = cols
            .map(|c| c.parse::<ParamType>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(parse_error)?;
        wanted.push((row, types));
    }

    let before = params.len();
    let kept: Vec<Param> = params
        .into_iter()
        .filter(|p| {
            wanted
                .iter()
                .any(|(row, types)| *row == p.row && (types.is_empty() || types.contains(&p.ptype)))
        })
        .collect();
    debug!("Kept {} of {} parameters", kept.len(), before);
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FLD: &str = "\
 MM3* force field
C OPT Rh-diene
 1  C1  C2                 1.5000    4.4000
 2  C1  C2  C3           109.5000    0.5000
 4  C1  C2  C3  C4         0.1000   -0.2000    0.3000
C Other substructure
 1  C1  O1                 1.4300    5.0000
-3
";

    fn opt() -> Vec<String> {
        vec!["OPT".to_string()]
    }

    #[test]
    fn test_parse_selected_substructure() {
        let ff = ForceField::parse(FLD, &opt(), Path::new("mm3.fld")).unwrap();
        let types: Vec<&str> = ff.params.iter().map(|p| p.ptype.tag()).collect();
        assert_eq!(types, vec!["be", "bf", "ae", "af", "df", "df", "df"]);
        assert_eq!(ff.params[0].row, 3);
        assert_eq!(ff.params[2].value, 109.5);
        assert_eq!(ff.params[6].column, 2);
        assert_eq!(ff.params[5].value, -0.2);
    }

    #[test]
    fn test_export_rewrites_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mm3.fld");
        fs::write(&path, FLD).unwrap();

        let (ff, lines) = ForceField::read(&path, &opt()).unwrap();
        let mut values = ff.values();
        values[0] = 1.5234;
        values[4] = -1.25;
        let updated = ff.with_values(&values);
        export_ff(&path, &updated.params, &lines).unwrap();

        let (reread, new_lines) = ForceField::read(&path, &opt()).unwrap();
        assert_eq!(reread.values(), values);
        assert_eq!(new_lines.len(), lines.len());
        assert_eq!(new_lines[6], lines[6]);
        assert_eq!(new_lines[2], " 1  C1  C2                 1.5234    4.4000");
        assert_eq!(new_lines[4], " 4  C1  C2  C3  C4        -1.2500   -0.2000    0.3000");
    }

    #[test]
    fn test_with_values_clamps() {
        let ff = ForceField::parse(FLD, &opt(), Path::new("mm3.fld")).unwrap();
        let mut values = ff.values();
        values[1] = -3.0;
        values[2] = 200.0;
        let clamped = ff.with_values(&values);
        assert_eq!(clamped.params[1].value, 0.0);
        assert_eq!(clamped.params[2].value, 180.0);
    }

    #[test]
    fn test_trim_params_by_file() {
        let dir = TempDir::new().unwrap();
        let parm = dir.path().join("params.txt");
        fs::write(&parm, "# keep the bond force constant and every torsion\n3 bf\n5\n").unwrap();

        let ff = ForceField::parse(FLD, &opt(), Path::new("mm3.fld")).unwrap();
        let kept = trim_params_by_file(ff.params, &parm).unwrap();
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].ptype, ParamType::BondForce);
        assert!(kept[1..].iter().all(|p| p.ptype == ParamType::Dihedral));

        fs::write(&parm, "3 xx\n").unwrap();
        assert!(trim_params_by_file(Vec::new(), &parm).is_err());
    }

    #[test]
    fn test_malformed_value() {
        let fld = "C OPT\n 1  C1  C2                    abc    4.4000\n";
        assert!(matches!(
            ForceField::parse(fld, &opt(), Path::new("x.fld")),
            Err(ForceFieldError::Parse { line: 2, .. })
        ));
    }
}
