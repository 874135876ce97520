//! Canonical data records.
//!
//! Every observation extracted from a reference file or an external program
//! output ends up as a [`Datum`]. A datum carries the observed value together
//! with enough provenance (kind, source files, group, structure and atom
//! indices) to be matched against the correspondingly shaped record of the
//! other data set during comparison.
//!
//! # Labels
//!
//! Reference files identify records by label. A label has the form
//!
//! ```text
//! kind_source_indices
//! kind_source_indices_atoms
//! ```
//!
//! where `indices` is `group` or `group-structure` and `atoms` is a
//! hyphen-joined list of atom numbers, e.g. `b_1_3-5` or `q_1_1_6`.

use crate::command::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Error raised when a record label cannot be interpreted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatumError {
    /// Label does not split into 3 or 4 underscore-separated parts, or an
    /// index part is not an integer
    #[error("Malformed label '{label}': {reason}")]
    MalformedLabel {
        /// The offending label
        label: String,
        /// What was wrong with it
        reason: String,
    },
}

type Result<T> = std::result::Result<T, DatumError>;

/// Datatype tag of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    /// Energy of a structure as given
    Energy,
    /// Energy after force-field geometry optimization
    EnergyOpt,
    /// Bond length
    Bond,
    /// Bond angle
    Angle,
    /// Torsion angle
    Torsion,
    /// Atomic partial charge
    Charge,
    /// Element of a (transformed) Hessian eigenmatrix
    Eigen,
    /// Any tag not known to this crate
    Other(String),
}

impl DataKind {
    /// Parses a short datatype tag. Unknown tags are kept as [`DataKind::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "e" => DataKind::Energy,
            "eo" => DataKind::EnergyOpt,
            "b" => DataKind::Bond,
            "a" => DataKind::Angle,
            "t" => DataKind::Torsion,
            "q" => DataKind::Charge,
            "eig" => DataKind::Eigen,
            other => DataKind::Other(other.to_string()),
        }
    }

    /// Short tag used in labels and reports.
    pub fn tag(&self) -> &str {
        match self {
            DataKind::Energy => "e",
            DataKind::EnergyOpt => "eo",
            DataKind::Bond => "b",
            DataKind::Angle => "a",
            DataKind::Torsion => "t",
            DataKind::Charge => "q",
            DataKind::Eigen => "eig",
            DataKind::Other(tag) => tag,
        }
    }

    /// Whether records of this kind are compared as relative energies.
    pub fn is_energy(&self) -> bool {
        matches!(self, DataKind::Energy | DataKind::EnergyOpt)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One provenance-tagged observation.
///
/// Records are built once by the reference loader or the dispatch engine and
/// are not modified afterwards, apart from weight assignment before
/// comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Observed value
    pub value: f64,
    /// Datatype tag
    pub kind: DataKind,
    /// Datatype command that produced the record, if any
    pub command: Option<Command>,
    /// Comparison weight; the comparator treats `None` as 1
    pub weight: Option<f64>,
    /// Label as read from a reference file
    pub label: Option<String>,
    /// Primary source file
    pub source_1: Option<String>,
    /// Secondary source file for quantities derived from two files
    pub source_2: Option<String>,
    /// 1-based position of the file group within its command
    pub group_index: Option<usize>,
    /// 1-based structure index within the source file
    pub structure_index: Option<usize>,
    /// 1-based atom numbers (or matrix row/column for eigen data)
    pub atoms: Vec<usize>,
}

impl Datum {
    /// Creates a record with a value and kind and no provenance.
    pub fn new(value: f64, kind: DataKind) -> Self {
        Self {
            value,
            kind,
            command: None,
            weight: None,
            label: None,
            source_1: None,
            source_2: None,
            group_index: None,
            structure_index: None,
            atoms: Vec::new(),
        }
    }

    /// Builds a record from a reference label, weight and value.
    ///
    /// # Examples
    ///
    /// ```
    /// use qmff::datum::{DataKind, Datum};
    ///
    /// let datum = Datum::from_label("q_1_1_6", 1.0, -0.3).unwrap();
    /// assert_eq!(datum.kind, DataKind::Charge);
    /// assert_eq!(datum.group_index, Some(1));
    /// assert_eq!(datum.atom_index_1(), Some(6));
    /// ```
    pub fn from_label(label: &str, weight: f64, value: f64) -> Result<Self> {
        let parts: Vec<&str> = label.split('_').collect();
        let (indices, atoms) = match parts.len() {
            3 => (parts[2], None),
            4 => (parts[2], Some(parts[3])),
            n => {
                return Err(malformed(
                    label,
                    &format!("expected 3 or 4 underscore-separated parts, found {}", n),
                ))
            }
        };

        let indices = parse_hyphenated(label, indices)?;
        if indices.is_empty() || indices.len() > 2 {
            return Err(malformed(label, "expected one or two indices"));
        }

        let mut datum = Datum::new(value, DataKind::from_tag(parts[0]));
        datum.weight = Some(weight);
        datum.label = Some(label.to_string());
        datum.group_index = Some(indices[0]);
        datum.structure_index = indices.get(1).copied();
        if let Some(atoms) = atoms {
            datum.atoms = parse_hyphenated(label, atoms)?;
        }
        Ok(datum)
    }

    /// Sets the primary source file.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_1 = Some(source.into());
        self
    }

    /// Sets the datatype command.
    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    /// Sets the group and structure indices.
    pub fn with_indices(mut self, group: Option<usize>, structure: Option<usize>) -> Self {
        self.group_index = group;
        self.structure_index = structure;
        self
    }

    /// Sets the atom numbers.
    pub fn with_atoms(mut self, atoms: Vec<usize>) -> Self {
        self.atoms = atoms;
        self
    }

    /// First atom number, if any.
    pub fn atom_index_1(&self) -> Option<usize> {
        self.atoms.first().copied()
    }

    /// Second atom number, if any.
    pub fn atom_index_2(&self) -> Option<usize> {
        self.atoms.get(1).copied()
    }

    /// Returns the label of this record.
    ///
    /// Records read from reference files keep their original label. Other
    /// records get a label rendered from their provenance which parses back
    /// into the same kind, indices and atoms.
    pub fn label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }

        let source = self
            .source_1
            .as_deref()
            .and_then(|s| Path::new(s).file_stem())
            .map(|s| s.to_string_lossy().replace('_', "-"))
            .unwrap_or_else(|| "x".to_string());

        let mut label = format!(
            "{}_{}_{}",
            self.kind.tag(),
            source,
            self.group_index.unwrap_or(1)
        );
        if let Some(structure) = self.structure_index {
            label.push_str(&format!("-{}", structure));
        }
        if !self.atoms.is_empty() {
            let atoms: Vec<String> = self.atoms.iter().map(|a| a.to_string()).collect();
            label.push('_');
            label.push_str(&atoms.join("-"));
        }
        label
    }

    /// Weight used in comparison when none was assigned.
    pub fn weight_or_default(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

fn parse_hyphenated(label: &str, field: &str) -> Result<Vec<usize>> {
    field
        .split('-')
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|_| malformed(label, &format!("'{}' is not an index", token)))
        })
        .collect()
}

fn malformed(label: &str, reason: &str) -> DatumError {
    DatumError::MalformedLabel {
        label: label.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_part_label() {
        let datum = Datum::from_label("b_1_3-5", 1.0, 1.534).unwrap();
        assert_eq!(datum.kind, DataKind::Bond);
        assert_eq!(datum.group_index, Some(3));
        assert_eq!(datum.structure_index, Some(5));
        assert!(datum.atoms.is_empty());
    }

    #[test]
    fn test_four_part_label() {
        let datum = Datum::from_label("t_mol_2_1-2-3-4", 0.5, 60.0).unwrap();
        assert_eq!(datum.kind, DataKind::Torsion);
        assert_eq!(datum.group_index, Some(2));
        assert_eq!(datum.structure_index, None);
        assert_eq!(datum.atoms, vec![1, 2, 3, 4]);
        assert_eq!(datum.weight, Some(0.5));
    }

    #[test]
    fn test_malformed_labels() {
        assert!(Datum::from_label("e_1", 1.0, 0.0).is_err());
        assert!(Datum::from_label("e_a_b_c_d", 1.0, 0.0).is_err());
        assert!(Datum::from_label("e_a_x", 1.0, 0.0).is_err());
        assert!(Datum::from_label("e_a_1-2-3", 1.0, 0.0).is_err());
    }

    #[test]
    fn test_rendered_label_parses_back() {
        let datum = Datum::new(-0.18, DataKind::Charge)
            .with_source("my_mol.mae")
            .with_indices(Some(2), Some(1))
            .with_atoms(vec![6]);
        let label = datum.label();
        assert_eq!(label, "q_my-mol_2-1_6");

        let parsed = Datum::from_label(&label, 1.0, -0.18).unwrap();
        assert_eq!(parsed.kind, datum.kind);
        assert_eq!(parsed.group_index, datum.group_index);
        assert_eq!(parsed.structure_index, datum.structure_index);
        assert_eq!(parsed.atoms, datum.atoms);
    }

    #[test]
    fn test_unknown_kind_is_kept() {
        let datum = Datum::from_label("xyz_a_1", 1.0, 2.0).unwrap();
        assert_eq!(datum.kind, DataKind::Other("xyz".to_string()));
        assert_eq!(datum.kind.tag(), "xyz");
    }
}
