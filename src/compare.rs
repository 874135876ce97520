//! Scoring of computed data against reference data.
//!
//! Both data sets are sorted by provenance and paired element by element:
//!
//! ```text
//! score = Σ (w · (reference − calculated))²
//! ```
//!
//! Energies are compared relative to the structure with the lowest reference
//! energy of their kind and group, so only energy differences matter.

use crate::datum::{DataKind, Datum};
use crate::settings::WeightSettings;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while comparing data sets.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompareError {
    /// Data sets differ in length
    #[error("Cannot compare {reference} reference records with {calculated} calculated records")]
    ShapeMismatch {
        /// Reference record count
        reference: usize,
        /// Calculated record count
        calculated: usize,
    },
    /// Paired records have different kinds
    #[error("Record {index}: reference kind '{reference}' paired with calculated kind '{calculated}'")]
    KindMismatch {
        /// 0-based position after sorting
        index: usize,
        /// Reference kind
        reference: DataKind,
        /// Calculated kind
        calculated: DataKind,
    },
}

type Result<T> = std::result::Result<T, CompareError>;

/// Scores agreement between reference and calculated records.
pub trait Comparator {
    /// Weighted residuals `w · (reference − calculated)` per record pair.
    fn residuals(&self, reference: &[Datum], calculated: &[Datum]) -> Result<Vec<f64>>;

    /// Scalar score; the sum of squared residuals.
    fn compare(&self, reference: &[Datum], calculated: &[Datum]) -> Result<f64> {
        Ok(self
            .residuals(reference, calculated)?
            .iter()
            .map(|r| r * r)
            .sum())
    }

    /// Formatted comparison table.
    fn report(&self, reference: &[Datum], calculated: &[Datum]) -> Result<Vec<String>>;
}

/// Default comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedComparator;

/// A reference record paired with its calculated counterpart, values made
/// comparable.
struct Pair<'a> {
    reference: &'a Datum,
    ref_value: f64,
    calc_value: f64,
    weight: f64,
}

impl WeightedComparator {
    fn pairs<'a>(&self, reference: &'a [Datum], calculated: &'a [Datum]) -> Result<Vec<Pair<'a>>> {
        if reference.len() != calculated.len() {
            return Err(CompareError::ShapeMismatch {
                reference: reference.len(),
                calculated: calculated.len(),
            });
        }
        let reference = sorted(reference);
        let calculated = sorted(calculated);

        for (index, (r, c)) in reference.iter().zip(&calculated).enumerate() {
            if r.kind != c.kind {
                return Err(CompareError::KindMismatch {
                    index,
                    reference: r.kind.clone(),
                    calculated: c.kind.clone(),
                });
            }
        }

        let mut ref_values: Vec<f64> = reference.iter().map(|d| d.value).collect();
        let mut calc_values: Vec<f64> = calculated.iter().map(|d| d.value).collect();
        make_energies_relative(&reference, &mut ref_values, &mut calc_values);

        Ok(reference
            .iter()
            .zip(&calculated)
            .zip(ref_values.into_iter().zip(calc_values))
            .map(|((r, c), (ref_value, calc_value))| Pair {
                reference: r,
                ref_value,
                calc_value,
                weight: r.weight.or(c.weight).unwrap_or(1.0),
            })
            .collect())
    }
}

impl Comparator for WeightedComparator {
    fn residuals(&self, reference: &[Datum], calculated: &[Datum]) -> Result<Vec<f64>> {
        Ok(self
            .pairs(reference, calculated)?
            .iter()
            .map(|p| p.weight * (p.ref_value - p.calc_value))
            .collect())
    }

    fn report(&self, reference: &[Datum], calculated: &[Datum]) -> Result<Vec<String>> {
        let pairs = self.pairs(reference, calculated)?;
        let mut lines = vec![format!(
            "{:<40} {:>10} {:>16} {:>16} {:>16}",
            "Label", "Weight", "Reference", "Calculated", "Contribution"
        )];
        lines.push("-".repeat(102));
        let mut total = 0.0;
        for p in &pairs {
            let contribution = (p.weight * (p.ref_value - p.calc_value)).powi(2);
            total += contribution;
            lines.push(format!(
                "{:<40} {:>10.4} {:>16.6} {:>16.6} {:>16.6}",
                p.reference.label(),
                p.weight,
                p.ref_value,
                p.calc_value,
                contribution
            ));
        }
        lines.push("-".repeat(102));
        lines.push(format!("{:<40} {:>10} {:>16} {:>16} {:>16.6}", "Total", "", "", "", total));
        Ok(lines)
    }
}

fn sorted(data: &[Datum]) -> Vec<&Datum> {
    let mut data: Vec<&Datum> = data.iter().collect();
    data.sort_by(|a, b| provenance_order(a, b));
    data
}

fn provenance_order(a: &Datum, b: &Datum) -> Ordering {
    a.kind
        .cmp(&b.kind)
        .then(a.group_index.cmp(&b.group_index))
        .then(a.structure_index.cmp(&b.structure_index))
        .then_with(|| a.atoms.cmp(&b.atoms))
}

/// Shifts energies of each (kind, group) so the structure with the lowest
/// reference energy is zero in both data sets.
fn make_energies_relative(reference: &[&Datum], ref_values: &mut [f64], calc_values: &mut [f64]) {
    let mut minima: HashMap<(&DataKind, Option<usize>), usize> = HashMap::new();
    for (i, datum) in reference.iter().enumerate() {
        if !datum.kind.is_energy() {
            continue;
        }
        minima
            .entry((&datum.kind, datum.group_index))
            .and_modify(|best| {
                if ref_values[i] < ref_values[*best] {
                    *best = i;
                }
            })
            .or_insert(i);
    }

    let zero: Vec<(usize, f64, f64)> = reference
        .iter()
        .enumerate()
        .filter(|(_, d)| d.kind.is_energy())
        .filter_map(|(i, d)| {
            minima
                .get(&(&d.kind, d.group_index))
                .map(|&m| (i, ref_values[m], calc_values[m]))
        })
        .collect();
    for (i, ref_zero, calc_zero) in zero {
        ref_values[i] -= ref_zero;
        calc_values[i] -= calc_zero;
    }
}

/// Assigns the configured default weight of its kind to every record.
///
/// Eigenmatrix elements on the diagonal (equal row and column) get the
/// diagonal weight.
pub fn apply_default_weights(data: &mut [Datum], weights: &WeightSettings) {
    for datum in data.iter_mut() {
        let diagonal = datum.atoms.len() == 2 && datum.atoms[0] == datum.atoms[1];
        datum.weight = Some(weights.for_kind(&datum.kind, diagonal));
    }
}
