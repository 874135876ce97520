//! Hessian eigenmatrix construction.
//!
//! Vibrational reference data is compared as the force-constant matrix
//! projected onto a set of normal modes:
//!
//! ```text
//! M = E · H · Eᵀ
//! ```
//!
//! where `H` is the Cartesian Hessian (3N × 3N) and the rows of `E` are the
//! normal-mode eigenvectors. When `E` diagonalizes `H` the result is diagonal
//! and holds the eigenvalues; projecting a force-field Hessian onto QM modes
//! gives a full matrix whose off-diagonal elements measure mode mixing.
//!
//! All matrices are in kJ/(mol·Å²), mass-weighted quantities in
//! kJ/(mol·Å²·amu).

use nalgebra::DMatrix;
use thiserror::Error;

/// Converts Hartree/Bohr² to kJ/(mol·Å²).
pub const HESSIAN_CONVERSION: f64 = 9375.829222;

/// Errors in Hessian transforms.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HessianError {
    /// Matrix dimensions do not agree
    #[error("Dimension mismatch: {0}")]
    Dimension(String),
    /// Required data is missing
    #[error("Missing data: {0}")]
    Missing(String),
}

type Result<T> = std::result::Result<T, HessianError>;

/// A force matrix together with the eigenvectors it is projected onto.
#[derive(Debug, Clone)]
pub struct Hessian {
    /// Force matrix; replaced by the eigenmatrix after [`Hessian::diagonalize`]
    pub hess: DMatrix<f64>,
    /// Eigenvectors, one per row
    pub evecs: Option<DMatrix<f64>>,
    /// Atomic masses in atom order
    pub masses: Vec<f64>,
}

impl Hessian {
    /// Creates a Hessian from a square force matrix.
    pub fn new(hess: DMatrix<f64>, evecs: Option<DMatrix<f64>>, masses: Vec<f64>) -> Result<Self> {
        if !hess.is_square() {
            return Err(HessianError::Dimension(format!(
                "force matrix is {}x{}",
                hess.nrows(),
                hess.ncols()
            )));
        }
        Ok(Self { hess, evecs, masses })
    }

    /// Masses repeated for the x, y and z coordinate of each atom.
    fn coordinate_masses(&self, len: usize) -> Result<Vec<f64>> {
        if self.masses.len() * 3 != len {
            return Err(HessianError::Dimension(format!(
                "{} masses for {} coordinates",
                self.masses.len(),
                len
            )));
        }
        if self.masses.iter().any(|&m| m <= 0.0) {
            return Err(HessianError::Missing("atomic mass".to_string()));
        }
        Ok(self.masses.iter().flat_map(|&m| [m, m, m]).collect())
    }

    /// Mass-weights the force matrix in place: `H_ij / sqrt(m_i m_j)`.
    pub fn mass_weight_hessian(&mut self) -> Result<()> {
        let masses = self.coordinate_masses(self.hess.nrows())?;
        let n = self.hess.nrows();
        for i in 0..n {
            for j in 0..n {
                self.hess[(i, j)] /= (masses[i] * masses[j]).sqrt();
            }
        }
        Ok(())
    }

    /// Mass-weights the eigenvectors in place.
    ///
    /// Each coordinate is scaled by the square root of its atom's mass and
    /// every eigenvector is renormalized.
    pub fn mass_weight_eigenvectors(&mut self) -> Result<()> {
        let ncols = match &self.evecs {
            Some(evecs) => evecs.ncols(),
            None => return Err(HessianError::Missing("eigenvectors".to_string())),
        };
        let masses = self.coordinate_masses(ncols)?;
        if let Some(evecs) = self.evecs.as_mut() {
            for mut row in evecs.row_iter_mut() {
                for (value, mass) in row.iter_mut().zip(&masses) {
                    *value *= mass.sqrt();
                }
                let norm = row.norm();
                if norm > 1e-12 {
                    row /= norm;
                }
            }
        }
        Ok(())
    }

    /// Replaces the force matrix with `E · H · Eᵀ`.
    pub fn diagonalize(&mut self) -> Result<()> {
        let evecs = self
            .evecs
            .as_ref()
            .ok_or_else(|| HessianError::Missing("eigenvectors".to_string()))?;
        if evecs.ncols() != self.hess.nrows() {
            return Err(HessianError::Dimension(format!(
                "eigenvectors have {} coordinates, force matrix has {}",
                evecs.ncols(),
                self.hess.nrows()
            )));
        }
        self.hess = evecs * &self.hess * evecs.transpose();
        Ok(())
    }

    /// Sets every off-diagonal element to zero.
    pub fn zero_off_diagonal(&mut self) {
        self.hess = DMatrix::from_diagonal(&self.hess.diagonal());
    }
}

/// Iterates over the lower triangle of a square matrix in row-major order,
/// yielding `(row, col, value)` with 0-based indices and `row >= col`.
pub fn lower_triangle(matrix: &DMatrix<f64>) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
    (0..matrix.nrows()).flat_map(move |i| (0..=i).map(move |j| (i, j, matrix[(i, j)])))
}

/// Builds a symmetric matrix from its lower triangle given in row-major
/// order. Returns `None` when the length is not a triangular number.
pub fn from_lower_triangle(values: &[f64]) -> Option<DMatrix<f64>> {
    let n = triangular_dimension(values.len())?;
    let mut matrix = DMatrix::zeros(n, n);
    let mut k = 0;
    for i in 0..n {
        for j in 0..=i {
            matrix[(i, j)] = values[k];
            matrix[(j, i)] = values[k];
            k += 1;
        }
    }
    Some(matrix)
}

fn triangular_dimension(len: usize) -> Option<usize> {
    let n = ((((8 * len + 1) as f64).sqrt() - 1.0) / 2.0).round() as usize;
    (n * (n + 1) / 2 == len).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::SymmetricEigen;

    #[test]
    fn test_lower_triangle_order() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 4.0, 2.0, 3.0, 5.0, 4.0, 5.0, 6.0]);
        let elements: Vec<_> = lower_triangle(&m).collect();
        assert_eq!(elements.len(), 6);
        assert_eq!(elements[0], (0, 0, 1.0));
        assert_eq!(elements[1], (1, 0, 2.0));
        assert_eq!(elements[2], (1, 1, 3.0));
        assert_eq!(elements[5], (2, 2, 6.0));
        assert!(elements.iter().all(|(i, j, _)| i >= j));
    }

    #[test]
    fn test_from_lower_triangle() {
        let m = from_lower_triangle(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m[(0, 2)], 4.0);
        assert_eq!(m[(2, 0)], 4.0);
        assert_eq!(m[(2, 1)], 5.0);
        assert!(from_lower_triangle(&[1.0, 2.0]).is_none());
        assert_eq!(from_lower_triangle(&[]).map(|m| m.nrows()), Some(0));
    }

    #[test]
    fn test_diagonalize_with_own_eigenvectors() {
        let h = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 5.0]);
        let eigen = SymmetricEigen::new(h.clone());
        let evecs = eigen.eigenvectors.transpose();

        let mut hess = Hessian::new(h, Some(evecs), vec![1.0]).unwrap();
        hess.diagonalize().unwrap();

        for i in 0..3 {
            for j in 0..3 {
                if i == j {
                    assert!((hess.hess[(i, i)] - eigen.eigenvalues[i]).abs() < 1e-10);
                } else {
                    assert!(hess.hess[(i, j)].abs() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn test_mass_weighting() {
        let h = DMatrix::from_element(3, 3, 4.0);
        let evecs = DMatrix::from_row_slice(1, 3, &[1.0, 0.0, 0.0]);
        let mut hess = Hessian::new(h, Some(evecs), vec![4.0]).unwrap();

        hess.mass_weight_hessian().unwrap();
        assert!((hess.hess[(0, 1)] - 1.0).abs() < 1e-12);

        hess.mass_weight_eigenvectors().unwrap();
        let evecs = hess.evecs.as_ref().unwrap();
        assert!((evecs.row(0).norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dimension_errors() {
        assert!(Hessian::new(DMatrix::zeros(2, 3), None, vec![]).is_err());

        let mut hess = Hessian::new(DMatrix::zeros(6, 6), None, vec![1.0]).unwrap();
        assert!(hess.mass_weight_hessian().is_err());
        assert!(hess.diagonalize().is_err());

        hess.evecs = Some(DMatrix::zeros(6, 3));
        assert!(matches!(hess.diagonalize(), Err(HessianError::Dimension(_))));
    }

    #[test]
    fn test_zero_off_diagonal() {
        let mut hess =
            Hessian::new(DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 3.0]), None, vec![])
                .unwrap();
        hess.zero_off_diagonal();
        assert_eq!(hess.hess, DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 3.0]));
    }
}
