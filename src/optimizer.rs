//! Force field parameter optimization.
//!
//! The [`Gradient`] optimizer works on the weighted residual vector `r(p)`
//! returned by a [`ForceFieldEvaluator`]. The Jacobian is built by central
//! differences, each parameter displaced by its own step, and trial steps
//! solve
//!
//! ```text
//! (JᵀJ + λ·diag(JᵀJ)) δ = −Jᵀr
//! ```
//!
//! with `λ = 0` (Newton–Raphson) and a few Levenberg–Marquardt damping
//! factors. Steps are measured in units of the parameter steps and capped in
//! norm. The trial with the lowest score wins; when none improves on the
//! starting point the force field is returned unchanged.

use crate::datum::Datum;
use crate::forcefield::ForceField;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors raised during optimization.
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// Evaluating a force field failed
    #[error("Force field evaluation failed: {0}")]
    Evaluation(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Residual vectors of different force fields differ in length
    #[error("Residual count changed from {expected} to {found}")]
    ResidualCount {
        /// Residuals of the starting force field
        expected: usize,
        /// Residuals of the displaced force field
        found: usize,
    },
}

type Result<T> = std::result::Result<T, OptimizerError>;

/// Computes weighted residuals of a force field against reference data.
pub trait ForceFieldEvaluator {
    /// Residuals of `ff`; `ff_lines` are the raw lines of its file.
    fn residuals(
        &mut self,
        ff: &ForceField,
        ff_lines: &[String],
        reference: &[Datum],
    ) -> Result<Vec<f64>>;
}

/// Produces an improved force field.
pub trait ParameterOptimizer {
    /// Returns the optimized force field with its score attached.
    fn optimize(
        &mut self,
        ff: &ForceField,
        ff_lines: &[String],
        reference: &[Datum],
        evaluator: &mut dyn ForceFieldEvaluator,
    ) -> Result<ForceField>;
}

/// Newton–Raphson / Levenberg–Marquardt optimizer on central differences.
#[derive(Debug, Clone)]
pub struct Gradient {
    /// Largest step norm, in units of the parameter steps
    pub max_step: f64,
    /// Damping factors tried; 0 is the undamped step
    pub lambdas: Vec<f64>,
}

impl Default for Gradient {
    fn default() -> Self {
        Self {
            max_step: 5.0,
            lambdas: vec![0.0, 0.01, 0.1, 1.0],
        }
    }
}

fn score(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

impl Gradient {
    /// Jacobian of the residuals with respect to the scaled parameters.
    fn jacobian(
        &self,
        ff: &ForceField,
        ff_lines: &[String],
        reference: &[Datum],
        evaluator: &mut dyn ForceFieldEvaluator,
        n_residuals: usize,
    ) -> Result<DMatrix<f64>> {
        let values = ff.values();
        let mut jacobian = DMatrix::zeros(n_residuals, values.len());

        for (i, param) in ff.params.iter().enumerate() {
            let mut forward = values.clone();
            forward[i] += param.step;
            let mut backward = values.clone();
            backward[i] -= param.step;

            let r_forward = evaluator.residuals(&ff.with_values(&forward), ff_lines, reference)?;
            let r_backward = evaluator.residuals(&ff.with_values(&backward), ff_lines, reference)?;
            for r in [&r_forward, &r_backward] {
                if r.len() != n_residuals {
                    return Err(OptimizerError::ResidualCount {
                        expected: n_residuals,
                        found: r.len(),
                    });
                }
            }

            for k in 0..n_residuals {
                jacobian[(k, i)] = (r_forward[k] - r_backward[k]) / 2.0;
            }
            debug!(
                "Differentiated {} on line {} ({} residuals)",
                param.ptype, param.row, n_residuals
            );
        }

        Ok(jacobian)
    }

    /// Trial step in scaled parameters for a damping factor, capped in norm.
    fn trial_step(
        &self,
        jtj: &DMatrix<f64>,
        jtr: &DVector<f64>,
        lambda: f64,
    ) -> Option<DVector<f64>> {
        let mut a = jtj.clone();
        for i in 0..a.nrows() {
            a[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
        }
        let step = a.lu().solve(&-jtr)?;
        if step.iter().any(|x| !x.is_finite()) {
            return None;
        }

        let norm = step.norm();
        if norm > self.max_step {
            Some(step * (self.max_step / norm))
        } else {
            Some(step)
        }
    }
}

impl ParameterOptimizer for Gradient {
    fn optimize(
        &mut self,
        ff: &ForceField,
        ff_lines: &[String],
        reference: &[Datum],
        evaluator: &mut dyn ForceFieldEvaluator,
    ) -> Result<ForceField> {
        info!("{:-^50}", " Gradient ");
        let r0 = evaluator.residuals(ff, ff_lines, reference)?;
        let score0 = score(&r0);
        info!("Initial score: {:.6}", score0);

        let mut best = ff.clone();
        best.score = Some(score0);

        if ff.params.is_empty() {
            warn!("No active parameters; force field unchanged");
            return Ok(best);
        }

        let jacobian = self.jacobian(ff, ff_lines, reference, evaluator, r0.len())?;
        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let jtr = &jt * DVector::from_vec(r0);

        let values = ff.values();
        for &lambda in &self.lambdas {
            let Some(step) = self.trial_step(&jtj, &jtr, lambda) else {
                debug!("Step with lambda {} is singular", lambda);
                continue;
            };
            let trial_values: Vec<f64> = values
                .iter()
                .zip(&ff.params)
                .zip(step.iter())
                .map(|((value, param), delta)| value + delta * param.step)
                .collect();
            let mut trial = ff.with_values(&trial_values);
            let trial_score = score(&evaluator.residuals(&trial, ff_lines, reference)?);
            let method = if lambda == 0.0 { "NR" } else { "LM" };
            info!("{} (lambda {:>5}): score {:.6}", method, lambda, trial_score);

            if best.score.map_or(true, |s| trial_score < s) {
                trial.score = Some(trial_score);
                best = trial;
            }
        }

        match best.score {
            Some(s) if s < score0 => info!("Gradient improved score {:.6} -> {:.6}", score0, s),
            _ => info!("No trial step improved the score; force field unchanged"),
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forcefield::{Param, ParamType};

    fn two_params() -> ForceField {
        let param = |value: f64, row: usize| Param {
            ptype: ParamType::BondEq,
            value,
            row,
            column: 0,
            step: 0.1,
        };
        ForceField {
            path: None,
            params: vec![param(1.0, 1), param(2.0, 2)],
            score: None,
        }
    }

    /// Linear residuals with their minimum at (1.3, 1.8).
    struct Linear {
        calls: usize,
    }

    impl ForceFieldEvaluator for Linear {
        fn residuals(&mut self, ff: &ForceField, _: &[String], _: &[Datum]) -> Result<Vec<f64>> {
            self.calls += 1;
            let p = ff.values();
            Ok(vec![p[0] - 1.3, 2.0 * (p[1] - 1.8), p[0] + p[1] - 3.1])
        }
    }

    struct Flat;

    impl ForceFieldEvaluator for Flat {
        fn residuals(&mut self, _: &ForceField, _: &[String], _: &[Datum]) -> Result<Vec<f64>> {
            Ok(vec![1.0, 2.0])
        }
    }

    #[test]
    fn test_newton_step_reaches_minimum_of_linear_problem() {
        let mut evaluator = Linear { calls: 0 };
        let ff = Gradient::default()
            .optimize(&two_params(), &[], &[], &mut evaluator)
            .unwrap();

        let values = ff.values();
        assert!((values[0] - 1.3).abs() < 1e-8);
        assert!((values[1] - 1.8).abs() < 1e-8);
        assert!(ff.score.unwrap() < 1e-12);
        // Start, two displacements per parameter, one trial per lambda.
        assert_eq!(evaluator.calls, 1 + 4 + 4);
    }

    #[test]
    fn test_step_is_capped() {
        let optimizer = Gradient {
            max_step: 1.0,
            lambdas: vec![0.0],
        };
        let jtj = DMatrix::identity(2, 2);
        let jtr = DVector::from_vec(vec![-3.0, -4.0]);
        let step = optimizer.trial_step(&jtj, &jtr, 0.0).unwrap();
        assert!((step.norm() - 1.0).abs() < 1e-12);
        assert!((step[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_no_improvement_keeps_force_field() {
        let start = two_params();
        let ff = Gradient::default()
            .optimize(&start, &[], &[], &mut Flat)
            .unwrap();
        assert_eq!(ff.values(), start.values());
        assert_eq!(ff.score, Some(5.0));
    }
}
