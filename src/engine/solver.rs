//! Root-finder for the coupled unmixing system at one mesh point.
//!
//! For a raw coordinate `p`, find `t` such that for every channel `c`
//!
//! ```text
//! p[c] = t[c] + Σ_{f≠c} spline[f][c](t[f])
//! ```
//!
//! The splines are piecewise linear, so the Jacobian is exact and cheap:
//! ones on the diagonal, spline slopes elsewhere. A damped Newton iteration
//! starting at `t₀ = p` converges in a handful of steps for realistic
//! spillover.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::spline::SplineModel;

/// Jacobians closer to singular than this are rejected: the step they
/// produce is dominated by rounding.
const MIN_RCOND: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverParams {
    /// Maximum Newton iterations (default 100).
    pub max_iterations: usize,
    /// Max-norm residual threshold, relative to `1 + |p|∞` (default 1e-10).
    pub tolerance: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

/// Why a mesh point has no corrected value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveFailure {
    #[error("did not converge after {iterations} iterations (residual={residual:.3e})")]
    DidNotConverge { iterations: usize, residual: f64 },

    #[error("singular Jacobian")]
    Singular,

    #[error("iterate became non-finite")]
    NonFinite,

    #[error("solution magnitude {magnitude:.3e} is far outside the mesh")]
    Diverged { magnitude: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub t: Vec<f64>,
    pub iterations: usize,
}

/// The unmixing equations for one fitted spline model.
#[derive(Debug, Clone, Copy)]
pub struct UnmixingSystem<'a> {
    splines: &'a SplineModel,
}

impl<'a> UnmixingSystem<'a> {
    pub fn new(splines: &'a SplineModel) -> Self {
        Self { splines }
    }

    pub fn dims(&self) -> usize {
        self.splines.channels().len()
    }

    /// `out[c] = t[c] + Σ spline[f][c](t[f]) − p[c]`
    pub fn residual(&self, t: &[f64], p: &[f64], out: &mut [f64]) {
        let k = self.dims();
        for c in 0..k {
            let mut acc = t[c] - p[c];
            for f in 0..k {
                if let Some(s) = self.splines.at(f, c) {
                    acc += s.eval(t[f]);
                }
            }
            out[c] = acc;
        }
    }

    fn jacobian(&self, t: &[f64]) -> DMatrix<f64> {
        let k = self.dims();
        DMatrix::from_fn(k, k, |c, f| match self.splines.at(f, c) {
            Some(s) => s.slope(t[f]),
            None => 1.0,
        })
    }

    /// Solve for the corrected vector behind raw coordinate `p`.
    pub fn solve(&self, p: &[f64], params: &SolverParams) -> Result<Solution, SolveFailure> {
        let k = self.dims();
        debug_assert_eq!(p.len(), k);

        let scale = 1.0 + p.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let tol = params.tolerance * scale;

        let mut t = p.to_vec();
        let mut r = vec![0.0; k];
        let mut trial = vec![0.0; k];
        let mut trial_r = vec![0.0; k];

        self.residual(&t, p, &mut r);
        let mut norm = max_abs(&r);

        for iter in 0..params.max_iterations {
            if !norm.is_finite() {
                return Err(SolveFailure::NonFinite);
            }
            if norm <= tol {
                return Ok(Solution {
                    t,
                    iterations: iter,
                });
            }

            let jac = self.jacobian(&t);
            if reciprocal_condition(&jac) < MIN_RCOND {
                return Err(SolveFailure::Singular);
            }
            let rhs = DVector::from_iterator(k, r.iter().map(|v| -v));
            let step = jac.lu().solve(&rhs).ok_or(SolveFailure::Singular)?;

            // halve the step until the residual drops
            let mut lambda = 1.0;
            loop {
                for i in 0..k {
                    trial[i] = t[i] + lambda * step[i];
                }
                self.residual(&trial, p, &mut trial_r);
                let trial_norm = max_abs(&trial_r);
                if trial_norm < norm || lambda < 1e-6 {
                    std::mem::swap(&mut t, &mut trial);
                    std::mem::swap(&mut r, &mut trial_r);
                    norm = trial_norm;
                    break;
                }
                lambda *= 0.5;
            }
        }

        if norm.is_finite() && norm <= tol {
            Ok(Solution {
                t,
                iterations: params.max_iterations,
            })
        } else if norm.is_finite() {
            Err(SolveFailure::DidNotConverge {
                iterations: params.max_iterations,
                residual: norm,
            })
        } else {
            Err(SolveFailure::NonFinite)
        }
    }
}

/// Ratio of smallest to largest singular value; 0 for a zero matrix.
fn reciprocal_condition(m: &DMatrix<f64>) -> f64 {
    let sv = m.singular_values();
    let (lo, hi) = (sv.min(), sv.max());
    if hi > 0.0 { lo / hi } else { 0.0 }
}

#[inline]
pub(crate) fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::engine::spline::LinearSpline;
    use approx::assert_relative_eq;

    fn line(slope: f64) -> LinearSpline {
        LinearSpline::from_parts(vec![0.0, 1000.0], vec![0.0, 1000.0 * slope]).unwrap()
    }

    fn model(names: &[&str], slope: impl Fn(usize, usize) -> LinearSpline) -> SplineModel {
        let channels: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut pairs = BTreeMap::new();
        for (f, from) in channels.iter().enumerate() {
            for (t, to) in channels.iter().enumerate() {
                if f != t {
                    pairs.insert((from.clone(), to.clone()), slope(f, t));
                }
            }
        }
        SplineModel::from_pairs(&channels, pairs).unwrap()
    }

    #[test]
    fn symmetric_linear_pair_matches_closed_form() {
        let a = 0.3;
        let splines = model(&["A", "B"], |_, _| line(a));
        let system = UnmixingSystem::new(&splines);
        for &p in &[-40.0, 1.0, 750.0, 12_345.0] {
            let sol = system.solve(&[p, p], &SolverParams::default()).unwrap();
            let expected = p / (1.0 + a);
            assert_relative_eq!(sol.t[0], expected, max_relative = 1e-6);
            assert_relative_eq!(sol.t[1], expected, max_relative = 1e-6);
        }
    }

    #[test]
    fn zero_spillover_is_identity() {
        let splines = model(&["A", "B", "C"], |_, _| line(0.0));
        let system = UnmixingSystem::new(&splines);
        let sol = system
            .solve(&[10.0, -3.0, 500.0], &SolverParams::default())
            .unwrap();
        assert_eq!(sol.t, vec![10.0, -3.0, 500.0]);
        assert_eq!(sol.iterations, 0);
    }

    #[test]
    fn piecewise_three_channel_solution_has_small_residual() {
        let kinked = || {
            LinearSpline::from_parts(vec![0.0, 100.0, 5000.0], vec![2.0, 5.0, 400.0]).unwrap()
        };
        let splines = model(&["A", "B", "C"], |f, t| {
            if (f + t) % 2 == 0 {
                kinked()
            } else {
                line(0.05)
            }
        });
        let system = UnmixingSystem::new(&splines);
        let p = [3000.0, 800.0, 60.0];
        let sol = system.solve(&p, &SolverParams::default()).unwrap();
        let mut r = [0.0; 3];
        system.residual(&sol.t, &p, &mut r);
        assert!(max_abs(&r) <= 1e-10 * 3001.0);
    }

    #[test]
    fn nearly_full_spillover_is_singular() {
        // slopes a hair above 1, as a least-squares fit of full spillover gives
        let splines = model(&["A", "B"], |_, _| line(1.0 + 1e-13));
        let system = UnmixingSystem::new(&splines);
        let err = system
            .solve(&[1000.0, 100.0], &SolverParams::default())
            .unwrap_err();
        assert_eq!(err, SolveFailure::Singular);
    }

    #[test]
    fn condition_of_well_posed_jacobian() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.02, 0.01, 1.0]);
        assert!(reciprocal_condition(&m) > 0.9);
        assert_eq!(reciprocal_condition(&DMatrix::zeros(2, 2)), 0.0);
    }

    #[test]
    fn full_spillover_is_reported_not_accepted() {
        // unit slope both ways: the system is singular
        let splines = model(&["A", "B"], |_, _| line(1.0));
        let system = UnmixingSystem::new(&splines);
        let err = system
            .solve(&[100.0, 50.0], &SolverParams::default())
            .unwrap_err();
        assert_eq!(err, SolveFailure::Singular);
    }
}
