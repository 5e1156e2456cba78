//! Hyperlog axis transform.
//!
//! Linear around zero, logarithmic for large magnitudes, odd-symmetric, so a
//! single evenly spaced axis covers sub-zero detector noise as well as bright
//! signal. Only the inverse has a closed form; the forward direction is a
//! bounded Brent root-find on the inverse (`roots`).

use roots::Convergency;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const XTOL: f64 = 2e-12;
const RTOL: f64 = 4.0 * f64::EPSILON;
const MAX_ITER: usize = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HlogError {
    #[error("hyperlog parameters must be finite and positive (b={b}, r={r}, d={d})")]
    InvalidParameters { b: f64, r: f64, d: f64 },

    #[error("value {x} is not finite")]
    NotFinite { x: f64 },

    #[error("value {x} lies outside the hyperlog domain [{lo}, {hi}]")]
    OutOfBracket { x: f64, lo: f64, hi: f64 },

    #[error("root-find for {x} did not converge in {iterations} iterations")]
    NoConvergence { x: f64, iterations: usize },
}

// ---------------------------------------------------------------------------
// Hyperlog – parameterized transform
// ---------------------------------------------------------------------------

/// Base-10 hyperlog with transition point `b`, display range `r` and `d`
/// decades of measurement range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperlog {
    pub b: f64,
    pub r: f64,
    pub d: f64,
}

impl Hyperlog {
    pub fn new(b: f64, r: f64, d: f64) -> Result<Self, HlogError> {
        let ok = |v: f64| v.is_finite() && v > 0.0;
        if !(ok(b) && ok(r) && ok(d)) {
            return Err(HlogError::InvalidParameters { b, r, d });
        }
        Ok(Self { b, r, d })
    }

    /// Parameterization used for a channel with instrument maximum `range`:
    /// half of the log-scale decades are treated as "linear".
    pub fn for_range(range: f64) -> Result<Self, HlogError> {
        let b = 2f64.powf(range.log2() / 2.0);
        Self::new(b, range, range.log10())
    }

    /// Closed-form inverse: hyperlog space → raw measurement space.
    #[inline]
    pub fn inverse(&self, y: f64) -> f64 {
        let aux = self.d / self.r * y;
        let s = if y < 0.0 { -1.0 } else { 1.0 };
        s * 10f64.powf(s * aux) + self.b * aux - s
    }

    /// Raw measurement space → hyperlog space.
    pub fn forward(&self, x: f64) -> Result<f64, HlogError> {
        if !x.is_finite() {
            return Err(HlogError::NotFinite { x });
        }
        let (lo, hi) = (-2.0 * self.r, 2.0 * self.r);
        let (x_lo, x_hi) = (self.inverse(lo), self.inverse(hi));
        if x < x_lo || x > x_hi {
            return Err(HlogError::OutOfBracket { x, lo: x_lo, hi: x_hi });
        }
        roots::find_root_brent(lo, hi, |y| self.inverse(y) - x, &mut BracketTolerance).map_err(
            |_| HlogError::NoConvergence {
                x,
                iterations: MAX_ITER,
            },
        )
    }

    pub fn forward_all(&self, xs: &[f64]) -> Result<Vec<f64>, HlogError> {
        xs.iter().map(|&x| self.forward(x)).collect()
    }

    pub fn inverse_all(&self, ys: &[f64]) -> Vec<f64> {
        ys.iter().map(|&y| self.inverse(y)).collect()
    }

    /// `n` raw-space points evenly spaced in hyperlog space from `lo` to
    /// `hi`. The endpoints are returned exactly as given.
    pub fn spaced(&self, lo: f64, hi: f64, n: usize) -> Result<Vec<f64>, HlogError> {
        let (y_lo, y_hi) = (self.forward(lo)?, self.forward(hi)?);
        let mut out: Vec<f64> = match n {
            0 => return Ok(Vec::new()),
            1 => return Ok(vec![lo]),
            _ => (0..n)
                .map(|i| {
                    let t = i as f64 / (n - 1) as f64;
                    self.inverse(y_lo + t * (y_hi - y_lo))
                })
                .collect(),
        };
        out[0] = lo;
        out[n - 1] = hi;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Root-finder tolerance
// ---------------------------------------------------------------------------

/// Stop once the bracket is narrower than `XTOL + RTOL·|y|`: hyperlog values
/// reach `2r`, where an absolute tolerance alone is below f64 resolution.
struct BracketTolerance;

impl Convergency<f64> for BracketTolerance {
    fn is_root_found(&mut self, y: f64) -> bool {
        y == 0.0
    }

    fn is_converged(&mut self, x1: f64, x2: f64) -> bool {
        (x1 - x2).abs() <= XTOL + RTOL * x1.abs().max(x2.abs())
    }

    fn is_iteration_limit_reached(&mut self, iter: usize) -> bool {
        iter >= MAX_ITER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn channel() -> Hyperlog {
        Hyperlog::for_range(262_144.0).unwrap()
    }

    #[test]
    fn zero_maps_to_zero() {
        let h = channel();
        assert_eq!(h.inverse(0.0), 0.0);
        assert!(h.forward(0.0).unwrap().abs() < 1e-9);
    }

    #[test]
    fn forward_inverts_inverse() {
        let h = channel();
        for &x in &[-5000.0, -30.0, -0.5, 1.0, 512.0, 10_000.0, 262_144.0] {
            let y = h.forward(x).unwrap();
            assert_relative_eq!(h.inverse(y), x, max_relative = 1e-9, epsilon = 1e-9);
        }
    }

    #[test]
    fn odd_symmetric_and_monotonic() {
        let h = channel();
        let xs: Vec<f64> = (0..50).map(|i| 10f64.powf(i as f64 / 10.0) - 1.0).collect();
        let pos = h.forward_all(&xs).unwrap();
        let neg: Vec<f64> = xs.iter().map(|x| h.forward(-x).unwrap()).collect();
        for (p, n) in pos.iter().zip(&neg) {
            assert_relative_eq!(*p, -*n, epsilon = 1e-8);
        }
        assert!(pos.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn out_of_bracket_is_a_domain_error() {
        let h = Hyperlog::for_range(1000.0).unwrap();
        let too_big = h.inverse(2.0 * h.r) * 2.0;
        assert!(matches!(
            h.forward(too_big),
            Err(HlogError::OutOfBracket { .. })
        ));
        assert!(matches!(
            h.forward(f64::NAN),
            Err(HlogError::NotFinite { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_range() {
        assert!(Hyperlog::for_range(0.0).is_err());
        assert!(Hyperlog::for_range(-10.0).is_err());
    }

    #[test]
    fn spaced_pins_endpoints_and_is_even_in_hlog_space() {
        let h = channel();
        let axis = h.spaced(-30.0, 262_144.0, 16).unwrap();
        assert_eq!(axis.len(), 16);
        assert_eq!(axis[0], -30.0);
        assert_eq!(axis[15], 262_144.0);
        assert!(axis.windows(2).all(|w| w[1] > w[0]));

        let ys = h.forward_all(&axis[1..15]).unwrap();
        let steps: Vec<f64> = ys.windows(2).map(|w| w[1] - w[0]).collect();
        for s in &steps {
            assert_relative_eq!(*s, steps[0], max_relative = 1e-6);
        }
    }
}
