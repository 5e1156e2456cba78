//! Degree-1 least-squares regression splines, one per ordered channel pair.
//!
//! Knots are spread evenly in hyperlog space between the source channel's
//! control min and max, so the spline follows both the linear (near-zero and
//! negative) and the log-like (bright) portions of a control.

use std::collections::BTreeMap;

use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hlog::Hyperlog;
use crate::data::model::{ChannelMetadata, SingleColorControl};
use crate::error::{BleedError, Result};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("need at least two finite control points, got {found}")]
    TooFewPoints { found: usize },

    #[error("control values span no range (all equal to {value})")]
    Degenerate { value: f64 },

    #[error("knots must be strictly increasing and inside ({lo}, {hi})")]
    BadKnots { lo: f64, hi: f64 },

    #[error("no control data supports the knot span ({lo}, {hi})")]
    EmptySpan { lo: f64, hi: f64 },

    #[error("normal equations are singular")]
    Singular,
}

// ---------------------------------------------------------------------------
// LinearSpline – piecewise-linear function on fixed breakpoints
// ---------------------------------------------------------------------------

/// A continuous piecewise-linear function stored as its value at each
/// breakpoint. Outside the first/last breakpoint it extrapolates linearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSpline {
    knots: Vec<f64>,
    values: Vec<f64>,
}

impl LinearSpline {
    /// Build a spline from explicit breakpoints and values.
    pub fn from_parts(knots: Vec<f64>, values: Vec<f64>) -> Option<Self> {
        let increasing = knots.windows(2).all(|w| w[1] > w[0]);
        if knots.len() < 2 || knots.len() != values.len() || !increasing {
            return None;
        }
        Some(Self { knots, values })
    }

    /// Least-squares fit of `y ~ spline(x)` with the given interior knots.
    /// Boundary breakpoints sit at the data min and max. Non-finite pairs
    /// are ignored.
    pub fn fit(x: &[f64], y: &[f64], interior: &[f64]) -> std::result::Result<Self, FitError> {
        let mut points: Vec<(f64, f64)> = x
            .iter()
            .zip(y)
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(&a, &b)| (a, b))
            .collect();
        if points.len() < 2 {
            return Err(FitError::TooFewPoints {
                found: points.len(),
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let lo = points[0].0;
        let hi = points[points.len() - 1].0;
        if lo == hi {
            return Err(FitError::Degenerate { value: lo });
        }

        let mut knots = Vec::with_capacity(interior.len() + 2);
        knots.push(lo);
        knots.extend_from_slice(interior);
        knots.push(hi);
        if !knots.windows(2).all(|w| w[1] > w[0]) {
            return Err(FitError::BadKnots { lo, hi });
        }

        let m = knots.len();
        let mut normal = DMatrix::<f64>::zeros(m, m);
        let mut rhs = DVector::<f64>::zeros(m);
        let mut support = vec![0usize; m];

        for &(px, py) in &points {
            let j = segment(&knots, px);
            let w = (px - knots[j]) / (knots[j + 1] - knots[j]);
            let (b0, b1) = (1.0 - w, w);

            normal[(j, j)] += b0 * b0;
            normal[(j, j + 1)] += b0 * b1;
            normal[(j + 1, j)] += b0 * b1;
            normal[(j + 1, j + 1)] += b1 * b1;
            rhs[j] += b0 * py;
            rhs[j + 1] += b1 * py;

            if b0 > 0.0 {
                support[j] += 1;
            }
            if b1 > 0.0 {
                support[j + 1] += 1;
            }
        }

        if let Some(j) = support.iter().position(|&n| n == 0) {
            return Err(FitError::EmptySpan {
                lo: knots[j.saturating_sub(1)],
                hi: knots[(j + 1).min(m - 1)],
            });
        }

        let values = normal.lu().solve(&rhs).ok_or(FitError::Singular)?;
        Ok(Self {
            knots,
            values: values.iter().copied().collect(),
        })
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        let j = segment(&self.knots, x);
        self.values[j] + self.segment_slope(j) * (x - self.knots[j])
    }

    /// Derivative at `x`; at a breakpoint this is the slope to the right.
    #[inline]
    pub fn slope(&self, x: f64) -> f64 {
        self.segment_slope(segment(&self.knots, x))
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    fn segment_slope(&self, j: usize) -> f64 {
        (self.values[j + 1] - self.values[j]) / (self.knots[j + 1] - self.knots[j])
    }
}

/// Index of the segment used for `x`, clamped to the first/last segment.
#[inline]
fn segment(knots: &[f64], x: f64) -> usize {
    knots
        .partition_point(|&k| k <= x)
        .saturating_sub(1)
        .min(knots.len() - 2)
}

// ---------------------------------------------------------------------------
// Knot placement
// ---------------------------------------------------------------------------

/// Interior knots for a control column: `num_knots` points evenly spaced in
/// hyperlog space between the column's min and max, without the two ends.
pub fn interior_knots(column: &[f64], range: f64, num_knots: usize) -> Result<Vec<f64>> {
    let (min, max) = column
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !(min.is_finite() && max.is_finite()) || min == max {
        return Ok(Vec::new());
    }

    let hlog = Hyperlog::for_range(range)?;
    let knots = hlog.spaced(min, max, num_knots)?;
    Ok(knots[1..num_knots - 1].to_vec())
}

// ---------------------------------------------------------------------------
// SplineModel – every ordered (from, to) pair
// ---------------------------------------------------------------------------

/// Spillover splines for every ordered pair of distinct channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplineModel {
    channels: Vec<String>,
    /// Row-major `from × to`; the diagonal is `None`.
    pairs: Vec<Option<LinearSpline>>,
}

impl SplineModel {
    /// Fit all pairs from the single-color controls. `channels` fixes the
    /// channel order used everywhere downstream.
    pub fn fit(
        channels: &[String],
        controls: &BTreeMap<String, SingleColorControl>,
        metadata: &BTreeMap<String, ChannelMetadata>,
        num_knots: usize,
    ) -> Result<Self> {
        let k = channels.len();

        let mut knots = Vec::with_capacity(k);
        for from in channels {
            let control = &controls[from];
            let column = control
                .channel(from)
                .ok_or_else(|| BleedError::MissingColumn {
                    column: format!("{from} (in the {from} control)"),
                })?;
            for to in channels {
                if !control.has_channel(to) {
                    return Err(BleedError::MissingColumn {
                        column: format!("{to} (in the {from} control)"),
                    });
                }
            }
            let interior = interior_knots(column, metadata[from].range, num_knots)?;
            debug!("{from}: interior knots {interior:?}");
            knots.push(interior);
        }

        let fitted: Vec<Option<LinearSpline>> = (0..k * k)
            .into_par_iter()
            .map(|idx| {
                let (f, t) = (idx / k, idx % k);
                if f == t {
                    return Ok(None);
                }
                let (from, to) = (&channels[f], &channels[t]);
                let control = &controls[from];
                let x = control.channel(from).unwrap_or_default();
                let y = control.channel(to).unwrap_or_default();
                LinearSpline::fit(x, y, &knots[f]).map(Some).map_err(|e| {
                    BleedError::InsufficientControlData {
                        from: from.clone(),
                        to: to.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            channels: channels.to_vec(),
            pairs: fitted,
        })
    }

    /// Assemble a model from explicit splines keyed `(from, to)`. Every
    /// ordered pair of distinct channels must be present.
    pub fn from_pairs(
        channels: &[String],
        mut splines: BTreeMap<(String, String), LinearSpline>,
    ) -> Option<Self> {
        let mut pairs = Vec::with_capacity(channels.len() * channels.len());
        for from in channels {
            for to in channels {
                if from == to {
                    pairs.push(None);
                } else {
                    pairs.push(Some(splines.remove(&(from.clone(), to.clone()))?));
                }
            }
        }
        Some(Self {
            channels: channels.to_vec(),
            pairs,
        })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Every off-diagonal pair present and the diagonal empty.
    pub fn is_complete(&self) -> bool {
        let k = self.channels.len();
        self.pairs.len() == k * k
            && self
                .pairs
                .iter()
                .enumerate()
                .all(|(idx, s)| s.is_some() == (idx / k != idx % k))
    }

    pub fn get(&self, from: &str, to: &str) -> Option<&LinearSpline> {
        let f = self.channels.iter().position(|c| c == from)?;
        let t = self.channels.iter().position(|c| c == to)?;
        self.at(f, t)
    }

    /// Spline by channel index; `None` on the diagonal.
    #[inline]
    pub fn at(&self, from: usize, to: usize) -> Option<&LinearSpline> {
        self.pairs[from * self.channels.len() + to].as_ref()
    }

    /// All `(from, to, spline)` triples in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &LinearSpline)> {
        let k = self.channels.len();
        self.pairs.iter().enumerate().filter_map(move |(idx, s)| {
            s.as_ref().map(|s| {
                (
                    self.channels[idx / k].as_str(),
                    self.channels[idx % k].as_str(),
                    s,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reproduces_linear_data() {
        let x: Vec<f64> = (0..200).map(|i| i as f64 * 5.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 + 0.25 * v).collect();
        let s = LinearSpline::fit(&x, &y, &[100.0, 400.0, 700.0]).unwrap();
        for &q in &[0.0, 55.5, 400.0, 812.0, 995.0] {
            assert_relative_eq!(s.eval(q), 3.0 + 0.25 * q, epsilon = 1e-9);
        }
        assert_relative_eq!(s.slope(250.0), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn extrapolates_along_end_segments() {
        let s = LinearSpline::from_parts(vec![0.0, 10.0, 20.0], vec![0.0, 10.0, 40.0]).unwrap();
        assert_relative_eq!(s.eval(-5.0), -5.0);
        assert_relative_eq!(s.eval(25.0), 55.0);
        assert_relative_eq!(s.slope(10.0), 3.0);
        assert_relative_eq!(s.slope(9.999), 1.0);
    }

    #[test]
    fn fits_a_kink() {
        let x: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| if v < 50.0 { v } else { 50.0 }).collect();
        let s = LinearSpline::fit(&x, &y, &[50.0]).unwrap();
        assert_relative_eq!(s.eval(25.0), 25.0, epsilon = 1e-9);
        assert_relative_eq!(s.eval(75.0), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn empty_knot_span_is_rejected() {
        let x = vec![0.0, 1.0, 2.0, 100.0];
        let y = vec![0.0; 4];
        let err = LinearSpline::fit(&x, &y, &[10.0, 20.0]).unwrap_err();
        assert!(matches!(err, FitError::EmptySpan { .. }));
    }

    #[test]
    fn degenerate_control_is_rejected() {
        let err = LinearSpline::fit(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0], &[]).unwrap_err();
        assert_eq!(err, FitError::Degenerate { value: 5.0 });
    }

    #[test]
    fn interior_knots_drop_the_ends() {
        let column: Vec<f64> = (0..1000).map(|i| i as f64 * 10.0).collect();
        let knots = interior_knots(&column, 262_144.0, 5).unwrap();
        assert_eq!(knots.len(), 3);
        assert!(knots[0] > 0.0 && knots[2] < 9990.0);
        assert!(knots.windows(2).all(|w| w[1] > w[0]));
    }
}
