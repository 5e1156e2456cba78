//! Correction mesh: hyperlog-spaced axes per channel and the unmixed value
//! at every point of their Cartesian product.
//!
//! The product grows as `mesh_size^channels`, so this is where `estimate()`
//! spends its time. Points are independent and solved on the rayon pool.

use std::collections::BTreeMap;
use std::ops::Add;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::CancelToken;
use super::hlog::Hyperlog;
use super::solver::{SolveFailure, SolverParams, UnmixingSystem, max_abs};
use super::spline::SplineModel;
use crate::data::model::ChannelMetadata;
use crate::error::{BleedError, Result};

/// A corrected vector bigger than this many times the largest axis magnitude
/// is treated as a failed solve.
const DIVERGENCE_FACTOR: f64 = 10.0;

// ---------------------------------------------------------------------------
// Mesh – the raw-space grid
// ---------------------------------------------------------------------------

/// Rectilinear grid in raw measurement space. Flat indices are C order:
/// the first channel varies slowest, the last fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    channels: Vec<String>,
    axes: Vec<Vec<f64>>,
}

impl Mesh {
    /// One axis per channel, `mesh_size` points evenly spaced in hyperlog
    /// space over `[af_median − 3·af_stdev, range]`.
    pub fn build(
        channels: &[String],
        metadata: &BTreeMap<String, ChannelMetadata>,
        mesh_size: usize,
    ) -> Result<Self> {
        let axes = channels
            .iter()
            .map(|c| -> Result<Vec<f64>> {
                let meta = metadata.get(c).ok_or_else(|| BleedError::MissingMetadata {
                    channel: c.clone(),
                })?;
                let hlog = Hyperlog::for_range(meta.range)?;
                let axis = hlog.spaced(meta.mesh_min(), meta.range, mesh_size)?;
                debug!("{c}: mesh axis {axis:?}");
                Ok(axis)
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            channels: channels.to_vec(),
            axes,
        })
    }

    /// A mesh over explicit axes. Each axis must be strictly increasing with
    /// at least two points.
    pub fn from_axes(channels: Vec<String>, axes: Vec<Vec<f64>>) -> Option<Self> {
        let ok = channels.len() == axes.len()
            && axes
                .iter()
                .all(|a| a.len() >= 2 && a.windows(2).all(|w| w[1] > w[0]));
        ok.then_some(Self { channels, axes })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn axes(&self) -> &[Vec<f64>] {
        &self.axes
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(Vec::len).collect()
    }

    /// Total number of mesh points.
    pub fn len(&self) -> usize {
        self.axes.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest magnitude on any axis.
    pub fn extent(&self) -> f64 {
        self.axes
            .iter()
            .flat_map(|a| [a[0].abs(), a[a.len() - 1].abs()])
            .fold(0.0, f64::max)
    }

    /// Raw coordinate of the point at flat index `idx`.
    pub fn point(&self, mut idx: usize, out: &mut [f64]) {
        for (d, axis) in self.axes.iter().enumerate().rev() {
            out[d] = axis[idx % axis.len()];
            idx /= axis.len();
        }
    }
}

// ---------------------------------------------------------------------------
// Solving every mesh point
// ---------------------------------------------------------------------------

/// Tally of mesh points without a corrected value, by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub did_not_converge: usize,
    pub singular: usize,
    pub non_finite: usize,
    /// Solved, but the corrected vector lies far outside every axis.
    #[serde(default)]
    pub diverged: usize,
}

impl FailureCounts {
    pub fn total(&self) -> usize {
        self.did_not_converge + self.singular + self.non_finite + self.diverged
    }

    fn record(failure: &SolveFailure) -> Self {
        let mut c = Self::default();
        match failure {
            SolveFailure::DidNotConverge { .. } => c.did_not_converge = 1,
            SolveFailure::Singular => c.singular = 1,
            SolveFailure::NonFinite => c.non_finite = 1,
            SolveFailure::Diverged { .. } => c.diverged = 1,
        }
        c
    }
}

impl Add for FailureCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            did_not_converge: self.did_not_converge + rhs.did_not_converge,
            singular: self.singular + rhs.singular,
            non_finite: self.non_finite + rhs.non_finite,
            diverged: self.diverged + rhs.diverged,
        }
    }
}

/// Corrected values for every mesh point, one flat C-order array per
/// channel. `NaN` marks a point whose solve failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectedMesh {
    #[serde(with = "nan_as_null")]
    values: Vec<Vec<f64>>,
    failures: FailureCounts,
}

impl CorrectedMesh {
    /// Flat corrected values for channel index `channel`.
    pub fn values(&self, channel: usize) -> &[f64] {
        &self.values[channel]
    }

    pub fn failures(&self) -> FailureCounts {
        self.failures
    }

    pub fn channel_count(&self) -> usize {
        self.values.len()
    }
}

/// Solve the unmixing system at every mesh point.
///
/// The cancel token is checked before each point; a cancelled run returns
/// [`BleedError::Cancelled`] and discards everything solved so far.
pub fn solve_mesh(
    mesh: &Mesh,
    splines: &SplineModel,
    params: &SolverParams,
    cancel: &CancelToken,
) -> Result<CorrectedMesh> {
    let k = mesh.channels().len();
    let n = mesh.len();
    let system = UnmixingSystem::new(splines);
    let started = Instant::now();
    let limit = DIVERGENCE_FACTOR * mesh.extent();

    // point-major scratch: k values per mesh point
    let mut solved = vec![f64::NAN; n * k];
    let failures = solved
        .par_chunks_mut(k)
        .enumerate()
        .map(|(idx, out)| {
            if cancel.is_cancelled() {
                return Err(BleedError::Cancelled);
            }
            let mut p = vec![0.0; k];
            mesh.point(idx, &mut p);
            let solved = system.solve(&p, params).and_then(|sol| {
                let magnitude = max_abs(&sol.t);
                if magnitude > limit {
                    Err(SolveFailure::Diverged { magnitude })
                } else {
                    Ok(sol)
                }
            });
            match solved {
                Ok(sol) => {
                    out.copy_from_slice(&sol.t);
                    Ok(FailureCounts::default())
                }
                Err(failure) => {
                    debug!("mesh point {idx} {p:?}: {failure}");
                    Ok(FailureCounts::record(&failure))
                }
            }
        })
        .try_reduce(FailureCounts::default, |a, b| Ok(a + b))?;

    let values: Vec<Vec<f64>> = (0..k)
        .map(|c| solved.iter().skip(c).step_by(k).copied().collect())
        .collect();

    info!(
        "solved {n} mesh points over {k} channels in {:.2?}",
        started.elapsed()
    );
    if failures.total() > 0 {
        warn!(
            "{} of {n} mesh points have no corrected value \
             ({} unconverged, {} singular, {} non-finite, {} diverged); \
             events near them will be dropped",
            failures.total(),
            failures.did_not_converge,
            failures.singular,
            failures.non_finite,
            failures.diverged
        );
    }

    Ok(CorrectedMesh { values, failures })
}

/// JSON has no NaN: failed points travel as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(v: &Vec<Vec<f64>>, s: S) -> Result<S::Ok, S::Error> {
        let opts: Vec<Vec<Option<f64>>> = v
            .iter()
            .map(|col| col.iter().map(|x| x.is_finite().then_some(*x)).collect())
            .collect();
        opts.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let opts = Vec::<Vec<Option<f64>>>::deserialize(d)?;
        Ok(opts
            .into_iter()
            .map(|col| col.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spline::LinearSpline;
    use approx::assert_relative_eq;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    fn linear_model(ab: f64, ba: f64) -> SplineModel {
        let line = |s: f64| LinearSpline::from_parts(vec![0.0, 1.0], vec![0.0, s]).unwrap();
        let mut pairs = BTreeMap::new();
        pairs.insert(("A".to_string(), "B".to_string()), line(ab));
        pairs.insert(("B".to_string(), "A".to_string()), line(ba));
        SplineModel::from_pairs(&names(&["A", "B"]), pairs).unwrap()
    }

    #[test]
    fn flat_index_is_c_order() {
        let mesh = Mesh::from_axes(
            names(&["A", "B"]),
            vec![vec![0.0, 1.0, 2.0], vec![10.0, 20.0]],
        )
        .unwrap();
        assert_eq!(mesh.len(), 6);
        let mut p = [0.0; 2];
        mesh.point(0, &mut p);
        assert_eq!(p, [0.0, 10.0]);
        mesh.point(1, &mut p);
        assert_eq!(p, [0.0, 20.0]);
        mesh.point(5, &mut p);
        assert_eq!(p, [2.0, 20.0]);
    }

    #[test]
    fn build_spans_the_channel_domain() {
        let mut meta = BTreeMap::new();
        meta.insert("A".to_string(), ChannelMetadata::new(262_144.0, 10.0));
        meta.insert("B".to_string(), ChannelMetadata::new(1024.0, 2.0));
        let mesh = Mesh::build(&names(&["A", "B"]), &meta, 8).unwrap();
        assert_eq!(mesh.shape(), vec![8, 8]);
        assert_eq!(mesh.axes()[0][0], -30.0);
        assert_eq!(mesh.axes()[0][7], 262_144.0);
        assert_eq!(mesh.axes()[1][0], -6.0);
        assert_eq!(mesh.axes()[1][7], 1024.0);
    }

    #[test]
    fn linear_mesh_matches_matrix_inverse() {
        let splines = linear_model(0.01, 0.02);
        let mesh = Mesh::from_axes(
            names(&["A", "B"]),
            vec![vec![-30.0, 500.0, 5000.0], vec![-30.0, 80.0, 90_000.0]],
        )
        .unwrap();
        let corrected =
            solve_mesh(&mesh, &splines, &SolverParams::default(), &CancelToken::new()).unwrap();
        assert_eq!(corrected.failures().total(), 0);

        let det = 1.0 - 0.02 * 0.01;
        let mut p = [0.0; 2];
        for idx in 0..mesh.len() {
            mesh.point(idx, &mut p);
            let ta = (p[0] - 0.02 * p[1]) / det;
            let tb = (p[1] - 0.01 * p[0]) / det;
            assert_relative_eq!(corrected.values(0)[idx], ta, max_relative = 1e-6, epsilon = 1e-9);
            assert_relative_eq!(corrected.values(1)[idx], tb, max_relative = 1e-6, epsilon = 1e-9);
        }
    }

    #[test]
    fn singular_points_are_recorded_as_missing() {
        let splines = linear_model(1.0, 1.0);
        let mesh =
            Mesh::from_axes(names(&["A", "B"]), vec![vec![1.0, 2.0], vec![5.0, 6.0]]).unwrap();
        let corrected =
            solve_mesh(&mesh, &splines, &SolverParams::default(), &CancelToken::new()).unwrap();
        assert_eq!(corrected.failures().singular, 4);
        assert!(corrected.values(0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn far_out_solutions_count_as_diverged() {
        // det = 1 - 0.999 * 0.999: well enough conditioned to solve, but the
        // corrected values dwarf the mesh
        let splines = linear_model(0.999, 0.999);
        let mesh = Mesh::from_axes(
            names(&["A", "B"]),
            vec![vec![0.0, 1000.0], vec![0.0, 1000.0]],
        )
        .unwrap();
        let corrected =
            solve_mesh(&mesh, &splines, &SolverParams::default(), &CancelToken::new()).unwrap();
        // (0, 1000) and (1000, 0) solve to about ±500_000
        assert_eq!(corrected.failures().diverged, 2);
        assert_eq!(corrected.failures().total(), 2);
        assert_eq!(corrected.values(0)[0], 0.0);
        assert!(corrected.values(0)[1].is_nan());
    }

    #[test]
    fn cancelled_token_aborts() {
        let splines = linear_model(0.1, 0.1);
        let mesh =
            Mesh::from_axes(names(&["A", "B"]), vec![vec![1.0, 2.0], vec![5.0, 6.0]]).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = solve_mesh(&mesh, &splines, &SolverParams::default(), &cancel).unwrap_err();
        assert!(matches!(err, BleedError::Cancelled));
    }

    #[test]
    fn missing_points_survive_json() {
        let splines = linear_model(1.0, 1.0);
        let mesh =
            Mesh::from_axes(names(&["A", "B"]), vec![vec![1.0, 2.0], vec![5.0, 6.0]]).unwrap();
        let corrected =
            solve_mesh(&mesh, &splines, &SolverParams::default(), &CancelToken::new()).unwrap();
        let json = serde_json::to_string(&corrected).unwrap();
        let back: CorrectedMesh = serde_json::from_str(&json).unwrap();
        assert!(back.values(1).iter().all(|v| v.is_nan()));
        assert_eq!(back.failures(), corrected.failures());
    }
}
