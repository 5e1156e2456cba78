//! Correction engine: estimation, the fitted model, and application.
//!
//! Architecture:
//! ```text
//!  single-color controls + channel metadata
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  spline  │  per (from, to) pair: degree-1 LSQ spline, hlog-spaced knots
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │   mesh   │  hlog-spaced grid; solve the coupled system at every point
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  interp  │  per channel: multilinear raw → corrected lookup
//!   └──────────┘
//!        │
//!        ▼
//!    FittedModel ──apply()──▶ corrected EventTable
//! ```

pub mod hlog;
pub mod interp;
pub mod mesh;
pub mod solver;
pub mod spline;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Context;
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::filter::{
    ChannelBound, Subset, mask_indices, mesh_domain_indices, subset_indices,
};
use crate::data::model::{ChannelMetadata, EventTable, SingleColorControl};
use crate::error::{BleedError, Result};
use interp::RectilinearGrid;
use mesh::{CorrectedMesh, FailureCounts, Mesh};
use solver::SolverParams;
use spline::SplineModel;

// ---------------------------------------------------------------------------
// Parameters and cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateParams {
    /// Knots per spline, including the two boundary knots.
    pub num_knots: usize,
    /// Points per mesh axis.
    pub mesh_size: usize,
    pub solver: SolverParams,
    /// Refuse meshes with more points than this.
    pub max_mesh_points: u64,
    /// Fit only the control events this selects.
    #[serde(default)]
    pub subset: Option<Subset>,
}

impl Default for EstimateParams {
    fn default() -> Self {
        Self {
            num_knots: 7,
            mesh_size: 32,
            solver: SolverParams::default(),
            max_mesh_points: 1 << 24,
            subset: None,
        }
    }
}

/// Cooperative cancellation for [`estimate`]; clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// FittedModel
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ModelParts {
    channels: Vec<String>,
    metadata: BTreeMap<String, ChannelMetadata>,
    params: EstimateParams,
    splines: SplineModel,
    mesh: Mesh,
    corrected: CorrectedMesh,
}

#[derive(Debug)]
struct Inner {
    parts: ModelParts,
    grid: RectilinearGrid,
}

/// Everything `estimate()` learned. Immutable; clones are cheap and share
/// the same data.
#[derive(Debug, Clone)]
pub struct FittedModel {
    inner: Arc<Inner>,
}

impl FittedModel {
    fn from_parts(parts: ModelParts) -> Result<Self> {
        let inconsistent = |reason: String| BleedError::InconsistentModel { reason };
        let grid = RectilinearGrid::new(parts.mesh.axes().to_vec())
            .ok_or_else(|| inconsistent("mesh axes are not strictly increasing".into()))?;
        if parts.mesh.channels() != parts.channels.as_slice()
            || parts.splines.channels() != parts.channels.as_slice()
        {
            return Err(inconsistent("channel lists disagree".into()));
        }
        if !parts.splines.is_complete() {
            return Err(inconsistent("spline table is incomplete".into()));
        }
        if parts.corrected.channel_count() != parts.channels.len() {
            return Err(inconsistent("corrected mesh has the wrong channel count".into()));
        }
        for (c, name) in parts.channels.iter().enumerate() {
            let meta = parts
                .metadata
                .get(name)
                .ok_or_else(|| BleedError::MissingMetadata {
                    channel: name.clone(),
                })?;
            meta.validate(name)?;
            if parts.corrected.values(c).len() != grid.len() {
                return Err(inconsistent(format!(
                    "corrected mesh for {name} does not match the grid"
                )));
            }
        }
        Ok(Self {
            inner: Arc::new(Inner { parts, grid }),
        })
    }

    /// Channels in model order: the order of every raw input vector.
    pub fn channels(&self) -> &[String] {
        &self.inner.parts.channels
    }

    pub fn metadata(&self) -> &BTreeMap<String, ChannelMetadata> {
        &self.inner.parts.metadata
    }

    pub fn params(&self) -> &EstimateParams {
        &self.inner.parts.params
    }

    pub fn splines(&self) -> &SplineModel {
        &self.inner.parts.splines
    }

    pub fn mesh(&self) -> &Mesh {
        &self.inner.parts.mesh
    }

    pub fn failures(&self) -> FailureCounts {
        self.inner.parts.corrected.failures()
    }

    fn index_of(&self, channel: &str) -> Option<usize> {
        self.channels().iter().position(|c| c == channel)
    }

    /// Corrected mesh values for one channel, flat in C order.
    pub fn corrected_values(&self, channel: &str) -> Option<&[f64]> {
        self.index_of(channel)
            .map(|i| self.inner.parts.corrected.values(i))
    }

    /// Correct one raw vector (model channel order). `None` outside the
    /// mesh or next to an unsolved mesh point.
    pub fn correct_point(&self, raw: &[f64]) -> Option<Vec<f64>> {
        let grid = &self.inner.grid;
        let cell = grid.locate(raw)?;
        (0..self.channels().len())
            .map(|c| grid.interpolate(&cell, self.inner.parts.corrected.values(c)))
            .collect()
    }

    /// The reusable correction function for one channel.
    pub fn correction(&self, channel: &str) -> Option<ChannelCorrection> {
        self.index_of(channel).map(|index| ChannelCorrection {
            model: self.clone(),
            index,
        })
    }

    /// Write the model as JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating model file {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &self.inner.parts)
            .context("serializing model")?;
        Ok(())
    }

    /// Read a model written by [`FittedModel::save`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening model file {}", path.display()))?;
        let parts: ModelParts =
            serde_json::from_reader(BufReader::new(file)).context("parsing model JSON")?;
        Self::from_parts(parts)
            .with_context(|| format!("model file {} is not usable", path.display()))
    }
}

/// One channel's raw → corrected function, detached from any table.
#[derive(Clone)]
pub struct ChannelCorrection {
    model: FittedModel,
    index: usize,
}

impl ChannelCorrection {
    pub fn channel(&self) -> &str {
        &self.model.channels()[self.index]
    }

    /// Channel order expected by [`ChannelCorrection::correct`].
    pub fn inputs(&self) -> &[String] {
        self.model.channels()
    }

    pub fn correct(&self, raw: &[f64]) -> Option<f64> {
        let inner = &self.model.inner;
        inner
            .grid
            .eval(inner.parts.corrected.values(self.index), raw)
    }

    pub fn model(&self) -> &FittedModel {
        &self.model
    }
}

impl fmt::Debug for ChannelCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCorrection")
            .field("channel", &self.channel())
            .field("inputs", &self.inputs())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// estimate
// ---------------------------------------------------------------------------

/// Fit splines from the single-color controls, build and solve the mesh,
/// and return the model. The channel set is the set of control keys.
pub fn estimate(
    controls: &BTreeMap<String, SingleColorControl>,
    metadata: &BTreeMap<String, ChannelMetadata>,
    params: &EstimateParams,
    cancel: &CancelToken,
) -> Result<FittedModel> {
    if params.num_knots < 3 {
        return Err(BleedError::TooFewKnots {
            num_knots: params.num_knots,
        });
    }
    if controls.len() < 2 {
        return Err(BleedError::TooFewChannels {
            found: controls.len(),
        });
    }
    if params.mesh_size < 2 {
        return Err(BleedError::MeshTooSmall {
            mesh_size: params.mesh_size,
        });
    }

    let channels: Vec<String> = controls.keys().cloned().collect();
    let mut used_meta = BTreeMap::new();
    for c in &channels {
        let meta = metadata
            .get(c)
            .ok_or_else(|| BleedError::MissingMetadata { channel: c.clone() })?;
        meta.validate(c)?;
        used_meta.insert(c.clone(), *meta);
    }

    let points = (params.mesh_size as u128)
        .checked_pow(channels.len() as u32)
        .unwrap_or(u128::MAX);
    if points > u128::from(params.max_mesh_points) {
        return Err(BleedError::MeshTooLarge {
            points,
            limit: params.max_mesh_points.into(),
        });
    }

    info!(
        "estimating bleedthrough for {} channels ({}), {} knots, {points} mesh points",
        channels.len(),
        channels.join(", "),
        params.num_knots
    );
    let started = Instant::now();

    let restricted;
    let controls = match &params.subset {
        Some(subset) => {
            restricted = restrict_controls(controls, subset)?;
            &restricted
        }
        None => controls,
    };

    let splines = SplineModel::fit(&channels, controls, &used_meta, params.num_knots)?;
    if cancel.is_cancelled() {
        return Err(BleedError::Cancelled);
    }
    let mesh = Mesh::build(&channels, &used_meta, params.mesh_size)?;
    let corrected = mesh::solve_mesh(&mesh, &splines, &params.solver, cancel)?;

    let model = FittedModel::from_parts(ModelParts {
        channels,
        metadata: used_meta,
        params: params.clone(),
        splines,
        mesh,
        corrected,
    })?;

    info!("estimate finished in {:.2?}", started.elapsed());
    Ok(model)
}

/// Each control cut down to the events `subset` selects.
fn restrict_controls(
    controls: &BTreeMap<String, SingleColorControl>,
    subset: &Subset,
) -> Result<BTreeMap<String, SingleColorControl>> {
    controls
        .iter()
        .map(|(channel, control)| -> Result<(String, SingleColorControl)> {
            let rows = subset_indices(control, subset).ok_or_else(|| BleedError::MissingColumn {
                column: format!("{} (in the {channel} control)", subset.column),
            })?;
            if rows.is_empty() {
                return Err(BleedError::EmptySubset {
                    channel: channel.clone(),
                    column: subset.column.clone(),
                    value: subset.value.to_string(),
                });
            }
            info!(
                "{channel}: subset {} = {} keeps {} of {} control events",
                subset.column,
                subset.value,
                rows.len(),
                control.len()
            );
            Ok((channel.clone(), control.take(&rows)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Row accounting for one `apply()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub input_rows: usize,
    /// Rows below a channel's mesh lower bound.
    pub domain_dropped: usize,
    /// Rows above the mesh or next to an unsolved mesh point.
    pub unresolved_dropped: usize,
    pub output_rows: usize,
}

/// Correct `channels` of `table` (all model channels when empty). Returns a
/// new table; out-of-domain rows are removed from every column.
pub fn apply(
    model: &FittedModel,
    table: &EventTable,
    channels: &[String],
) -> Result<(EventTable, ApplyReport)> {
    let requested: Vec<usize> = if channels.is_empty() {
        (0..model.channels().len()).collect()
    } else {
        channels
            .iter()
            .map(|c| {
                model
                    .index_of(c)
                    .ok_or_else(|| BleedError::NotFitted { channel: c.clone() })
            })
            .collect::<Result<_>>()?
    };

    for c in model.channels() {
        if !table.has_channel(c) {
            return Err(BleedError::MissingColumn { column: c.clone() });
        }
    }

    let bounds: Vec<ChannelBound<'_>> = model
        .channels()
        .iter()
        .map(|c| {
            model
                .metadata()
                .get(c)
                .map(|meta| ChannelBound {
                    channel: c,
                    lower: meta.mesh_min(),
                })
                .ok_or_else(|| BleedError::MissingMetadata { channel: c.clone() })
        })
        .collect::<Result<_>>()?;
    let in_domain = table.take(&mesh_domain_indices(table, &bounds));

    let raw: Vec<&[f64]> = model
        .channels()
        .iter()
        .map(|c| in_domain.channel(c).unwrap_or_default())
        .collect();
    let inner = &model.inner;

    let corrected: Vec<Option<Vec<f64>>> = (0..in_domain.len())
        .into_par_iter()
        .map(|row| -> Option<Vec<f64>> {
            let x: Vec<f64> = raw.iter().map(|col| col[row]).collect();
            let cell = inner.grid.locate(&x)?;
            requested
                .iter()
                .map(|&c| {
                    inner
                        .grid
                        .interpolate(&cell, inner.parts.corrected.values(c))
                })
                .collect()
        })
        .collect();

    let resolved: Vec<bool> = corrected.iter().map(Option::is_some).collect();
    let mut out = in_domain.take(&mask_indices(&resolved));
    for (j, &c) in requested.iter().enumerate() {
        let values: Vec<f64> = corrected.iter().flatten().map(|v| v[j]).collect();
        let name = &model.channels()[c];
        out.insert_channel(name.clone(), values)
            .map_err(|_| BleedError::MissingColumn {
                column: name.clone(),
            })?;
        out.corrections.insert(
            name.clone(),
            ChannelCorrection {
                model: model.clone(),
                index: c,
            },
        );
    }

    let report = ApplyReport {
        input_rows: table.len(),
        domain_dropped: table.len() - in_domain.len(),
        unresolved_dropped: in_domain.len() - out.len(),
        output_rows: out.len(),
    };
    info!(
        "corrected {} of {} events ({} below the mesh, {} unresolved)",
        report.output_rows, report.input_rows, report.domain_dropped, report.unresolved_dropped
    );
    Ok((out, report))
}

// ---------------------------------------------------------------------------
// diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SplineDiagnostic<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub knots: &'a [f64],
    pub values: &'a [f64],
}

/// Read-only view of a fitted model for external plotting.
#[derive(Debug, Serialize)]
pub struct Diagnostics<'a> {
    pub channels: &'a [String],
    pub splines: Vec<SplineDiagnostic<'a>>,
    pub mesh_axes: &'a [Vec<f64>],
    /// Per channel, corrected mesh values in C order (`null` = unsolved).
    pub corrected_mesh: BTreeMap<&'a str, &'a [f64]>,
    pub failed_points: usize,
    pub failures: FailureCounts,
}

pub fn diagnostics(model: &FittedModel) -> Diagnostics<'_> {
    let parts = &model.inner.parts;
    Diagnostics {
        channels: &parts.channels,
        splines: parts
            .splines
            .iter()
            .map(|(from, to, s)| SplineDiagnostic {
                from,
                to,
                knots: s.knots(),
                values: s.values(),
            })
            .collect(),
        mesh_axes: parts.mesh.axes(),
        corrected_mesh: parts
            .channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), parts.corrected.values(i)))
            .collect(),
        failed_points: parts.corrected.failures().total(),
        failures: parts.corrected.failures(),
    }
}
