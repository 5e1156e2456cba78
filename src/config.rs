use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::filter::Subset;
use crate::data::loader::load_file;
use crate::data::model::{ChannelMetadata, SingleColorControl};
use crate::engine::EstimateParams;
use crate::engine::solver::SolverParams;

/// One corrected channel: its single-color control and instrument facts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Control file; relative paths resolve against the config file.
    pub control: PathBuf,
    pub range: f64,
    #[serde(default)]
    pub af_median: f64,
    pub af_stdev: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimateConfig {
    #[serde(default = "EstimateConfig::default_num_knots")]
    pub num_knots: usize,
    #[serde(default = "EstimateConfig::default_mesh_size")]
    pub mesh_size: usize,
    #[serde(default = "EstimateConfig::default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "EstimateConfig::default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "EstimateConfig::default_max_mesh_points")]
    pub max_mesh_points: u64,
    /// Fit on the control events where `column == value` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
}

impl EstimateConfig {
    fn default_num_knots() -> usize {
        7
    }
    fn default_mesh_size() -> usize {
        32
    }
    fn default_max_iterations() -> usize {
        100
    }
    fn default_tolerance() -> f64 {
        1e-10
    }
    fn default_max_mesh_points() -> u64 {
        1 << 24
    }
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            num_knots: Self::default_num_knots(),
            mesh_size: Self::default_mesh_size(),
            max_iterations: Self::default_max_iterations(),
            tolerance: Self::default_tolerance(),
            max_mesh_points: Self::default_max_mesh_points(),
            subset: None,
        }
    }
}

/// A run file:
///
/// ```toml
/// [estimate]
/// num_knots = 7
/// mesh_size = 32
/// subset = { column = "well", value = "A1" }
///
/// [channels."FITC-A"]
/// control = "controls/fitc.csv"
/// range = 262144.0
/// af_stdev = 40.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub estimate: EstimateConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    /// Directory of the file this config came from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: RunConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        cfg.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("encoding config")
    }

    pub fn params(&self) -> EstimateParams {
        EstimateParams {
            num_knots: self.estimate.num_knots,
            mesh_size: self.estimate.mesh_size,
            solver: SolverParams {
                max_iterations: self.estimate.max_iterations,
                tolerance: self.estimate.tolerance,
            },
            max_mesh_points: self.estimate.max_mesh_points,
            subset: self.estimate.subset.clone(),
        }
    }

    pub fn metadata(&self) -> BTreeMap<String, ChannelMetadata> {
        self.channels
            .iter()
            .map(|(name, c)| {
                let meta = ChannelMetadata {
                    range: c.range,
                    af_median: c.af_median,
                    af_stdev: c.af_stdev,
                };
                (name.clone(), meta)
            })
            .collect()
    }

    /// Load every channel's single-color control.
    pub fn load_controls(&self) -> Result<BTreeMap<String, SingleColorControl>> {
        self.channels
            .iter()
            .map(|(name, c)| -> Result<(String, SingleColorControl)> {
                let path = self.base_dir.join(&c.control);
                let control = load_file(&path)
                    .with_context(|| format!("loading the {name} single-color control"))?;
                Ok((name.clone(), control))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::ConditionValue;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: RunConfig = toml::from_str(
            r#"
            [channels."FITC-A"]
            control = "fitc.csv"
            range = 262144.0
            af_stdev = 40.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.estimate, EstimateConfig::default());
        let meta = cfg.metadata();
        assert_eq!(meta["FITC-A"].af_median, 0.0);
        assert_eq!(meta["FITC-A"].mesh_min(), -120.0);
        assert_eq!(cfg.params().num_knots, 7);
    }

    #[test]
    fn toml_round_trip() {
        let mut cfg = RunConfig::default();
        cfg.estimate.mesh_size = 16;
        cfg.channels.insert(
            "PE-A".into(),
            ChannelConfig {
                control: "pe.parquet".into(),
                range: 1024.0,
                af_median: 3.0,
                af_stdev: 1.5,
            },
        );
        let back: RunConfig = toml::from_str(&cfg.to_toml_string().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn subset_reaches_params() {
        let cfg: RunConfig = toml::from_str(
            r#"
            [estimate]
            subset = { column = "well", value = "A1" }
            "#,
        )
        .unwrap();
        let subset = cfg.params().subset.unwrap();
        assert_eq!(subset.column, "well");
        assert_eq!(subset.value, ConditionValue::String("A1".into()));

        let cfg: RunConfig = toml::from_str(
            r#"
            [estimate.subset]
            column = "replicate"
            value = 2
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.estimate.subset.unwrap().value,
            ConditionValue::Integer(2)
        );
        assert_eq!(RunConfig::default().params().subset, None);
    }
}
