//! Piecewise bleedthrough correction for multichannel single-cell data.
//!
//! ```text
//!  run.toml ──▶ config ──▶ controls + metadata
//!                               │
//!                               ▼
//!                        engine::estimate ──▶ FittedModel ──save/load──▶ model.json
//!                                                 │
//!  events.{csv,json,parquet} ──▶ data::loader ──▶ engine::apply ──▶ data::writer
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod state;

pub use data::filter::Subset;
pub use data::model::{ChannelMetadata, ConditionValue, EventTable, SingleColorControl};
pub use engine::{
    ApplyReport, CancelToken, ChannelCorrection, Diagnostics, EstimateParams, FittedModel, apply,
    diagnostics, estimate,
};
pub use error::{BleedError, Result};
pub use state::ModelSlot;
