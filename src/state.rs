use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::data::model::{ChannelMetadata, EventTable, SingleColorControl};
use crate::engine::{self, ApplyReport, CancelToken, EstimateParams, FittedModel};
use crate::error::{BleedError, Result};

// ---------------------------------------------------------------------------
// Shared model state
// ---------------------------------------------------------------------------

/// Holder for the current fitted model, shared between one estimating
/// caller and any number of applying callers.
///
/// A model is swapped in whole: every `apply()` sees either the previous
/// model or the new one, never a mixture.
#[derive(Debug, Default)]
pub struct ModelSlot {
    current: RwLock<Option<FittedModel>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `model`, returning the one it replaces.
    pub fn replace(&self, model: FittedModel) -> Option<FittedModel> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        guard.replace(model)
    }

    /// Snapshot of the current model.
    pub fn current(&self) -> Result<FittedModel> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BleedError::NoModel)
    }

    pub fn is_fitted(&self) -> bool {
        self.current().is_ok()
    }

    /// Run [`engine::estimate`] and install the result. On failure the
    /// previous model stays in place.
    pub fn estimate(
        &self,
        controls: &BTreeMap<String, SingleColorControl>,
        metadata: &BTreeMap<String, ChannelMetadata>,
        params: &EstimateParams,
        cancel: &CancelToken,
    ) -> Result<FittedModel> {
        let model = engine::estimate(controls, metadata, params, cancel)?;
        self.replace(model.clone());
        Ok(model)
    }

    /// Apply the current model. The lock is only held to take the snapshot.
    pub fn apply(&self, table: &EventTable, channels: &[String]) -> Result<(EventTable, ApplyReport)> {
        let model = self.current()?;
        engine::apply(&model, table, channels)
    }
}
