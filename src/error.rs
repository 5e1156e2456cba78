use thiserror::Error;

use crate::engine::hlog::HlogError;

/// Everything the correction engine can refuse to do.
///
/// Mesh points that fail to converge are *not* errors: they are recorded in
/// the fitted model as "no data" and surface as dropped rows at apply time.
#[derive(Debug, Error)]
pub enum BleedError {
    // -- configuration --------------------------------------------------
    #[error("need at least two channels to correct bleedthrough, got {found}")]
    TooFewChannels { found: usize },

    #[error("need at least 3 knots in the spline, got {num_knots}")]
    TooFewKnots { num_knots: usize },

    #[error("mesh axes need at least 2 points, got {mesh_size}")]
    MeshTooSmall { mesh_size: usize },

    #[error("mesh of {points} points exceeds the limit of {limit}")]
    MeshTooLarge { points: u128, limit: u128 },

    #[error("no instrument metadata for channel '{channel}'")]
    MissingMetadata { channel: String },

    #[error("invalid metadata for channel '{channel}': {reason}")]
    InvalidMetadata { channel: String, reason: String },

    #[error("table has no column '{column}'")]
    MissingColumn { column: String },

    #[error("subset {column} = {value} selects no events in the {channel} control")]
    EmptySubset {
        channel: String,
        column: String,
        value: String,
    },

    // -- not fitted -----------------------------------------------------
    #[error("no fitted model; run estimate() first")]
    NoModel,

    #[error("channel '{channel}' was not part of the fitted model")]
    NotFitted { channel: String },

    // -- data -----------------------------------------------------------
    #[error("cannot fit spline {from} -> {to}: {reason}")]
    InsufficientControlData {
        from: String,
        to: String,
        reason: String,
    },

    #[error("inconsistent model: {reason}")]
    InconsistentModel { reason: String },

    #[error(transparent)]
    Hyperlog(#[from] HlogError),

    #[error("estimate cancelled")]
    Cancelled,
}

impl BleedError {
    /// Configuration errors are deterministic: retrying with the same input
    /// will fail the same way.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BleedError::TooFewChannels { .. }
                | BleedError::TooFewKnots { .. }
                | BleedError::MeshTooSmall { .. }
                | BleedError::MeshTooLarge { .. }
                | BleedError::MissingMetadata { .. }
                | BleedError::InvalidMetadata { .. }
                | BleedError::MissingColumn { .. }
                | BleedError::EmptySubset { .. }
        )
    }

    pub fn is_not_fitted(&self) -> bool {
        matches!(self, BleedError::NoModel | BleedError::NotFitted { .. })
    }
}

pub type Result<T> = std::result::Result<T, BleedError>;
