use serde::{Deserialize, Serialize};

use super::model::{ConditionValue, EventTable};

// ---------------------------------------------------------------------------
// Row filtering
// ---------------------------------------------------------------------------

/// Lower bound on one channel: rows below it fall outside the correction
/// mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelBound<'a> {
    pub channel: &'a str,
    pub lower: f64,
}

/// Return indices of events that lie inside the mesh domain on every
/// bounded channel.
///
/// An event passes a channel bound when:
/// * The channel is missing from the table → passes (no constraint)
/// * The value is at or above `lower` → passes
/// * The value is below `lower`, or NaN → fails
pub fn mesh_domain_indices(table: &EventTable, bounds: &[ChannelBound<'_>]) -> Vec<usize> {
    let columns: Vec<(&[f64], f64)> = bounds
        .iter()
        .filter_map(|b| table.channel(b.channel).map(|col| (col, b.lower)))
        .collect();

    (0..table.len())
        .filter(|&row| columns.iter().all(|(col, lower)| col[row] >= *lower))
        .collect()
}

/// Keep only events whose `column` equals `value`. The column may be a
/// condition column or a numeric channel column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subset {
    pub column: String,
    pub value: ConditionValue,
}

/// Indices of the rows selected by `subset`, or `None` when the table has no
/// such column.
pub fn subset_indices(table: &EventTable, subset: &Subset) -> Option<Vec<usize>> {
    if let Some(col) = table.condition(&subset.column) {
        return Some(
            (0..table.len())
                .filter(|&row| col[row].matches(&subset.value))
                .collect(),
        );
    }
    let col = table.channel(&subset.column)?;
    let Some(target) = subset.value.as_f64() else {
        return Some(Vec::new());
    };
    Some((0..table.len()).filter(|&row| col[row] == target).collect())
}

/// Indices of the rows where `keep` is true.
pub fn mask_indices(keep: &[bool]) -> Vec<usize> {
    keep.iter()
        .enumerate()
        .filter(|(_, k)| **k)
        .map(|(i, _)| i)
        .collect()
}
