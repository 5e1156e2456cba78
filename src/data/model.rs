use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::engine::ChannelCorrection;
use crate::error::BleedError;

// ---------------------------------------------------------------------------
// ConditionValue – a single cell in a non-numeric column
// ---------------------------------------------------------------------------

/// A dynamically-typed value for experimental-condition columns (well,
/// treatment, replicate, ...). These ride along with the events and are
/// filtered with them, but are never corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::String(s) => write!(f, "{s}"),
            ConditionValue::Integer(i) => write!(f, "{i}"),
            ConditionValue::Float(v) => write!(f, "{v}"),
            ConditionValue::Bool(b) => write!(f, "{b}"),
            ConditionValue::Null => Ok(()),
        }
    }
}

impl ConditionValue {
    /// Equality that treats `Integer` and `Float` as the same number, so a
    /// `1` from a CSV matches a `1.0` from a config file.
    pub fn matches(&self, other: &ConditionValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConditionValue::Integer(i) => Some(*i as f64),
            ConditionValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelMetadata – instrument facts about one channel
// ---------------------------------------------------------------------------

/// Per-channel instrument range and autofluorescence noise estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Instrument maximum for the channel.
    pub range: f64,
    /// Autofluorescence median; `0.0` when unknown.
    #[serde(default)]
    pub af_median: f64,
    /// Autofluorescence standard deviation.
    pub af_stdev: f64,
}

impl ChannelMetadata {
    pub fn new(range: f64, af_stdev: f64) -> Self {
        Self {
            range,
            af_median: 0.0,
            af_stdev,
        }
    }

    /// Lower edge of the correction mesh: three noise sigmas below the
    /// autofluorescence median.
    pub fn mesh_min(&self) -> f64 {
        self.af_median - 3.0 * self.af_stdev
    }

    pub fn validate(&self, channel: &str) -> Result<(), BleedError> {
        let invalid = |reason: &str| BleedError::InvalidMetadata {
            channel: channel.to_string(),
            reason: reason.to_string(),
        };
        if !(self.range.is_finite() && self.range > 1.0) {
            return Err(invalid("range must be finite and greater than 1"));
        }
        if !(self.af_stdev.is_finite() && self.af_stdev >= 0.0) {
            return Err(invalid("af_stdev must be finite and non-negative"));
        }
        if !self.af_median.is_finite() {
            return Err(invalid("af_median must be finite"));
        }
        if self.mesh_min() >= self.range {
            return Err(invalid("af_median - 3 * af_stdev must lie below range"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventTable – one row per measured event
// ---------------------------------------------------------------------------

/// Column-oriented event data: numeric channel columns plus optional
/// condition columns, all of the same length.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    /// Channel names in column order.
    channel_names: Vec<String>,
    channels: BTreeMap<String, Vec<f64>>,
    /// Condition names in column order.
    condition_names: Vec<String>,
    conditions: BTreeMap<String, Vec<ConditionValue>>,
    len: usize,
    /// Reusable correction function per corrected channel, attached by
    /// `apply()` so auxiliary datasets can be recalibrated later.
    pub corrections: BTreeMap<String, ChannelCorrection>,
}

/// A stain-only reference sample; structurally just an event table.
pub type SingleColorControl = EventTable;

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(name, values)` channel columns.
    pub fn from_channels<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for (name, values) in columns {
            table.insert_channel(name, values)?;
        }
        Ok(table)
    }

    /// Add or replace a channel column. The first column fixes the row count.
    pub fn insert_channel(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        self.check_len(&name, values.len())?;
        if self.channels.insert(name.clone(), values).is_none() {
            self.channel_names.push(name);
        }
        Ok(())
    }

    /// Add or replace a condition column.
    pub fn insert_condition(
        &mut self,
        name: impl Into<String>,
        values: Vec<ConditionValue>,
    ) -> Result<()> {
        let name = name.into();
        self.check_len(&name, values.len())?;
        if self.conditions.insert(name.clone(), values).is_none() {
            self.condition_names.push(name);
        }
        Ok(())
    }

    fn check_len(&mut self, name: &str, n: usize) -> Result<()> {
        if self.channel_names.is_empty() && self.condition_names.is_empty() {
            self.len = n;
        } else if n != self.len {
            bail!("column '{name}' has {n} rows but the table has {}", self.len);
        }
        Ok(())
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no events.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn condition_names(&self) -> &[String] {
        &self.condition_names
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    pub fn condition(&self, name: &str) -> Option<&[ConditionValue]> {
        self.conditions.get(name).map(Vec::as_slice)
    }

    /// A new table holding only the rows at `indices`, in that order.
    /// Corrections metadata is carried over.
    pub fn take(&self, indices: &[usize]) -> EventTable {
        let channels = self
            .channels
            .iter()
            .map(|(k, col)| (k.clone(), indices.iter().map(|&i| col[i]).collect()))
            .collect();
        let conditions = self
            .conditions
            .iter()
            .map(|(k, col)| (k.clone(), indices.iter().map(|&i| col[i].clone()).collect()))
            .collect();
        EventTable {
            channel_names: self.channel_names.clone(),
            channels,
            condition_names: self.condition_names.clone(),
            conditions,
            len: indices.len(),
            corrections: self.corrections.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_columns() {
        let mut t = EventTable::from_channels([("A", vec![1.0, 2.0])]).unwrap();
        assert!(t.insert_channel("B", vec![1.0]).is_err());
        assert!(t
            .insert_condition("well", vec![ConditionValue::Null; 3])
            .is_err());
    }

    #[test]
    fn replacing_a_column_keeps_its_position() {
        let mut t = EventTable::from_channels([("A", vec![1.0]), ("B", vec![2.0])]).unwrap();
        t.insert_channel("A", vec![9.0]).unwrap();
        assert_eq!(t.channel_names(), ["A", "B"]);
        assert_eq!(t.channel("A"), Some(&[9.0][..]));
    }

    #[test]
    fn take_keeps_conditions_aligned() {
        let mut t = EventTable::from_channels([("A", vec![1.0, 2.0, 3.0])]).unwrap();
        t.insert_condition(
            "well",
            vec![
                ConditionValue::String("A1".into()),
                ConditionValue::String("A2".into()),
                ConditionValue::String("A3".into()),
            ],
        )
        .unwrap();
        let sub = t.take(&[2, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.channel("A"), Some(&[3.0, 1.0][..]));
        assert_eq!(
            sub.condition("well").unwrap()[0],
            ConditionValue::String("A3".into())
        );
    }

    #[test]
    fn numbers_match_across_types() {
        assert!(ConditionValue::Integer(1).matches(&ConditionValue::Float(1.0)));
        assert!(!ConditionValue::Integer(1).matches(&ConditionValue::String("1".into())));
        assert!(ConditionValue::Null.matches(&ConditionValue::Null));
    }

    #[test]
    fn mesh_min_is_three_sigma_below_median() {
        let mut m = ChannelMetadata::new(1000.0, 10.0);
        assert_eq!(m.mesh_min(), -30.0);
        m.af_median = 5.0;
        assert_eq!(m.mesh_min(), -25.0);
        assert!(m.validate("A").is_ok());
        assert!(ChannelMetadata::new(0.5, 1.0).validate("A").is_err());
        assert!(ChannelMetadata::new(1000.0, -1.0).validate("A").is_err());
    }
}
