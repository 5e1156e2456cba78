#![allow(dead_code)]

use std::collections::BTreeMap;

use piecewise_bleed::{ChannelMetadata, EventTable, SingleColorControl};

pub const RANGE: f64 = 262_144.0;
pub const AF_STDEV: f64 = 10.0;

/// 1000 evenly spaced primary values over `[0, 10000]`.
pub fn primary() -> Vec<f64> {
    (0..1000).map(|i| i as f64 * 10_000.0 / 999.0).collect()
}

/// Two-channel controls where `A` spills `a_to_b` into `B` and `B` spills
/// `b_to_a` into `A`, both linearly.
pub fn linear_controls(a_to_b: f64, b_to_a: f64) -> BTreeMap<String, SingleColorControl> {
    let x = primary();
    let a_ctrl = EventTable::from_channels([
        ("A", x.clone()),
        ("B", x.iter().map(|v| a_to_b * v).collect()),
    ])
    .unwrap();
    let b_ctrl = EventTable::from_channels([
        ("A", x.iter().map(|v| b_to_a * v).collect()),
        ("B", x),
    ])
    .unwrap();
    BTreeMap::from([("A".to_string(), a_ctrl), ("B".to_string(), b_ctrl)])
}

pub fn metadata(channels: &[&str]) -> BTreeMap<String, ChannelMetadata> {
    channels
        .iter()
        .map(|c| (c.to_string(), ChannelMetadata::new(RANGE, AF_STDEV)))
        .collect()
}

/// Exact solution of `[[1, b_to_a], [a_to_b, 1]] t = p`.
pub fn solve_2x2(a_to_b: f64, b_to_a: f64, p: [f64; 2]) -> [f64; 2] {
    let det = 1.0 - a_to_b * b_to_a;
    [
        (p[0] - b_to_a * p[1]) / det,
        (p[1] - a_to_b * p[0]) / det,
    ]
}

pub fn events(rows: &[[f64; 2]]) -> EventTable {
    EventTable::from_channels([
        ("A", rows.iter().map(|r| r[0]).collect()),
        ("B", rows.iter().map(|r| r[1]).collect()),
    ])
    .unwrap()
}
