//! Multilinear interpolation on a rectilinear grid.
//!
//! Locating the enclosing cell is shared by every channel's values, so a
//! query is split in two: [`RectilinearGrid::locate`] once per event, then
//! [`RectilinearGrid::interpolate`] once per channel. Queries outside the
//! grid are never extrapolated.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectilinearGrid {
    axes: Vec<Vec<f64>>,
    /// C-order strides: the last axis is contiguous.
    strides: Vec<usize>,
}

/// The grid cell enclosing a query point plus the fractional position along
/// each axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    base: usize,
    fracs: Vec<f64>,
}

impl RectilinearGrid {
    /// `None` unless every axis has at least two strictly increasing points.
    pub fn new(axes: Vec<Vec<f64>>) -> Option<Self> {
        let ok = !axes.is_empty()
            && axes
                .iter()
                .all(|a| a.len() >= 2 && a.windows(2).all(|w| w[1] > w[0]));
        if !ok {
            return None;
        }
        let mut strides = vec![1usize; axes.len()];
        for d in (0..axes.len() - 1).rev() {
            strides[d] = strides[d + 1] * axes[d + 1].len();
        }
        Some(Self { axes, strides })
    }

    pub fn dims(&self) -> usize {
        self.axes.len()
    }

    /// Number of grid nodes, i.e. the length of a values array.
    pub fn len(&self) -> usize {
        self.strides[0] * self.axes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn axes(&self) -> &[Vec<f64>] {
        &self.axes
    }

    /// Find the cell containing `x`. `None` when any coordinate is NaN or
    /// outside its axis; the axis end points themselves are inside.
    pub fn locate(&self, x: &[f64]) -> Option<Cell> {
        debug_assert_eq!(x.len(), self.dims());
        let mut base = 0;
        let mut fracs = Vec::with_capacity(self.dims());
        for (d, (axis, &v)) in self.axes.iter().zip(x).enumerate() {
            let (lo, hi) = (axis[0], axis[axis.len() - 1]);
            if !(v >= lo && v <= hi) {
                return None;
            }
            let i = axis
                .partition_point(|&a| a <= v)
                .saturating_sub(1)
                .min(axis.len() - 2);
            fracs.push((v - axis[i]) / (axis[i + 1] - axis[i]));
            base += i * self.strides[d];
        }
        Some(Cell { base, fracs })
    }

    /// Weighted sum of the cell's corner values. A NaN corner with non-zero
    /// weight makes the result missing.
    pub fn interpolate(&self, cell: &Cell, values: &[f64]) -> Option<f64> {
        debug_assert_eq!(values.len(), self.len());
        let k = self.dims();
        let mut acc = 0.0;
        for corner in 0..(1usize << k) {
            let mut weight = 1.0;
            let mut idx = cell.base;
            for d in 0..k {
                if corner & (1 << d) != 0 {
                    weight *= cell.fracs[d];
                    idx += self.strides[d];
                } else {
                    weight *= 1.0 - cell.fracs[d];
                }
            }
            if weight == 0.0 {
                continue;
            }
            let v = values[idx];
            if !v.is_finite() {
                return None;
            }
            acc += weight * v;
        }
        Some(acc)
    }

    /// Convenience for a single query.
    pub fn eval(&self, values: &[f64], x: &[f64]) -> Option<f64> {
        self.locate(x).and_then(|cell| self.interpolate(&cell, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_2d() -> RectilinearGrid {
        RectilinearGrid::new(vec![vec![-1.0, 0.0, 2.0, 10.0], vec![0.0, 5.0, 100.0]]).unwrap()
    }

    fn tabulate(grid: &RectilinearGrid, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
        let (a, b) = (&grid.axes()[0], &grid.axes()[1]);
        a.iter()
            .flat_map(|&x| b.iter().map(move |&y| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect()
    }

    #[test]
    fn reproduces_bilinear_functions() {
        let grid = grid_2d();
        let f = |x: f64, y: f64| 3.0 + 2.0 * x - 0.5 * y + 0.1 * x * y;
        let values = tabulate(&grid, f);
        for &(x, y) in &[(-1.0, 0.0), (0.3, 2.2), (1.99, 99.0), (10.0, 100.0), (7.5, 50.0)] {
            assert_relative_eq!(grid.eval(&values, &[x, y]).unwrap(), f(x, y), epsilon = 1e-9);
        }
    }

    #[test]
    fn never_extrapolates() {
        let grid = grid_2d();
        let values = tabulate(&grid, |x, y| x + y);
        assert_eq!(grid.eval(&values, &[-1.0001, 1.0]), None);
        assert_eq!(grid.eval(&values, &[0.0, 100.5]), None);
        assert_eq!(grid.eval(&values, &[f64::NAN, 1.0]), None);
    }

    #[test]
    fn missing_corner_poisons_only_its_cells() {
        let grid = grid_2d();
        let mut values = tabulate(&grid, |x, y| x + y);
        // node (x=10, y=100) is the last one
        let last = values.len() - 1;
        values[last] = f64::NAN;
        assert_eq!(grid.eval(&values, &[9.0, 90.0]), None);
        assert!(grid.eval(&values, &[1.0, 1.0]).is_some());
        // on the cell's lower edge the NaN corner has zero weight
        assert!(grid.eval(&values, &[2.0, 50.0]).is_some());
    }

    #[test]
    fn rejects_bad_axes() {
        assert!(RectilinearGrid::new(vec![vec![0.0]]).is_none());
        assert!(RectilinearGrid::new(vec![vec![0.0, 0.0]]).is_none());
        assert!(RectilinearGrid::new(vec![]).is_none());
    }
}
