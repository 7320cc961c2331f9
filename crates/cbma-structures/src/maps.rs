// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Dense per-study and summary maps over a [`GridSpace`].

use crate::grid::{GridSpace, Ijk};
use crate::error::{CbmaError, CbmaResult};
use ndarray::Array3;
use std::sync::Arc;

/// Per-study kernel map (zero outside the mask).
///
/// Transient: produced by the kernel transformer and consumed by the estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMap {
    study_id: String,
    sample_size: Option<u32>,
    data: Array3<f64>,
}

impl KernelMap {
    pub fn new(study_id: impl Into<String>, sample_size: Option<u32>, data: Array3<f64>) -> Self {
        Self {
            study_id: study_id.into(),
            sample_size,
            data,
        }
    }

    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    pub fn sample_size(&self) -> Option<u32> {
        self.sample_size
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn value_at(&self, ijk: Ijk) -> f64 {
        self.data[(ijk[0], ijk[1], ijk[2])]
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().copied().fold(0.0, f64::max)
    }

    pub fn into_data(self) -> Array3<f64> {
        self.data
    }
}

/// Combined statistic over the grid; NaN outside the mask.
///
/// Tagged with the grid it was computed on so it can be written out by an
/// external image writer without extra bookkeeping.
#[derive(Debug, Clone)]
pub struct SummaryStatisticMap {
    grid: Arc<GridSpace>,
    data: Array3<f64>,
}

impl SummaryStatisticMap {
    /// Wrap a dense array. Cells outside the mask are forced to NaN.
    ///
    /// # Errors
    /// `ShapeMismatch` if the array shape differs from the grid, `Input`
    /// naming the voxel if an in-mask value is not finite.
    pub fn new(grid: Arc<GridSpace>, data: Array3<f64>) -> CbmaResult<Self> {
        grid.check_shape("summary statistic map", data.dim())?;
        let mut data = data.as_standard_layout().into_owned();
        for ((i, j, k), value) in data.indexed_iter_mut() {
            if !grid.mask()[(i, j, k)] {
                *value = f64::NAN;
            } else if !value.is_finite() {
                return Err(CbmaError::input(
                    format!("voxel {:?}", [i, j, k]),
                    format!("summary statistic is not finite ({})", value),
                ));
            }
        }
        Ok(Self { grid, data })
    }

    pub fn grid(&self) -> &Arc<GridSpace> {
        &self.grid
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Value at a voxel, `None` outside the mask
    pub fn value_at(&self, ijk: Ijk) -> Option<f64> {
        if self.grid.in_mask(ijk) {
            Some(self.data[(ijk[0], ijk[1], ijk[2])])
        } else {
            None
        }
    }

    /// In-mask values in mask iteration order
    pub fn masked_values(&self) -> Vec<f64> {
        self.data
            .iter()
            .zip(self.grid.mask().iter())
            .filter_map(|(&v, &inside)| inside.then_some(v))
            .collect()
    }

    /// Voxel holding the largest in-mask value (first in iteration order on ties)
    pub fn peak(&self) -> (Ijk, f64) {
        let mut best = (self.grid.mask_flat_indices()[0], f64::NEG_INFINITY);
        for (flat, (&v, &inside)) in self.data.iter().zip(self.grid.mask().iter()).enumerate() {
            if inside && v > best.1 {
                best = (flat, v);
            }
        }
        (self.grid.unflatten(best.0), best.1)
    }

    pub fn max_value(&self) -> f64 {
        self.peak().1
    }
}
