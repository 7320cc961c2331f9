// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Voxel-level family-wise error correction against the maximum-statistic null.

use cbma_structures::{CbmaError, CbmaResult, SummaryStatisticMap};
use ndarray::Array3;

use crate::null::{EmpiricalNull, NullDistribution};
use crate::stats::empirical_p;

pub(crate) fn require_empirical(null: &NullDistribution) -> CbmaResult<&EmpiricalNull> {
    null.as_empirical()
        .ok_or_else(|| CbmaError::method_mismatch("voxel-fwe", "empirical", null.kind()))
}

/// FWE p-value of every in-mask voxel; NaN outside the mask
pub fn voxel_fwe_p_values(summary: &SummaryStatisticMap, null: &NullDistribution) -> CbmaResult<Array3<f64>> {
    let null = require_empirical(null)?;
    let maxima = null.max_statistic();
    Ok(summary.data().mapv(|v| {
        if v.is_nan() {
            f64::NAN
        } else {
            empirical_p(maxima, v)
        }
    }))
}
