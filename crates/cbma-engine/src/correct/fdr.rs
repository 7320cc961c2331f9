// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! False discovery rate control over in-mask voxels.

use std::sync::Arc;

use cbma_structures::{CbmaError, CbmaResult, GridSpace, SummaryStatisticMap};
use ndarray::Array3;

use super::{check_alpha, CorrectionMethod, FdrProcedure, SignificanceMap};
use crate::null::NullDistribution;

/// Step-up adjusted p-values (q-values) in input order.
///
/// Ties in `p_values` keep their input order when ranked. Adjusted values
/// are capped at 1 and never decrease with the uncorrected p-value.
///
/// # Errors
/// `Input` if any value is outside [0, 1] or NaN.
pub fn fdr_correct_p_values(p_values: &[f64], procedure: FdrProcedure) -> CbmaResult<Vec<f64>> {
    if let Some((idx, p)) = p_values
        .iter()
        .enumerate()
        .find(|(_, p)| !(0.0..=1.0).contains(*p))
    {
        return Err(CbmaError::input(
            format!("p-value {}", idx),
            format!("must lie in [0, 1], got {}", p),
        ));
    }
    let n = p_values.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let dependence = match procedure {
        FdrProcedure::Indep => 1.0,
        FdrProcedure::Negcorr => (1..=n).map(|i| 1.0 / i as f64).sum(),
    };

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0_f64;
    for (rank, &idx) in order.iter().enumerate().rev() {
        let q = p_values[idx] * n as f64 * dependence / (rank + 1) as f64;
        running_min = running_min.min(q);
        adjusted[idx] = running_min;
    }
    Ok(adjusted)
}

/// Adjust the in-mask values of a p map; NaN outside the mask
fn adjust_masked(grid: &GridSpace, uncorrected: &Array3<f64>, procedure: FdrProcedure) -> CbmaResult<Array3<f64>> {
    let in_mask: Vec<f64> = grid
        .mask_flat_indices()
        .iter()
        .map(|&flat| {
            let ijk = grid.unflatten(flat);
            uncorrected[(ijk[0], ijk[1], ijk[2])]
        })
        .collect();
    let adjusted = fdr_correct_p_values(&in_mask, procedure)?;

    let mut out = grid.masked_fill(f64::NAN, f64::NAN);
    if let Some(slice) = out.as_slice_mut() {
        for (&flat, q) in grid.mask_flat_indices().iter().zip(adjusted) {
            slice[flat] = q;
        }
    }
    Ok(out)
}

/// `MethodMismatch` unless the null yields voxel-level p-values
pub(crate) fn require_voxel_model(null: &NullDistribution) -> CbmaResult<()> {
    if null.has_voxel_model() {
        Ok(())
    } else {
        Err(CbmaError::method_mismatch(
            "fdr",
            "voxel-level null (analytic, or monte-carlo with pooled voxel values)",
            "monte-carlo maxima only",
        ))
    }
}

/// FDR-adjusted p-values of a summary map, using the null's voxel-level model.
///
/// # Errors
/// `MethodMismatch` for a Monte Carlo null generated without voxel pooling.
pub fn fdr_p_values(
    summary: &SummaryStatisticMap,
    null: &NullDistribution,
    procedure: FdrProcedure,
) -> CbmaResult<Array3<f64>> {
    require_voxel_model(null)?;
    let uncorrected = summary.data().mapv(|v| {
        if v.is_nan() {
            f64::NAN
        } else {
            null.voxel_p_value(v).unwrap_or(1.0)
        }
    });
    adjust_masked(summary.grid(), &uncorrected, procedure)
}

/// FDR correction of a caller-supplied map of uncorrected p-values.
///
/// # Errors
/// `Config` for an alpha outside (0, 1), `ShapeMismatch` if the map does not
/// match the grid, `Input` for in-mask values outside [0, 1].
pub fn correct_p_map(
    grid: &Arc<GridSpace>,
    p_map: &Array3<f64>,
    procedure: FdrProcedure,
    alpha: f64,
) -> CbmaResult<SignificanceMap> {
    check_alpha(alpha)?;
    grid.check_shape("p-value map", p_map.dim())?;
    let adjusted = adjust_masked(grid, p_map, procedure)?;
    Ok(SignificanceMap::new(
        Arc::clone(grid),
        adjusted,
        CorrectionMethod::Fdr { procedure },
        alpha,
        Vec::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::{EmpiricalNull, IterationRecord, NullHistogram};
    use cbma_structures::Affine;

    #[test]
    fn test_benjamini_hochberg_reference() {
        let p = [0.01, 0.04, 0.03, 0.005];
        let q = fdr_correct_p_values(&p, FdrProcedure::Indep).unwrap();
        let expected = [0.02, 0.04, 0.04, 0.02];
        for (a, b) in q.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_benjamini_yekutieli_is_more_conservative() {
        let p = [0.01, 0.02, 0.03];
        let bh = fdr_correct_p_values(&p, FdrProcedure::Indep).unwrap();
        let by = fdr_correct_p_values(&p, FdrProcedure::Negcorr).unwrap();
        for (a, b) in bh.iter().zip(&by) {
            assert!(b >= a);
        }
        let c: f64 = 1.0 + 0.5 + 1.0 / 3.0;
        assert!((by[2] - 0.03 * c).abs() < 1e-12);
    }

    #[test]
    fn test_capped_and_validated() {
        let q = fdr_correct_p_values(&[0.9, 0.95], FdrProcedure::Negcorr).unwrap();
        assert!(q.iter().all(|&x| x <= 1.0));
        assert!(fdr_correct_p_values(&[1.5], FdrProcedure::Indep).is_err());
        assert!(fdr_correct_p_values(&[f64::NAN], FdrProcedure::Indep).is_err());
        assert!(fdr_correct_p_values(&[], FdrProcedure::Indep).unwrap().is_empty());
    }

    #[test]
    fn test_correct_p_map() {
        let mut mask = Array3::from_elem((3, 1, 1), true);
        mask[(2, 0, 0)] = false;
        let grid = Arc::new(GridSpace::new(Affine::identity(), mask).unwrap());
        let p_map = Array3::from_shape_vec((3, 1, 1), vec![0.01, 0.5, 7.0]).unwrap();
        let map = correct_p_map(&grid, &p_map, FdrProcedure::Indep, 0.05).unwrap();
        assert!((map.p_values()[(0, 0, 0)] - 0.02).abs() < 1e-12);
        assert!(map.p_values()[(2, 0, 0)].is_nan());
        assert!(map.is_significant([0, 0, 0]));
        assert!(!map.is_significant([1, 0, 0]));

        let wrong = Array3::zeros((2, 1, 1));
        assert!(matches!(
            correct_p_map(&grid, &wrong, FdrProcedure::Indep, 0.05),
            Err(CbmaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_monte_carlo_null_requires_pooled_values() {
        let grid = Arc::new(GridSpace::full((2, 1, 1), Affine::identity()).unwrap());
        let data = Array3::from_shape_vec((2, 1, 1), vec![0.0, 3.0]).unwrap();
        let summary = SummaryStatisticMap::new(Arc::clone(&grid), data).unwrap();
        let records = vec![IterationRecord {
            index: 0,
            seed: 0,
            max_statistic: 1.0,
            max_cluster_size: None,
            max_cluster_mass: None,
        }];

        let maxima_only = NullDistribution::Empirical(EmpiricalNull::from_records(0, records.clone(), None, None));
        let err = fdr_p_values(&summary, &maxima_only, FdrProcedure::Indep).unwrap_err();
        assert!(matches!(err, CbmaError::MethodMismatch { .. }));

        let mut histogram = NullHistogram::new(0.5);
        for v in [0.0, 0.0, 1.0, 1.0] {
            histogram.add(v).unwrap();
        }
        let pooled = NullDistribution::Empirical(EmpiricalNull::from_records(0, records, None, Some(histogram)));
        let q = fdr_p_values(&summary, &pooled, FdrProcedure::Indep).unwrap();
        // Uncorrected p: 5/5 at 0.0 and 1/5 at 3.0
        assert_eq!(q[(0, 0, 0)], 1.0);
        assert!((q[(1, 0, 0)] - 0.4).abs() < 1e-12);
    }
}
