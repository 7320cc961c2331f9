// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cluster-level family-wise error correction.
//!
//! The observed map is thresholded with the primary threshold and
//! connectivity recorded in the null, so observed and null clusters are
//! always formed the same way.

use cbma_structures::{CbmaError, CbmaResult, SummaryStatisticMap};
use ndarray::Array3;
use tracing::debug;

use super::{ClusterMetric, ClusterReport};
use crate::clusters::find_clusters;
use crate::null::{EmpiricalNull, NullDistribution};
use crate::stats::empirical_p;

pub(crate) fn require_cluster_null(null: &NullDistribution) -> CbmaResult<&EmpiricalNull> {
    let empirical = null
        .as_empirical()
        .ok_or_else(|| CbmaError::method_mismatch("cluster-fwe", "empirical cluster", null.kind()))?;
    if empirical.cluster_threshold().is_none() {
        return Err(CbmaError::method_mismatch(
            "cluster-fwe",
            "empirical cluster",
            "empirical without cluster statistics",
        ));
    }
    Ok(empirical)
}

/// Per-voxel cluster p-values (1 outside clusters, NaN outside the mask) and the cluster table
pub fn cluster_fwe_p_values(
    summary: &SummaryStatisticMap,
    null: &NullDistribution,
    metric: ClusterMetric,
) -> CbmaResult<(Array3<f64>, Vec<ClusterReport>)> {
    let empirical = require_cluster_null(null)?;
    let threshold = empirical
        .cluster_threshold()
        .ok_or_else(|| CbmaError::method_mismatch("cluster-fwe", "empirical cluster", "empirical"))?;
    let null_values = match metric {
        ClusterMetric::Size => empirical.max_cluster_size(),
        ClusterMetric::Mass => empirical.max_cluster_mass(),
    }
    .ok_or_else(|| CbmaError::method_mismatch("cluster-fwe", "empirical cluster", "empirical"))?;

    let grid = summary.grid();
    let values: Vec<f64> = summary.data().iter().copied().collect();
    let clusters = find_clusters(&values, grid, threshold.primary_threshold, threshold.connectivity);
    debug!(
        "Found {} clusters above {} ({}-connectivity)",
        clusters.len(),
        threshold.primary_threshold,
        threshold.connectivity.n_neighbours()
    );

    let mut p_values = grid.masked_fill(1.0, f64::NAN);
    let mut reports = Vec::with_capacity(clusters.len());
    if let Some(slice) = p_values.as_slice_mut() {
        for cluster in &clusters {
            let observed = match metric {
                ClusterMetric::Size => cluster.size as f64,
                ClusterMetric::Mass => cluster.mass,
            };
            let p_value = empirical_p(null_values, observed);
            for &flat in &cluster.voxels {
                slice[flat] = p_value;
            }
            reports.push(ClusterReport {
                label: cluster.label,
                size: cluster.size,
                mass: cluster.mass,
                peak: cluster.peak,
                peak_mm: grid.vox_to_mm(cluster.peak),
                peak_value: cluster.peak_value,
                p_value,
            });
        }
    }
    Ok((p_values, reports))
}
