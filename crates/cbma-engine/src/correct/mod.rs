// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Multiple-comparison correction of a summary statistic map.

| Method        | Null required                      | Voxel p-value                         |
|---------------|------------------------------------|---------------------------------------|
| `voxel-fwe`   | empirical                          | `(#{max ≥ v} + 1) / (n + 1)`          |
| `cluster-fwe` | empirical with cluster statistics  | p of the voxel's cluster, 1 elsewhere |
| `fdr`         | analytic, or pooled empirical      | BH / BY adjusted voxel p-value        |

Every [`SignificanceMap`] holds NaN outside the mask and p-values in (0, 1]
inside it. A voxel is significant at `alpha` when its p-value is `<= alpha`,
so anything significant at a stricter alpha stays significant at a looser one.
*/

pub mod cluster_fwe;
pub mod fdr;
pub mod voxel_fwe;

use std::sync::Arc;

use cbma_config::CorrectionConfigSection;
use cbma_structures::{CbmaError, CbmaResult, GridSpace, Ijk, SummaryStatisticMap};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::null::NullDistribution;
use crate::stats::{neg_log10, p_to_z};

pub use fdr::{correct_p_map, fdr_correct_p_values};

/// Cluster statistic compared against the cluster null
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMetric {
    #[default]
    Size,
    Mass,
}

/// FDR step-up variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FdrProcedure {
    /// Benjamini-Hochberg (independent or positively dependent tests)
    #[default]
    Indep,
    /// Benjamini-Yekutieli (arbitrary dependence)
    Negcorr,
}

/// Closed set of correction methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum CorrectionMethod {
    VoxelFwe,
    ClusterFwe { metric: ClusterMetric },
    Fdr { procedure: FdrProcedure },
}

impl CorrectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            CorrectionMethod::VoxelFwe => "voxel-fwe",
            CorrectionMethod::ClusterFwe { .. } => "cluster-fwe",
            CorrectionMethod::Fdr { .. } => "fdr",
        }
    }

    /// FWE methods need Monte Carlo maxima
    pub fn requires_empirical_null(&self) -> bool {
        !matches!(self, CorrectionMethod::Fdr { .. })
    }
}

impl TryFrom<&CorrectionConfigSection> for CorrectionMethod {
    type Error = CbmaError;

    fn try_from(section: &CorrectionConfigSection) -> CbmaResult<Self> {
        match section.method.as_str() {
            "voxel-fwe" => Ok(CorrectionMethod::VoxelFwe),
            "cluster-fwe" => {
                let metric = match section.cluster_metric.as_str() {
                    "size" => ClusterMetric::Size,
                    "mass" => ClusterMetric::Mass,
                    other => {
                        return Err(CbmaError::config(
                            "correction.cluster_metric",
                            format!("unknown cluster metric '{}'", other),
                        ))
                    }
                };
                Ok(CorrectionMethod::ClusterFwe { metric })
            }
            "fdr" => {
                let procedure = match section.fdr_procedure.as_str() {
                    "indep" => FdrProcedure::Indep,
                    "negcorr" => FdrProcedure::Negcorr,
                    other => {
                        return Err(CbmaError::config(
                            "correction.fdr_procedure",
                            format!("unknown FDR procedure '{}'", other),
                        ))
                    }
                };
                Ok(CorrectionMethod::Fdr { procedure })
            }
            other => Err(CbmaError::config(
                "correction.method",
                format!("unknown correction method '{}'", other),
            )),
        }
    }
}

/// One row of the cluster table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub label: u32,
    pub size: usize,
    pub mass: f64,
    pub peak: Ijk,
    /// Peak position in millimetres
    pub peak_mm: [f64; 3],
    pub peak_value: f64,
    pub p_value: f64,
}

/// Corrected p-values over the grid.
///
/// Immutable once built; thresholds are applied on read.
#[derive(Debug, Clone)]
pub struct SignificanceMap {
    grid: Arc<GridSpace>,
    p_values: Array3<f64>,
    method: CorrectionMethod,
    alpha: f64,
    clusters: Vec<ClusterReport>,
}

impl SignificanceMap {
    pub(crate) fn new(
        grid: Arc<GridSpace>,
        p_values: Array3<f64>,
        method: CorrectionMethod,
        alpha: f64,
        clusters: Vec<ClusterReport>,
    ) -> Self {
        Self {
            grid,
            p_values,
            method,
            alpha,
            clusters,
        }
    }

    pub fn grid(&self) -> &Arc<GridSpace> {
        &self.grid
    }

    /// Corrected p-values; NaN outside the mask
    pub fn p_values(&self) -> &Array3<f64> {
        &self.p_values
    }

    pub fn method(&self) -> CorrectionMethod {
        self.method
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Cluster table (cluster-FWE only), ordered by label
    pub fn clusters(&self) -> &[ClusterReport] {
        &self.clusters
    }

    pub fn p_value_at(&self, ijk: Ijk) -> Option<f64> {
        self.grid
            .in_mask(ijk)
            .then(|| self.p_values[(ijk[0], ijk[1], ijk[2])])
    }

    /// Voxels with `p <= alpha`
    pub fn significant_at(&self, alpha: f64) -> Array3<bool> {
        self.p_values.mapv(|p| p <= alpha)
    }

    /// Voxels significant at the alpha the map was corrected with
    pub fn significant(&self) -> Array3<bool> {
        self.significant_at(self.alpha)
    }

    pub fn n_significant(&self, alpha: f64) -> usize {
        self.p_values.iter().filter(|&&p| p <= alpha).count()
    }

    pub fn is_significant(&self, ijk: Ijk) -> bool {
        self.p_value_at(ijk).is_some_and(|p| p <= self.alpha)
    }

    /// One-sided z-scores of the corrected p-values
    pub fn z_values(&self) -> Array3<f64> {
        self.p_values.mapv(p_to_z)
    }

    pub fn neg_log10_p(&self) -> Array3<f64> {
        self.p_values.mapv(neg_log10)
    }
}

fn check_alpha(alpha: f64) -> CbmaResult<()> {
    if alpha.is_finite() && alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(CbmaError::config(
            "correction.alpha",
            format!("must lie in (0, 1), got {}", alpha),
        ))
    }
}

/// Corrects summary maps with a fixed method and alpha
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corrector {
    method: CorrectionMethod,
    alpha: f64,
}

impl Corrector {
    /// # Errors
    /// `Config` if `alpha` is not in (0, 1).
    pub fn new(method: CorrectionMethod, alpha: f64) -> CbmaResult<Self> {
        check_alpha(alpha)?;
        Ok(Self { method, alpha })
    }

    pub fn method(&self) -> CorrectionMethod {
        self.method
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Check the null can serve this method without doing any work
    pub fn check_null(&self, null: &NullDistribution) -> CbmaResult<()> {
        match self.method {
            CorrectionMethod::VoxelFwe => voxel_fwe::require_empirical(null).map(|_| ()),
            CorrectionMethod::ClusterFwe { .. } => cluster_fwe::require_cluster_null(null).map(|_| ()),
            CorrectionMethod::Fdr { .. } => fdr::require_voxel_model(null),
        }
    }

    /// # Errors
    /// `MethodMismatch` if the null lacks what the method needs.
    pub fn correct(&self, summary: &SummaryStatisticMap, null: &NullDistribution) -> CbmaResult<SignificanceMap> {
        let grid = Arc::clone(summary.grid());
        let (p_values, clusters) = match self.method {
            CorrectionMethod::VoxelFwe => (voxel_fwe::voxel_fwe_p_values(summary, null)?, Vec::new()),
            CorrectionMethod::ClusterFwe { metric } => cluster_fwe::cluster_fwe_p_values(summary, null, metric)?,
            CorrectionMethod::Fdr { procedure } => (fdr::fdr_p_values(summary, null, procedure)?, Vec::new()),
        };
        let map = SignificanceMap::new(grid, p_values, self.method, self.alpha, clusters);
        info!(
            "Correction '{}' at alpha {}: {} of {} voxels significant",
            self.method.name(),
            self.alpha,
            map.n_significant(self.alpha),
            summary.grid().n_mask_voxels()
        );
        Ok(map)
    }
}

/// Correct `summary` against `null` with `method` at `alpha`.
///
/// # Errors
/// `Config` for an alpha outside (0, 1); `MethodMismatch` if the method needs
/// a kind of null the supplied distribution lacks.
pub fn correct(
    summary: &SummaryStatisticMap,
    null: &NullDistribution,
    method: CorrectionMethod,
    alpha: f64,
) -> CbmaResult<SignificanceMap> {
    Corrector::new(method, alpha)?.correct(summary, null)
}
