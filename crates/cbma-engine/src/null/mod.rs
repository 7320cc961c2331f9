// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Null distributions of the summary statistic under spatial randomness.

Two generators produce a [`NullDistribution`]:

- **Monte Carlo** ([`monte_carlo`]): every iteration redraws each study's
  peaks from a spatial model (count and weights preserved), re-runs the
  kernel transformer and estimator, and records the global maximum plus,
  when a primary threshold is configured, the largest cluster size and mass.
  Iteration `i` draws from `StdRng::seed_from_u64(mix(seed, i))`, so results
  are bit-identical for a seed regardless of worker count or scheduling.
- **Analytic** ([`analytic`]): the value histograms of the observed kernel
  maps are combined under the combination rule into a location-independent
  distribution of the voxel statistic. Only voxel-level (FDR) inference is
  possible with it.
*/

pub mod analytic;
pub mod monte_carlo;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cbma_config::NullConfigSection;
use cbma_structures::{CbmaError, CbmaResult, GridSpace, StudyCollection};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cancel::CancellationToken;
use crate::clusters::Connectivity;
use crate::estimator::CombinationRule;
use crate::kernel::{KernelConfig, KernelTransformer};

pub use analytic::AnalyticNull;
pub use monte_carlo::EmpiricalNull;

/// Fewest studies for which a null distribution is generated
pub const MIN_STUDIES_FOR_NULL: usize = 2;

/// Default histogram bin width for voxel-level null values
pub const DEFAULT_BIN_WIDTH: f64 = 1e-4;

/// Largest bin index a null histogram may address.
///
/// With the default bin width this admits statistics up to about 1.07e5.
pub const MAX_HISTOGRAM_BINS: usize = 1 << 30;

/// Where redrawn Monte Carlo peaks may land
#[derive(Debug, Clone, PartialEq)]
pub enum NullSpatialModel {
    /// Every in-mask voxel equally likely
    UniformMask,
    /// In-mask voxels weighted by a non-negative grid-shaped density
    EmpiricalDensity(Arc<Array3<f64>>),
}

impl NullSpatialModel {
    pub fn name(&self) -> &'static str {
        match self {
            NullSpatialModel::UniformMask => "uniform-mask",
            NullSpatialModel::EmpiricalDensity(_) => "empirical-density",
        }
    }
}

/// Closed set of null generation methods
#[derive(Debug, Clone, PartialEq)]
pub enum NullMethod {
    MonteCarlo {
        n_iterations: usize,
        seed: u64,
        spatial_model: NullSpatialModel,
    },
    Analytic {
        bin_width: f64,
    },
}

impl NullMethod {
    /// Uniform-mask Monte Carlo
    pub fn monte_carlo(n_iterations: usize, seed: u64) -> Self {
        NullMethod::MonteCarlo {
            n_iterations,
            seed,
            spatial_model: NullSpatialModel::UniformMask,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NullMethod::MonteCarlo { .. } => "monte-carlo",
            NullMethod::Analytic { .. } => "analytic",
        }
    }
}

impl TryFrom<&NullConfigSection> for NullMethod {
    type Error = CbmaError;

    fn try_from(section: &NullConfigSection) -> CbmaResult<Self> {
        match section.method.as_str() {
            "monte-carlo" => {
                if section.n_iterations == 0 {
                    return Err(CbmaError::config("null.n_iterations", "must be at least 1"));
                }
                let spatial_model = match section.spatial_model.as_str() {
                    "uniform-mask" => NullSpatialModel::UniformMask,
                    other => {
                        return Err(CbmaError::config(
                            "null.spatial_model",
                            format!("unknown spatial model '{}'", other),
                        ))
                    }
                };
                Ok(NullMethod::MonteCarlo {
                    n_iterations: section.n_iterations,
                    seed: section.seed,
                    spatial_model,
                })
            }
            "analytic" => {
                if !(section.bin_width.is_finite() && section.bin_width > 0.0) {
                    return Err(CbmaError::config("null.bin_width", "must be a positive finite number"));
                }
                Ok(NullMethod::Analytic {
                    bin_width: section.bin_width,
                })
            }
            other => Err(CbmaError::config(
                "null.method",
                format!("unknown null method '{}'", other),
            )),
        }
    }
}

/// Primary threshold and neighbourhood used for cluster statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterThreshold {
    pub primary_threshold: f64,
    pub connectivity: Connectivity,
}

/// What one Monte Carlo iteration produced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: usize,
    /// Seed of this iteration's random stream
    pub seed: u64,
    pub max_statistic: f64,
    pub max_cluster_size: Option<usize>,
    pub max_cluster_mass: Option<f64>,
}

/// Fixed-width histogram of non-negative values.
///
/// Bin `b` holds values in `[b·w, (b+1)·w)`. Only occupied bins are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullHistogram {
    bin_width: f64,
    counts: BTreeMap<usize, u64>,
    total: u64,
}

impl NullHistogram {
    pub fn new(bin_width: f64) -> Self {
        Self {
            bin_width,
            counts: BTreeMap::new(),
            total: 0,
        }
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// Occupied bins and their counts, ascending by bin
    pub fn counts(&self) -> &BTreeMap<usize, u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bin of `value`, saturating at `usize::MAX`
    fn bin_of(&self, value: f64) -> usize {
        (value.max(0.0) / self.bin_width).floor() as usize
    }

    /// # Errors
    /// `Config` naming `null.bin_width` if `value` lies beyond [`MAX_HISTOGRAM_BINS`] bins.
    pub fn add(&mut self, value: f64) -> CbmaResult<()> {
        check_bin_range(value, self.bin_width)?;
        *self.counts.entry(self.bin_of(value)).or_insert(0) += 1;
        self.total += 1;
        Ok(())
    }

    pub fn merge(&mut self, other: &NullHistogram) {
        for (&bin, &count) in &other.counts {
            *self.counts.entry(bin).or_insert(0) += count;
        }
        self.total += other.total;
    }

    /// Number of recorded values falling in `value`'s bin or above
    pub fn count_at_least(&self, value: f64) -> u64 {
        self.counts.range(self.bin_of(value)..).map(|(_, &c)| c).sum()
    }

    /// `(#{x ≥ v} + 1) / (total + 1)`, at bin resolution
    pub fn p_value(&self, value: f64) -> f64 {
        (self.count_at_least(value) as f64 + 1.0) / (self.total as f64 + 1.0)
    }
}

/// Fail unless values up to `upper_bound` fit in [`MAX_HISTOGRAM_BINS`] bins of `bin_width`
pub(crate) fn check_bin_range(upper_bound: f64, bin_width: f64) -> CbmaResult<()> {
    if upper_bound.is_nan() || upper_bound / bin_width >= MAX_HISTOGRAM_BINS as f64 {
        return Err(CbmaError::config(
            "null.bin_width",
            format!(
                "null statistics up to {} need more than {} bins of width {}; use a wider bin",
                upper_bound, MAX_HISTOGRAM_BINS, bin_width
            ),
        ));
    }
    Ok(())
}

/// Null distribution, tagged by how it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NullDistribution {
    Empirical(EmpiricalNull),
    Analytic(AnalyticNull),
}

impl NullDistribution {
    /// `"empirical"` or `"analytic"`
    pub fn kind(&self) -> &'static str {
        match self {
            NullDistribution::Empirical(_) => "empirical",
            NullDistribution::Analytic(_) => "analytic",
        }
    }

    pub fn as_empirical(&self) -> Option<&EmpiricalNull> {
        match self {
            NullDistribution::Empirical(null) => Some(null),
            NullDistribution::Analytic(_) => None,
        }
    }

    pub fn as_analytic(&self) -> Option<&AnalyticNull> {
        match self {
            NullDistribution::Analytic(null) => Some(null),
            NullDistribution::Empirical(_) => None,
        }
    }

    /// Whether voxel-level p-values are available (analytic, or pooled Monte Carlo values)
    pub fn has_voxel_model(&self) -> bool {
        match self {
            NullDistribution::Empirical(null) => null.voxel_histogram().is_some(),
            NullDistribution::Analytic(_) => true,
        }
    }

    /// Uncorrected voxel-level p-value of an observed statistic (never 0).
    ///
    /// `None` for a Monte Carlo null generated without pooled voxel values.
    pub fn voxel_p_value(&self, value: f64) -> Option<f64> {
        match self {
            NullDistribution::Empirical(null) => null.voxel_histogram().map(|h| h.p_value(value)),
            NullDistribution::Analytic(null) => Some(null.p_value(value)),
        }
    }
}

/// Generates null distributions for a fixed kernel, rule and method
#[derive(Debug, Clone)]
pub struct NullDistributionGenerator {
    kernel: KernelConfig,
    rule: CombinationRule,
    method: NullMethod,
    cluster_threshold: Option<ClusterThreshold>,
    bin_width: f64,
    pool_voxel_values: bool,
    max_workers: usize,
}

impl NullDistributionGenerator {
    pub fn new(kernel: KernelConfig, rule: CombinationRule, method: NullMethod) -> Self {
        Self {
            kernel,
            rule,
            method,
            cluster_threshold: None,
            bin_width: DEFAULT_BIN_WIDTH,
            pool_voxel_values: false,
            max_workers: 0,
        }
    }

    /// Also record per-iteration cluster statistics (Monte Carlo only)
    pub fn with_cluster_threshold(mut self, threshold: ClusterThreshold) -> Self {
        self.cluster_threshold = Some(threshold);
        self
    }

    /// Bin width of the pooled voxel-value histogram (Monte Carlo only)
    pub fn with_bin_width(mut self, bin_width: f64) -> Self {
        self.bin_width = bin_width;
        self
    }

    /// Pool every in-mask null value into a histogram (Monte Carlo only).
    ///
    /// Needed for FDR against a Monte Carlo null; FWE methods only read the
    /// per-iteration maxima.
    pub fn with_voxel_pooling(mut self, pool: bool) -> Self {
        self.pool_voxel_values = pool;
        self
    }

    /// Worker threads for Monte Carlo iterations (0 = one per core)
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn method(&self) -> &NullMethod {
        &self.method
    }

    pub fn cluster_threshold(&self) -> Option<ClusterThreshold> {
        self.cluster_threshold
    }

    fn check_inputs(&self, studies: &StudyCollection) -> CbmaResult<()> {
        if studies.len() < MIN_STUDIES_FOR_NULL {
            return Err(CbmaError::InsufficientData {
                n_studies: studies.len(),
                minimum: MIN_STUDIES_FOR_NULL,
            });
        }
        if !(self.bin_width.is_finite() && self.bin_width > 0.0) {
            return Err(CbmaError::config("null.bin_width", "must be a positive finite number"));
        }
        Ok(())
    }

    fn transformer(&self, studies: &StudyCollection, grid: &Arc<GridSpace>) -> CbmaResult<KernelTransformer> {
        let mut transformer = KernelTransformer::new(self.kernel, Arc::clone(grid))?;
        transformer.prepare(studies)?;
        Ok(transformer)
    }

    /// Generate the null distribution.
    ///
    /// # Errors
    /// `InsufficientData` below [`MIN_STUDIES_FOR_NULL`] studies, `Input` for
    /// unusable studies or spatial densities, `Cancelled` if `cancel` fires
    /// before all iterations ran (partial results are discarded).
    pub fn generate(
        &self,
        studies: &StudyCollection,
        grid: &Arc<GridSpace>,
        cancel: &CancellationToken,
    ) -> CbmaResult<NullDistribution> {
        self.check_inputs(studies)?;
        let transformer = self.transformer(studies, grid)?;
        let started = Instant::now();

        let null = match &self.method {
            NullMethod::MonteCarlo {
                n_iterations,
                seed,
                spatial_model,
            } => {
                info!(
                    "Generating Monte Carlo null: {} studies, {} iterations, seed {}, spatial model '{}'",
                    studies.len(),
                    n_iterations,
                    seed,
                    spatial_model.name()
                );
                let plan = monte_carlo::MonteCarloPlan::new(
                    transformer,
                    self.rule,
                    studies,
                    grid,
                    *seed,
                    spatial_model,
                    self.cluster_threshold,
                    self.pool_voxel_values.then_some(self.bin_width),
                )?;
                NullDistribution::Empirical(plan.run(*n_iterations, self.max_workers, cancel)?)
            }
            NullMethod::Analytic { bin_width } => {
                info!(
                    "Computing analytic null: {} studies, bin width {}",
                    studies.len(),
                    bin_width
                );
                NullDistribution::Analytic(analytic::analytic_null(
                    &transformer,
                    self.rule,
                    studies,
                    *bin_width,
                )?)
            }
        };

        info!(
            "Null distribution ({}) ready in {:.2?}",
            null.kind(),
            started.elapsed()
        );
        Ok(null)
    }

    /// Recompute a single Monte Carlo iteration.
    ///
    /// Returns exactly the record stored at `index` by [`Self::generate`]
    /// with the same inputs.
    ///
    /// # Errors
    /// `MethodMismatch` for an analytic method; otherwise as for `generate`.
    pub fn replay_iteration(
        &self,
        studies: &StudyCollection,
        grid: &Arc<GridSpace>,
        index: usize,
    ) -> CbmaResult<IterationRecord> {
        let NullMethod::MonteCarlo {
            seed, spatial_model, ..
        } = &self.method
        else {
            return Err(CbmaError::method_mismatch("replay", "monte-carlo", self.method.name()));
        };
        self.check_inputs(studies)?;
        let transformer = self.transformer(studies, grid)?;
        let plan = monte_carlo::MonteCarloPlan::new(
            transformer,
            self.rule,
            studies,
            grid,
            *seed,
            spatial_model,
            self.cluster_threshold,
            None,
        )?;
        plan.run_iteration(index, None)
    }
}

/// Uniform-mask Monte Carlo null for the given kernel and rule.
///
/// # Errors
/// As for [`NullDistributionGenerator::generate`].
pub fn generate(
    studies: &StudyCollection,
    grid: &Arc<GridSpace>,
    kernel: &KernelConfig,
    rule: CombinationRule,
    n_iterations: usize,
    seed: u64,
) -> CbmaResult<NullDistribution> {
    NullDistributionGenerator::new(*kernel, rule, NullMethod::monte_carlo(n_iterations, seed))
        .generate(studies, grid, &CancellationToken::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_counts_and_p() {
        let mut hist = NullHistogram::new(0.1);
        for v in [0.0, 0.05, 0.15, 0.35, 0.35] {
            hist.add(v).unwrap();
        }
        assert_eq!(hist.total(), 5);
        assert_eq!(hist.counts(), &BTreeMap::from([(0, 2), (1, 1), (3, 2)]));
        assert_eq!(hist.count_at_least(0.3), 2);
        assert_eq!(hist.p_value(0.3), 0.5);
        assert_eq!(hist.p_value(5.0), 1.0 / 6.0);
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = NullHistogram::new(1.0);
        a.add(0.5).unwrap();
        let mut b = NullHistogram::new(1.0);
        b.add(3.5).unwrap();
        b.add(0.2).unwrap();
        a.merge(&b);
        assert_eq!(a.counts(), &BTreeMap::from([(0, 2), (3, 1)]));
        assert_eq!(a.total(), 3);
    }

    #[test]
    fn test_histogram_stores_only_occupied_bins() {
        let mut hist = NullHistogram::new(DEFAULT_BIN_WIDTH);
        hist.add(0.0).unwrap();
        hist.add(2000.0).unwrap();
        assert_eq!(hist.counts().len(), 2);
        assert_eq!(hist.count_at_least(1000.0), 1);
    }

    #[test]
    fn test_histogram_rejects_values_beyond_bin_limit() {
        let mut hist = NullHistogram::new(DEFAULT_BIN_WIDTH);
        let err = hist.add(1e12).unwrap_err();
        assert!(matches!(err, CbmaError::Config { ref option, .. } if option == "null.bin_width"));
        assert_eq!(hist.total(), 0);
        assert!(hist.add(f64::NAN).is_err());
    }

    #[test]
    fn test_method_from_section() {
        let mut section = NullConfigSection::default();
        section.n_iterations = 10;
        section.seed = 3;
        assert_eq!(NullMethod::try_from(&section).unwrap(), NullMethod::monte_carlo(10, 3));

        section.method = "analytic".to_string();
        assert!(matches!(
            NullMethod::try_from(&section).unwrap(),
            NullMethod::Analytic { .. }
        ));

        section.method = "bootstrap".to_string();
        assert!(NullMethod::try_from(&section).is_err());
    }
}
