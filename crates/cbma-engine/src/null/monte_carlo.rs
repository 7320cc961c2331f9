// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Monte Carlo null generation over a dedicated rayon pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cbma_structures::{CbmaError, CbmaResult, GridSpace, Ijk, StudyCollection};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{check_bin_range, ClusterThreshold, IterationRecord, NullHistogram, NullSpatialModel};
use crate::cancel::CancellationToken;
use crate::clusters::max_cluster_metrics;
use crate::estimator::{CombinationRule, Estimator};
use crate::kernel::{KernelTransformer, SparseKernelMap, WeightedPeak};
use crate::stats::{empirical_p, iteration_seed};

/// Null distribution built from Monte Carlo iterations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalNull {
    seed: u64,
    records: Vec<IterationRecord>,
    max_statistic: Vec<f64>,
    max_cluster_size: Option<Vec<f64>>,
    max_cluster_mass: Option<Vec<f64>>,
    cluster_threshold: Option<ClusterThreshold>,
    voxel_histogram: Option<NullHistogram>,
}

impl EmpiricalNull {
    /// Assemble from per-iteration records (any order) and the pooled histogram, if any
    pub fn from_records(
        seed: u64,
        mut records: Vec<IterationRecord>,
        cluster_threshold: Option<ClusterThreshold>,
        voxel_histogram: Option<NullHistogram>,
    ) -> Self {
        records.sort_by_key(|r| r.index);

        let sorted = |values: Vec<f64>| {
            let mut values = values;
            values.sort_by(f64::total_cmp);
            values
        };
        let max_statistic = sorted(records.iter().map(|r| r.max_statistic).collect());
        let (max_cluster_size, max_cluster_mass) = if cluster_threshold.is_some() {
            (
                Some(sorted(
                    records
                        .iter()
                        .map(|r| r.max_cluster_size.unwrap_or(0) as f64)
                        .collect(),
                )),
                Some(sorted(
                    records.iter().map(|r| r.max_cluster_mass.unwrap_or(0.0)).collect(),
                )),
            )
        } else {
            (None, None)
        };

        Self {
            seed,
            records,
            max_statistic,
            max_cluster_size,
            max_cluster_mass,
            cluster_threshold,
            voxel_histogram,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn n_iterations(&self) -> usize {
        self.records.len()
    }

    /// Per-iteration records ordered by iteration index
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Maximum statistic of every iteration, ascending
    pub fn max_statistic(&self) -> &[f64] {
        &self.max_statistic
    }

    /// Largest cluster size per iteration, ascending (if recorded)
    pub fn max_cluster_size(&self) -> Option<&[f64]> {
        self.max_cluster_size.as_deref()
    }

    /// Largest cluster mass per iteration, ascending (if recorded)
    pub fn max_cluster_mass(&self) -> Option<&[f64]> {
        self.max_cluster_mass.as_deref()
    }

    pub fn cluster_threshold(&self) -> Option<ClusterThreshold> {
        self.cluster_threshold
    }

    /// Pooled histogram of every in-mask null value of every iteration.
    ///
    /// Only present when voxel pooling was requested.
    pub fn voxel_histogram(&self) -> Option<&NullHistogram> {
        self.voxel_histogram.as_ref()
    }

    /// FWE p-value of a voxel statistic against the maximum-statistic null
    pub fn fwe_p_value(&self, value: f64) -> f64 {
        empirical_p(&self.max_statistic, value)
    }
}

/// Where redrawn peaks land
enum VoxelSampler {
    Uniform,
    Weighted(WeightedIndex<f64>),
}

impl VoxelSampler {
    fn new(model: &NullSpatialModel, grid: &GridSpace) -> CbmaResult<Self> {
        match model {
            NullSpatialModel::UniformMask => Ok(VoxelSampler::Uniform),
            NullSpatialModel::EmpiricalDensity(density) => {
                grid.check_shape("null spatial density", density.dim())?;
                let mut weights = Vec::with_capacity(grid.n_mask_voxels());
                for &flat in grid.mask_flat_indices() {
                    let ijk = grid.unflatten(flat);
                    let w = density[(ijk[0], ijk[1], ijk[2])];
                    if !w.is_finite() || w < 0.0 {
                        return Err(CbmaError::input(
                            "null spatial density",
                            format!("invalid weight {} at voxel {:?}", w, ijk),
                        ));
                    }
                    weights.push(w);
                }
                WeightedIndex::new(weights).map(VoxelSampler::Weighted).map_err(|e| {
                    CbmaError::input(
                        "null spatial density",
                        format!("cannot sample from density: {}", e),
                    )
                })
            }
        }
    }

    fn sample(&self, rng: &mut StdRng, grid: &GridSpace) -> Ijk {
        let mask = grid.mask_flat_indices();
        let slot = match self {
            VoxelSampler::Uniform => rng.gen_range(0..mask.len()),
            VoxelSampler::Weighted(dist) => dist.sample(rng),
        };
        grid.unflatten(mask[slot])
    }
}

/// What each study keeps across iterations
struct PlannedStudy {
    id: String,
    sample_size: Option<u32>,
    study_weight: f64,
    weights: Vec<f64>,
}

/// Upper bound of any combined null value, `None` if the kernel gives none
fn statistic_bound(
    transformer: &KernelTransformer,
    rule: CombinationRule,
    studies: &[PlannedStudy],
) -> CbmaResult<Option<f64>> {
    if rule == CombinationRule::ProbabilisticUnion {
        // Iterations reject study maps above 1
        return Ok(Some(1.0));
    }
    let mut bound = 0.0_f64;
    for study in studies {
        let Some(study_bound) = transformer.value_bound(&study.id, study.sample_size, &study.weights)? else {
            return Ok(None);
        };
        bound = match rule {
            CombinationRule::WeightedSum(_) => bound + study.study_weight * study_bound,
            _ => bound.max(study_bound),
        };
    }
    Ok(Some(bound))
}

/// Everything an iteration needs, fixed before the first one runs
pub(crate) struct MonteCarloPlan {
    transformer: KernelTransformer,
    estimator: Estimator,
    grid: Arc<GridSpace>,
    studies: Vec<PlannedStudy>,
    sampler: VoxelSampler,
    seed: u64,
    cluster_threshold: Option<ClusterThreshold>,
    pooled_bin_width: Option<f64>,
}

impl MonteCarloPlan {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transformer: KernelTransformer,
        rule: CombinationRule,
        studies: &StudyCollection,
        grid: &Arc<GridSpace>,
        seed: u64,
        spatial_model: &NullSpatialModel,
        cluster_threshold: Option<ClusterThreshold>,
        pooled_bin_width: Option<f64>,
    ) -> CbmaResult<Self> {
        let mut planned = Vec::with_capacity(studies.len());
        for study in studies.canonical_order() {
            let study_weight = rule.study_weight(study.id(), study.sample_size())?;
            let peaks = transformer.resolve_peaks(study)?;
            planned.push(PlannedStudy {
                id: study.id().to_string(),
                sample_size: study.sample_size(),
                study_weight,
                weights: peaks.iter().map(|p| p.weight).collect(),
            });
        }
        if let Some(bin_width) = pooled_bin_width {
            if let Some(bound) = statistic_bound(&transformer, rule, &planned)? {
                check_bin_range(bound, bin_width)?;
                debug!(
                    "Pooled null values bounded by {} ({} bins of width {})",
                    bound,
                    (bound / bin_width).ceil(),
                    bin_width
                );
            }
        }
        let sampler = VoxelSampler::new(spatial_model, grid)?;

        Ok(Self {
            transformer,
            estimator: Estimator::new(rule),
            grid: Arc::clone(grid),
            studies: planned,
            sampler,
            seed,
            cluster_threshold,
            pooled_bin_width,
        })
    }

    /// Run iteration `index`, optionally pooling its in-mask values into `histogram`
    pub(crate) fn run_iteration(
        &self,
        index: usize,
        histogram: Option<&mut NullHistogram>,
    ) -> CbmaResult<IterationRecord> {
        let seed = iteration_seed(self.seed, index);
        let mut rng = StdRng::seed_from_u64(seed);
        let grid = &self.grid;
        let rule = self.estimator.rule();

        let mut maps: Vec<SparseKernelMap> = Vec::with_capacity(self.studies.len());
        for study in &self.studies {
            let peaks: Vec<WeightedPeak> = study
                .weights
                .iter()
                .map(|&weight| WeightedPeak {
                    ijk: self.sampler.sample(&mut rng, grid),
                    weight,
                })
                .collect();
            let map = self.transformer.transform_peaks(&study.id, study.sample_size, &peaks)?;
            if rule == CombinationRule::ProbabilisticUnion && map.max_value() > 1.0 {
                return Err(CbmaError::input(
                    format!("study '{}'", study.id),
                    format!(
                        "probabilistic union requires values in [0, 1], null iteration {} produced {}",
                        index,
                        map.max_value()
                    ),
                ));
            }
            maps.push(map);
        }

        let ordered: Vec<&SparseKernelMap> = maps.iter().collect();
        let values = self.estimator.combine_sorted(&ordered, grid.len())?;

        let max_statistic = grid
            .mask_flat_indices()
            .iter()
            .map(|&flat| values[flat])
            .fold(f64::NEG_INFINITY, f64::max);

        let (max_cluster_size, max_cluster_mass) = match self.cluster_threshold {
            Some(threshold) => {
                let (size, mass) =
                    max_cluster_metrics(&values, grid, threshold.primary_threshold, threshold.connectivity);
                (Some(size), Some(mass))
            }
            None => (None, None),
        };

        if let Some(histogram) = histogram {
            for &flat in grid.mask_flat_indices() {
                histogram.add(values[flat])?;
            }
        }

        Ok(IterationRecord {
            index,
            seed,
            max_statistic,
            max_cluster_size,
            max_cluster_mass,
        })
    }

    /// Run `n_iterations` iterations on up to `max_workers` threads (0 = all cores).
    ///
    /// Records are independent of scheduling; the pooled histogram (built
    /// only when a bin width was planned) sums integer counts, so it is too.
    pub(crate) fn run(
        &self,
        n_iterations: usize,
        max_workers: usize,
        cancel: &CancellationToken,
    ) -> CbmaResult<EmpiricalNull> {
        if n_iterations == 0 {
            return Err(CbmaError::config("null.n_iterations", "must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("cbma-null-{}", i))
            .build()
            .map_err(|e| CbmaError::config("system.max_workers", e.to_string()))?;
        info!(
            "Running {} Monte Carlo iterations on {} worker threads",
            n_iterations,
            pool.current_num_threads()
        );

        let completed = AtomicUsize::new(0);
        let progress_step = (n_iterations / 10).max(1);
        let pooled_bin_width = self.pooled_bin_width;

        let outcome = pool.install(|| {
            (0..n_iterations)
                .into_par_iter()
                .try_fold(
                    || (Vec::new(), pooled_bin_width.map(NullHistogram::new)),
                    |(mut records, mut histogram), index| {
                        if cancel.is_cancelled() {
                            return Err(CbmaError::Cancelled {
                                completed: completed.load(Ordering::Acquire),
                                requested: n_iterations,
                            });
                        }
                        let record = self.run_iteration(index, histogram.as_mut())?;
                        let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                        if done % progress_step == 0 {
                            debug!("Monte Carlo progress: {}/{}", done, n_iterations);
                        }
                        records.push(record);
                        Ok((records, histogram))
                    },
                )
                .try_reduce(
                    || (Vec::new(), pooled_bin_width.map(NullHistogram::new)),
                    |(mut records, mut histogram), (more, other)| {
                        records.extend(more);
                        if let (Some(histogram), Some(other)) = (histogram.as_mut(), other.as_ref()) {
                            histogram.merge(other);
                        }
                        Ok((records, histogram))
                    },
                )
        });

        let (records, histogram) = outcome.map_err(|err| match err {
            CbmaError::Cancelled { requested, .. } => {
                let completed = completed.load(Ordering::Acquire);
                warn!(
                    "Monte Carlo null cancelled after {} of {} iterations",
                    completed, requested
                );
                CbmaError::Cancelled { completed, requested }
            }
            other => other,
        })?;

        Ok(EmpiricalNull::from_records(
            self.seed,
            records,
            self.cluster_threshold,
            histogram,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::Connectivity;
    use crate::estimator::StudyWeighting;
    use crate::kernel::KernelConfig;
    use crate::null::{NullDistributionGenerator, NullMethod};
    use cbma_structures::{Affine, Coordinate, Study};
    use ndarray::Array3;

    fn grid() -> Arc<GridSpace> {
        Arc::new(GridSpace::full((8, 8, 8), Affine::identity()).unwrap())
    }

    fn studies() -> StudyCollection {
        StudyCollection::new(vec![
            Study::new("b", vec![Coordinate::new(2.0, 2.0, 2.0), Coordinate::new(5.0, 5.0, 5.0)]),
            Study::new("a", vec![Coordinate::new(3.0, 3.0, 3.0)]),
            Study::new("c", vec![Coordinate::new(4.0, 4.0, 4.0)]),
        ])
        .unwrap()
    }

    fn generator(n: usize, seed: u64) -> NullDistributionGenerator {
        NullDistributionGenerator::new(
            KernelConfig::mkda(1.0),
            CombinationRule::WeightedSum(Default::default()),
            NullMethod::monte_carlo(n, seed),
        )
        .with_voxel_pooling(true)
        .with_cluster_threshold(ClusterThreshold {
            primary_threshold: 1.0,
            connectivity: Connectivity::Faces,
        })
    }

    #[test]
    fn test_records_independent_of_worker_count() {
        let grid = grid();
        let cancel = CancellationToken::new();
        let one = generator(20, 7)
            .with_max_workers(1)
            .generate(&studies(), &grid, &cancel)
            .unwrap();
        let four = generator(20, 7)
            .with_max_workers(4)
            .generate(&studies(), &grid, &cancel)
            .unwrap();
        assert_eq!(one, four);

        let null = one.as_empirical().unwrap();
        assert_eq!(null.n_iterations(), 20);
        assert_eq!(null.voxel_histogram().unwrap().total(), 20 * 512);
        assert!(null.max_statistic().windows(2).all(|w| w[0] <= w[1]));
        assert!(null.max_cluster_size().is_some());
    }

    #[test]
    fn test_replay_matches_stored_record() {
        let grid = grid();
        let gen = generator(12, 99);
        let null = gen.generate(&studies(), &grid, &CancellationToken::new()).unwrap();
        let stored = null.as_empirical().unwrap().records()[5];
        let replayed = gen.replay_iteration(&studies(), &grid, 5).unwrap();
        assert_eq!(stored, replayed);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = generator(50, 1).generate(&studies(), &grid(), &cancel).unwrap_err();
        assert!(matches!(
            err,
            CbmaError::Cancelled {
                completed: 0,
                requested: 50
            }
        ));
    }

    #[test]
    fn test_density_model_confines_peaks() {
        let grid = grid();
        let mut density = Array3::zeros((8, 8, 8));
        density[(1, 1, 1)] = 1.0;
        let gen = NullDistributionGenerator::new(
            KernelConfig::mkda(0.5),
            CombinationRule::WeightedSum(Default::default()),
            NullMethod::MonteCarlo {
                n_iterations: 5,
                seed: 3,
                spatial_model: NullSpatialModel::EmpiricalDensity(Arc::new(density)),
            },
        );
        let null = gen.generate(&studies(), &grid, &CancellationToken::new()).unwrap();
        // All peaks land on one voxel; peaks within a study combine by max
        for &max in null.as_empirical().unwrap().max_statistic() {
            assert_eq!(max, 3.0);
        }
    }

    #[test]
    fn test_values_not_pooled_unless_requested() {
        let grid = grid();
        let gen = NullDistributionGenerator::new(
            KernelConfig::mkda(1.0),
            CombinationRule::Max,
            NullMethod::monte_carlo(4, 2),
        );
        let null = gen.generate(&studies(), &grid, &CancellationToken::new()).unwrap();
        assert!(null.as_empirical().unwrap().voxel_histogram().is_none());
        assert!(!null.has_voxel_model());
        assert_eq!(null.voxel_p_value(1.0), None);
    }

    #[test]
    fn test_sample_size_weighting_pools_sparsely() {
        let grid = grid();
        let studies = StudyCollection::new(vec![
            Study::new("a", vec![Coordinate::new(2.0, 2.0, 2.0)]).with_sample_size(1000),
            Study::new("b", vec![Coordinate::new(5.0, 5.0, 5.0)]).with_sample_size(1000),
        ])
        .unwrap();
        let rule = CombinationRule::WeightedSum(StudyWeighting::SampleSize);

        let gen = NullDistributionGenerator::new(KernelConfig::mkda(1.0), rule, NullMethod::monte_carlo(4, 5));

        let fwe = gen.generate(&studies, &grid, &CancellationToken::new()).unwrap();
        assert!(fwe.as_empirical().unwrap().voxel_histogram().is_none());

        let pooled = gen
            .with_voxel_pooling(true)
            .generate(&studies, &grid, &CancellationToken::new())
            .unwrap();
        let histogram = pooled.as_empirical().unwrap().voxel_histogram().unwrap();
        assert_eq!(histogram.total(), 4 * 512);
        // Values are 0, 1000 or 2000: at most three occupied bins
        assert!(histogram.counts().len() <= 3);
        assert_eq!(histogram.count_at_least(1000.0), histogram.total() - histogram.counts()[&0]);
    }

    #[test]
    fn test_huge_weights_without_pooling_run() {
        let grid = grid();
        let studies = StudyCollection::new(vec![
            Study::new("a", vec![Coordinate::new(2.0, 2.0, 2.0).with_weight(1e12)]),
            Study::new("b", vec![Coordinate::new(5.0, 5.0, 5.0)]),
        ])
        .unwrap();
        let gen = NullDistributionGenerator::new(
            KernelConfig::mkda(1.0),
            CombinationRule::Max,
            NullMethod::monte_carlo(3, 1),
        );
        let null = gen.generate(&studies, &grid, &CancellationToken::new()).unwrap();
        assert!(null.as_empirical().unwrap().max_statistic().iter().all(|&m| m == 1e12));

        let err = gen
            .with_voxel_pooling(true)
            .generate(&studies, &grid, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CbmaError::Config { ref option, .. } if option == "null.bin_width"));
    }

    #[test]
    fn test_zero_density_rejected() {
        let gen = NullDistributionGenerator::new(
            KernelConfig::mkda(1.0),
            CombinationRule::Max,
            NullMethod::MonteCarlo {
                n_iterations: 5,
                seed: 3,
                spatial_model: NullSpatialModel::EmpiricalDensity(Arc::new(Array3::zeros((8, 8, 8)))),
            },
        );
        let err = gen
            .generate(&studies(), &grid(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CbmaError::Input { .. }));
    }
}
