// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
# CBMA Engine

Coordinate-based meta-analysis over a fixed voxel grid:
- Kernel transformation (binary sphere, Gaussian, sample-size Gaussian)
- Order-independent combination of kernel maps into a summary statistic
- Monte Carlo and analytic null distributions
- Voxel-FWE, cluster-FWE and FDR correction

## Determinism

Studies are always folded in identifier order, and Monte Carlo iteration
`i` draws from its own stream derived from `(seed, i)`. Summary maps and
null distributions are therefore bit-identical across runs, study orderings
and worker counts.

## Concurrency

Null iterations run on a dedicated rayon pool (`system.max_workers`) and
share only read-only grid and study data. A [`CancellationToken`] stops a
run between iterations; partial results are discarded.
*/

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cancel;
pub mod clusters;
pub mod correct;
pub mod estimator;
pub mod kernel;
pub mod null;
pub mod pipeline;
pub mod simulate;
pub mod stats;

pub use cancel::CancellationToken;
pub use clusters::{find_clusters, label_clusters, Cluster, ClusterLabels, Connectivity};
pub use correct::{
    correct, correct_p_map, fdr_correct_p_values, ClusterMetric, ClusterReport, CorrectionMethod, Corrector,
    FdrProcedure, SignificanceMap,
};
pub use estimator::{estimate, CombinationRule, Combiner, Estimator, StudyWeighting};
pub use kernel::{
    transform, KernelConfig, KernelFamily, KernelFootprint, KernelTransformer, OutOfMaskPolicy, PeakCombination,
    SparseKernelMap, WeightedPeak,
};
pub use null::{
    generate, AnalyticNull, ClusterThreshold, EmpiricalNull, IterationRecord, NullDistribution,
    NullDistributionGenerator, NullHistogram, NullMethod, NullSpatialModel, MAX_HISTOGRAM_BINS, MIN_STUDIES_FOR_NULL,
};
pub use pipeline::{MetaAnalysis, MetaAnalysisResult};
pub use simulate::{simulate_coordinate_dataset, GroundTruthFoci, SampleSizes, SimulatedDataset, SimulationConfig};
pub use stats::{neg_log10, p_to_z};

// Re-export core types so callers need only this crate
pub use cbma_structures::{
    Affine, CbmaError, CbmaResult, Coordinate, GridSpace, Ijk, KernelMap, Study, StudyCollection,
    SummaryStatisticMap,
};
