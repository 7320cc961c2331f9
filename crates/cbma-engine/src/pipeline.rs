// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end meta-analysis: kernel maps → summary → null → correction.

use std::sync::Arc;
use std::time::Instant;

use cbma_config::{validate_config, CbmaConfig, ConfigError};
use cbma_structures::{CbmaError, CbmaResult, GridSpace, StudyCollection, SummaryStatisticMap};
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::clusters::Connectivity;
use crate::correct::{CorrectionMethod, Corrector, SignificanceMap};
use crate::estimator::{CombinationRule, Estimator};
use crate::kernel::{KernelConfig, KernelTransformer};
use crate::null::{
    ClusterThreshold, NullDistribution, NullDistributionGenerator, NullMethod, NullSpatialModel,
    MIN_STUDIES_FOR_NULL,
};

/// Everything one run produces
#[derive(Debug, Clone)]
pub struct MetaAnalysisResult {
    pub summary: SummaryStatisticMap,
    pub null: NullDistribution,
    pub corrected: SignificanceMap,
}

fn config_error(err: ConfigError) -> CbmaError {
    CbmaError::config(err.option().unwrap_or("configuration"), err.to_string())
}

/// A fully configured coordinate-based meta-analysis
#[derive(Debug, Clone)]
pub struct MetaAnalysis {
    kernel: KernelConfig,
    rule: CombinationRule,
    null_method: NullMethod,
    correction: CorrectionMethod,
    alpha: f64,
    cluster_threshold: Option<ClusterThreshold>,
    bin_width: f64,
    max_workers: usize,
}

impl MetaAnalysis {
    /// # Errors
    /// `Config` for invalid kernel parameters or an alpha outside (0, 1).
    pub fn new(
        kernel: KernelConfig,
        rule: CombinationRule,
        null_method: NullMethod,
        correction: CorrectionMethod,
        alpha: f64,
    ) -> CbmaResult<Self> {
        kernel.validate()?;
        Corrector::new(correction, alpha)?;
        Ok(Self {
            kernel,
            rule,
            null_method,
            correction,
            alpha,
            cluster_threshold: None,
            bin_width: crate::null::DEFAULT_BIN_WIDTH,
            max_workers: 0,
        })
    }

    /// Build from a configuration file's contents.
    ///
    /// # Errors
    /// `Config` naming the first offending option.
    pub fn from_config(config: &CbmaConfig) -> CbmaResult<Self> {
        validate_config(config).map_err(config_error)?;

        let kernel = KernelConfig::try_from(&config.kernel)?;
        let rule = CombinationRule::try_from(&config.combination)?;
        let null_method = NullMethod::try_from(&config.null)?;
        let correction = CorrectionMethod::try_from(&config.correction)?;

        let mut analysis = Self::new(kernel, rule, null_method, correction, config.correction.alpha)?
            .with_max_workers(config.system.max_workers)
            .with_bin_width(config.null.bin_width);
        if let Some(primary_threshold) = config.correction.primary_threshold {
            analysis = analysis.with_cluster_threshold(ClusterThreshold {
                primary_threshold,
                connectivity: Connectivity::try_from(config.correction.connectivity)?,
            });
        }
        debug!(
            "Meta-analysis configured: kernel '{}', rule '{}', null '{}', correction '{}'",
            analysis.kernel.family.name(),
            analysis.rule.name(),
            analysis.null_method.name(),
            analysis.correction.name()
        );
        Ok(analysis)
    }

    pub fn with_cluster_threshold(mut self, threshold: ClusterThreshold) -> Self {
        self.cluster_threshold = Some(threshold);
        self
    }

    /// Replace the Monte Carlo spatial model (no effect on an analytic null)
    pub fn with_spatial_model(mut self, model: NullSpatialModel) -> Self {
        if let NullMethod::MonteCarlo { spatial_model, .. } = &mut self.null_method {
            *spatial_model = model;
        }
        self
    }

    pub fn with_bin_width(mut self, bin_width: f64) -> Self {
        self.bin_width = bin_width;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn kernel(&self) -> &KernelConfig {
        &self.kernel
    }

    pub fn rule(&self) -> CombinationRule {
        self.rule
    }

    pub fn null_method(&self) -> &NullMethod {
        &self.null_method
    }

    pub fn correction(&self) -> CorrectionMethod {
        self.correction
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn generator(&self) -> NullDistributionGenerator {
        let generator = NullDistributionGenerator::new(self.kernel, self.rule, self.null_method.clone())
            .with_bin_width(self.bin_width)
            .with_voxel_pooling(matches!(self.correction, CorrectionMethod::Fdr { .. }))
            .with_max_workers(self.max_workers);
        match self.cluster_threshold {
            Some(threshold) => generator.with_cluster_threshold(threshold),
            None => generator,
        }
    }

    /// Checks that can fail without doing any kernel or null work
    fn check_plan(&self) -> CbmaResult<()> {
        if self.correction.requires_empirical_null() {
            if let NullMethod::Analytic { .. } = self.null_method {
                return Err(CbmaError::method_mismatch(self.correction.name(), "empirical", "analytic"));
            }
        }
        if let CorrectionMethod::ClusterFwe { .. } = self.correction {
            if self.cluster_threshold.is_none() {
                return Err(CbmaError::config(
                    "correction.primary_threshold",
                    "cluster-fwe requires a primary threshold",
                ));
            }
        }
        Ok(())
    }

    /// Run estimation, null generation and correction.
    ///
    /// All inputs are checked before the null is generated.
    ///
    /// # Errors
    /// `InsufficientData`, `Input` (naming the study), `Config`,
    /// `MethodMismatch`, `ShapeMismatch` or `Cancelled`.
    pub fn run(
        &self,
        studies: &StudyCollection,
        grid: &Arc<GridSpace>,
        cancel: &CancellationToken,
    ) -> CbmaResult<MetaAnalysisResult> {
        let started = Instant::now();
        self.check_plan()?;
        if studies.len() < MIN_STUDIES_FOR_NULL {
            return Err(CbmaError::InsufficientData {
                n_studies: studies.len(),
                minimum: MIN_STUDIES_FOR_NULL,
            });
        }
        let corrector = Corrector::new(self.correction, self.alpha)?;

        let mut transformer = KernelTransformer::new(self.kernel, Arc::clone(grid))?;
        transformer.prepare(studies)?;
        for study in studies {
            self.rule.study_weight(study.id(), study.sample_size())?;
            transformer.resolve_peaks(study)?;
        }
        info!(
            "Running meta-analysis of {} studies ({} coordinates) over {} mask voxels",
            studies.len(),
            studies.n_coordinates(),
            grid.n_mask_voxels()
        );

        let kernel_maps = transformer.transform_all(studies)?;
        let summary = Estimator::new(self.rule).estimate_sparse(&kernel_maps, grid)?;
        let (peak, peak_value) = summary.peak();
        info!("Summary statistic peak {} at voxel {:?}", peak_value, peak);

        let null = self.generator().generate(studies, grid, cancel)?;
        corrector.check_null(&null)?;
        let corrected = corrector.correct(&summary, &null)?;

        info!("Meta-analysis finished in {:.2?}", started.elapsed());
        Ok(MetaAnalysisResult {
            summary,
            null,
            corrected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correct::ClusterMetric;
    use cbma_structures::{Affine, Coordinate, Study};

    fn grid() -> Arc<GridSpace> {
        Arc::new(GridSpace::full((10, 10, 10), Affine::identity()).unwrap())
    }

    fn studies() -> StudyCollection {
        StudyCollection::new(
            (0..3)
                .map(|i| Study::new(format!("s{}", i), vec![Coordinate::new(5.0, 5.0, 5.0)]))
                .collect(),
        )
        .unwrap()
    }

    fn config() -> CbmaConfig {
        let mut config = CbmaConfig::default();
        config.kernel.radius_mm = 1.0;
        config.combination.rule = "max".to_string();
        config.null.n_iterations = 20;
        config.null.seed = 42;
        config
    }

    #[test]
    fn test_from_config_and_run() {
        let analysis = MetaAnalysis::from_config(&config()).unwrap();
        let result = analysis.run(&studies(), &grid(), &CancellationToken::new()).unwrap();
        assert_eq!(result.summary.value_at([5, 5, 5]), Some(1.0));
        assert_eq!(result.null.as_empirical().unwrap().n_iterations(), 20);
        assert_eq!(result.corrected.method(), CorrectionMethod::VoxelFwe);
    }

    #[test]
    fn test_invalid_config_names_option() {
        let mut config = config();
        config.correction.alpha = 2.0;
        let err = MetaAnalysis::from_config(&config).unwrap_err();
        assert!(matches!(err, CbmaError::Config { ref option, .. } if option == "correction.alpha"));
    }

    #[test]
    fn test_fwe_with_analytic_null_fails_before_work() {
        let analysis = MetaAnalysis::new(
            KernelConfig::mkda(1.0),
            CombinationRule::Max,
            NullMethod::Analytic { bin_width: 0.01 },
            CorrectionMethod::VoxelFwe,
            0.05,
        )
        .unwrap();
        // A single study would also fail, but the method check comes first
        let one = StudyCollection::new(vec![Study::new("a", vec![Coordinate::new(1.0, 1.0, 1.0)])]).unwrap();
        let err = analysis.run(&one, &grid(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, CbmaError::MethodMismatch { .. }));
    }

    #[test]
    fn test_cluster_fwe_needs_threshold() {
        let analysis = MetaAnalysis::new(
            KernelConfig::mkda(1.0),
            CombinationRule::Max,
            NullMethod::monte_carlo(5, 1),
            CorrectionMethod::ClusterFwe {
                metric: ClusterMetric::Size,
            },
            0.05,
        )
        .unwrap();
        let err = analysis.run(&studies(), &grid(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, CbmaError::Config { ref option, .. } if option == "correction.primary_threshold"));
    }

    #[test]
    fn test_missing_sample_size_fails_early() {
        let mut config = config();
        config.combination.rule = "weighted-sum".to_string();
        config.combination.weighting = "sample-size".to_string();
        let analysis = MetaAnalysis::from_config(&config).unwrap();
        let err = analysis.run(&studies(), &grid(), &CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("s0"));
    }
}
