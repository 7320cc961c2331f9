// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Between-study combination of kernel maps into a summary statistic.
//!
//! Studies are always folded in identifier order, so the summary map is
//! bit-identical for any permutation of the input. Sparse and dense kernel
//! maps fold through the same [`Combiner`], whose identities (`+0`, `×1`,
//! `max(·, 0)`) make the two paths agree exactly.

use std::sync::Arc;

use cbma_config::CombinationConfigSection;
use cbma_structures::{CbmaError, CbmaResult, GridSpace, KernelMap, SummaryStatisticMap};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kernel::SparseKernelMap;

/// Per-study weight for the weighted-sum rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StudyWeighting {
    #[default]
    Uniform,
    SampleSize,
    SqrtSampleSize,
}

impl StudyWeighting {
    pub fn requires_sample_size(self) -> bool {
        !matches!(self, StudyWeighting::Uniform)
    }

    /// Weight of one study.
    ///
    /// # Errors
    /// `Input` naming the study when a sample size is needed but missing.
    pub fn weight(self, study_id: &str, sample_size: Option<u32>) -> CbmaResult<f64> {
        if self == StudyWeighting::Uniform {
            return Ok(1.0);
        }
        let n = sample_size.ok_or_else(|| {
            CbmaError::input(
                format!("study '{}'", study_id),
                "sample size is required by the configured kernel or weighting",
            )
        })? as f64;
        Ok(match self {
            StudyWeighting::SampleSize => n,
            StudyWeighting::SqrtSampleSize => n.sqrt(),
            StudyWeighting::Uniform => 1.0,
        })
    }
}

/// Closed set of between-study combination rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "weighting", rename_all = "kebab-case")]
pub enum CombinationRule {
    /// Voxel-wise maximum over studies
    Max,
    /// `1 - Π(1 - v)` over studies (ALE)
    ProbabilisticUnion,
    /// `Σ w·v` over studies (MKDA/KDA density)
    WeightedSum(StudyWeighting),
}

impl CombinationRule {
    pub fn name(&self) -> &'static str {
        match self {
            CombinationRule::Max => "max",
            CombinationRule::ProbabilisticUnion => "probabilistic-union",
            CombinationRule::WeightedSum(_) => "weighted-sum",
        }
    }

    pub fn requires_sample_size(&self) -> bool {
        matches!(self, CombinationRule::WeightedSum(w) if w.requires_sample_size())
    }

    /// Weight applied to a study's values under this rule
    pub fn study_weight(&self, study_id: &str, sample_size: Option<u32>) -> CbmaResult<f64> {
        match self {
            CombinationRule::WeightedSum(weighting) => weighting.weight(study_id, sample_size),
            _ => Ok(1.0),
        }
    }
}

impl TryFrom<&CombinationConfigSection> for CombinationRule {
    type Error = CbmaError;

    fn try_from(section: &CombinationConfigSection) -> CbmaResult<Self> {
        match section.rule.as_str() {
            "max" => Ok(CombinationRule::Max),
            "probabilistic-union" => Ok(CombinationRule::ProbabilisticUnion),
            "weighted-sum" => {
                let weighting = match section.weighting.as_str() {
                    "uniform" => StudyWeighting::Uniform,
                    "sample-size" => StudyWeighting::SampleSize,
                    "sqrt-sample-size" => StudyWeighting::SqrtSampleSize,
                    other => {
                        return Err(CbmaError::config(
                            "combination.weighting",
                            format!("unknown weighting '{}'", other),
                        ))
                    }
                };
                Ok(CombinationRule::WeightedSum(weighting))
            }
            other => Err(CbmaError::config(
                "combination.rule",
                format!("unknown combination rule '{}'", other),
            )),
        }
    }
}

/// Running voxel-wise accumulator for one combination rule.
///
/// The probabilistic union is accumulated as a product of complements and
/// converted in [`Combiner::finish`].
#[derive(Debug, Clone)]
pub struct Combiner {
    rule: CombinationRule,
    acc: Vec<f64>,
}

impl Combiner {
    pub fn new(rule: CombinationRule, len: usize) -> Self {
        let identity = match rule {
            CombinationRule::ProbabilisticUnion => 1.0,
            CombinationRule::Max | CombinationRule::WeightedSum(_) => 0.0,
        };
        Self {
            rule,
            acc: vec![identity; len],
        }
    }

    #[inline]
    fn fold_one(&mut self, flat: usize, value: f64, weight: f64) {
        let slot = &mut self.acc[flat];
        match self.rule {
            CombinationRule::Max => *slot = slot.max(value),
            CombinationRule::ProbabilisticUnion => *slot *= 1.0 - value,
            CombinationRule::WeightedSum(_) => *slot += weight * value,
        }
    }

    /// Fold a sparse map; absent voxels are treated as 0
    pub fn fold_sparse(&mut self, entries: &[(usize, f64)], weight: f64) {
        for &(flat, value) in entries {
            self.fold_one(flat, value, weight);
        }
    }

    /// Fold a dense map given in flat (C) order
    pub fn fold_dense<I>(&mut self, values: I, weight: f64)
    where
        I: IntoIterator<Item = f64>,
    {
        for (flat, value) in values.into_iter().enumerate() {
            self.fold_one(flat, value, weight);
        }
    }

    /// Flat summary values
    pub fn finish(self) -> Vec<f64> {
        match self.rule {
            CombinationRule::ProbabilisticUnion => self.acc.into_iter().map(|p| 1.0 - p).collect(),
            _ => self.acc,
        }
    }
}

fn check_values<I>(study_id: &str, values: I, rule: CombinationRule) -> CbmaResult<()>
where
    I: IntoIterator<Item = f64>,
{
    for value in values {
        if !value.is_finite() || value < 0.0 {
            return Err(CbmaError::input(
                format!("study '{}'", study_id),
                format!("kernel map holds invalid value {}", value),
            ));
        }
        if rule == CombinationRule::ProbabilisticUnion && value > 1.0 {
            return Err(CbmaError::input(
                format!("study '{}'", study_id),
                format!("probabilistic union requires values in [0, 1], found {}", value),
            ));
        }
    }
    Ok(())
}

fn into_summary(grid: &Arc<GridSpace>, flat: Vec<f64>) -> CbmaResult<SummaryStatisticMap> {
    let shape = grid.shape();
    let data = Array3::from_shape_vec(shape, flat).map_err(|_| CbmaError::ShapeMismatch {
        what: "summary statistic map".to_string(),
        expected: shape,
        actual: shape,
    })?;
    SummaryStatisticMap::new(Arc::clone(grid), data)
}

/// Combines kernel maps with a fixed rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimator {
    rule: CombinationRule,
}

impl Estimator {
    pub fn new(rule: CombinationRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> CombinationRule {
        self.rule
    }

    /// Summary map from dense kernel maps.
    ///
    /// # Errors
    /// `InsufficientData` for no maps, `ShapeMismatch` naming the study whose
    /// map disagrees with the grid, `Input` for invalid values or missing
    /// sample sizes.
    pub fn estimate(&self, kernel_maps: &[KernelMap], grid: &Arc<GridSpace>) -> CbmaResult<SummaryStatisticMap> {
        if kernel_maps.is_empty() {
            return Err(CbmaError::InsufficientData {
                n_studies: 0,
                minimum: 1,
            });
        }
        let mut ordered: Vec<&KernelMap> = kernel_maps.iter().collect();
        ordered.sort_by(|a, b| a.study_id().cmp(b.study_id()));

        let mut combiner = Combiner::new(self.rule, grid.len());
        for map in ordered {
            grid.check_shape(&format!("kernel map of study '{}'", map.study_id()), map.dim())?;
            check_values(map.study_id(), map.data().iter().copied(), self.rule)?;
            let weight = self.rule.study_weight(map.study_id(), map.sample_size())?;
            combiner.fold_dense(map.data().iter().copied(), weight);
        }
        debug!(
            "Combined {} kernel maps with rule '{}'",
            kernel_maps.len(),
            self.rule.name()
        );
        into_summary(grid, combiner.finish())
    }

    /// Summary map from sparse kernel maps; identical to [`Estimator::estimate`]
    /// on the densified maps.
    pub fn estimate_sparse(
        &self,
        kernel_maps: &[SparseKernelMap],
        grid: &Arc<GridSpace>,
    ) -> CbmaResult<SummaryStatisticMap> {
        if kernel_maps.is_empty() {
            return Err(CbmaError::InsufficientData {
                n_studies: 0,
                minimum: 1,
            });
        }
        let mut ordered: Vec<&SparseKernelMap> = kernel_maps.iter().collect();
        ordered.sort_by(|a, b| a.study_id().cmp(b.study_id()));
        for map in &ordered {
            check_values(map.study_id(), map.entries().iter().map(|&(_, v)| v), self.rule)?;
            if let Some(&(flat, _)) = map.entries().last() {
                if flat >= grid.len() {
                    return Err(CbmaError::input(
                        format!("study '{}'", map.study_id()),
                        format!("kernel map index {} lies outside the grid", flat),
                    ));
                }
            }
        }
        into_summary(grid, self.combine_sorted(&ordered, grid.len())?)
    }

    /// Fold maps already in canonical order into flat summary values
    pub(crate) fn combine_sorted(&self, ordered: &[&SparseKernelMap], len: usize) -> CbmaResult<Vec<f64>> {
        let mut combiner = Combiner::new(self.rule, len);
        for map in ordered {
            let weight = self.rule.study_weight(map.study_id(), map.sample_size())?;
            combiner.fold_sparse(map.entries(), weight);
        }
        Ok(combiner.finish())
    }
}

/// Summary statistic map of dense kernel maps under `rule`
pub fn estimate(
    kernel_maps: &[KernelMap],
    grid: &Arc<GridSpace>,
    rule: CombinationRule,
) -> CbmaResult<SummaryStatisticMap> {
    Estimator::new(rule).estimate(kernel_maps, grid)
}
