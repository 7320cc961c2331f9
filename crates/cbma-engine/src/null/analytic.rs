// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Analytic voxel-level null.
//!
//! Under spatial randomness every in-mask voxel is equally likely to receive
//! any value of a study's kernel map, so each study contributes the value
//! histogram of its own map (zeros included). These histograms are combined
//! pairwise under the combination rule on a fixed grid of bins.

use std::collections::BTreeMap;

use ahash::AHashMap;
use cbma_structures::{CbmaError, CbmaResult, StudyCollection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::estimator::CombinationRule;
use super::check_bin_range;
use crate::kernel::KernelTransformer;

/// Smallest p-value reported by the analytic null
pub const ANALYTIC_P_FLOOR: f64 = f64::EPSILON;

/// Binned distribution of the voxel statistic under spatial randomness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticNull {
    bin_width: f64,
    rule: CombinationRule,
    /// Occupied bins, ascending
    pmf: Vec<(usize, f64)>,
    /// `survival[i]` is P(bin ≥ `pmf[i].0`)
    survival: Vec<f64>,
}

impl AnalyticNull {
    fn from_pmf(bin_width: f64, rule: CombinationRule, running: BTreeMap<usize, f64>) -> Self {
        let mut pmf: Vec<(usize, f64)> = running.into_iter().filter(|&(_, p)| p > 0.0).collect();
        if pmf.is_empty() {
            pmf.push((0, 1.0));
        }
        let total: f64 = pmf.iter().map(|&(_, p)| p).sum();
        for (_, p) in pmf.iter_mut() {
            *p /= total;
        }
        let mut survival = vec![0.0; pmf.len()];
        let mut acc = 0.0;
        for (i, &(_, p)) in pmf.iter().enumerate().rev() {
            acc += p;
            survival[i] = acc.min(1.0);
        }
        Self {
            bin_width,
            rule,
            pmf,
            survival,
        }
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    pub fn rule(&self) -> CombinationRule {
        self.rule
    }

    /// Occupied bins and their probabilities; bin `b` stands for the value `b · bin_width`
    pub fn pmf(&self) -> &[(usize, f64)] {
        &self.pmf
    }

    fn bin_of(&self, value: f64) -> usize {
        (value.max(0.0) / self.bin_width).round() as usize
    }

    /// P(statistic ≥ value) at bin resolution
    pub fn survival(&self, value: f64) -> f64 {
        let bin = self.bin_of(value);
        if bin == 0 {
            return 1.0;
        }
        let first_at_or_above = self.pmf.partition_point(|&(b, _)| b < bin);
        self.survival.get(first_at_or_above).copied().unwrap_or(0.0)
    }

    /// Uncorrected p-value, floored at [`ANALYTIC_P_FLOOR`]
    pub fn p_value(&self, value: f64) -> f64 {
        self.survival(value).max(ANALYTIC_P_FLOOR)
    }
}

/// Sparse `(bin, probability)` histogram of one study's map over the mask
fn study_histogram(
    entries: &[(usize, f64)],
    n_mask_voxels: usize,
    weight: f64,
    bin_width: f64,
) -> Vec<(usize, f64)> {
    let mut counts: AHashMap<usize, f64> = AHashMap::new();
    let zeros = n_mask_voxels.saturating_sub(entries.len());
    if zeros > 0 {
        counts.insert(0, zeros as f64);
    }
    for &(_, value) in entries {
        let bin = (value * weight / bin_width).round() as usize;
        *counts.entry(bin).or_insert(0.0) += 1.0;
    }
    let n = n_mask_voxels as f64;
    let mut histogram: Vec<(usize, f64)> = counts.into_iter().map(|(bin, c)| (bin, c / n)).collect();
    histogram.sort_unstable_by_key(|&(bin, _)| bin);
    histogram
}

fn combine_bins(rule: CombinationRule, a: usize, b: usize, bin_width: f64, last_union_bin: usize) -> usize {
    match rule {
        CombinationRule::Max => a.max(b),
        CombinationRule::WeightedSum(_) => a + b,
        CombinationRule::ProbabilisticUnion => {
            let va = a as f64 * bin_width;
            let vb = b as f64 * bin_width;
            let v = 1.0 - (1.0 - va) * (1.0 - vb);
            ((v / bin_width).round() as usize).min(last_union_bin)
        }
    }
}

/// Combine per-study histograms of the observed kernel maps.
///
/// Studies are folded in identifier order; the result does not depend on it
/// up to floating-point rounding.
pub(crate) fn analytic_null(
    transformer: &KernelTransformer,
    rule: CombinationRule,
    studies: &StudyCollection,
    bin_width: f64,
) -> CbmaResult<AnalyticNull> {
    if !(bin_width.is_finite() && bin_width > 0.0) {
        return Err(CbmaError::config("null.bin_width", "must be a positive finite number"));
    }
    let n_mask = transformer.grid().n_mask_voxels();
    let last_union_bin = (1.0 / bin_width).round() as usize;

    // Running distribution starts as a point mass at 0, the identity of every rule
    let mut running: BTreeMap<usize, f64> = BTreeMap::from([(0, 1.0)]);
    let mut running_bound = 0.0_f64;
    for study in studies.canonical_order() {
        let map = transformer.transform_sparse(study)?;
        let weight = match rule {
            CombinationRule::WeightedSum(_) => rule.study_weight(study.id(), study.sample_size())?,
            _ => 1.0,
        };
        if rule == CombinationRule::ProbabilisticUnion && map.max_value() > 1.0 {
            return Err(CbmaError::input(
                format!("study '{}'", study.id()),
                format!("probabilistic union requires values in [0, 1], found {}", map.max_value()),
            ));
        }
        let study_max = map.max_value() * weight;
        running_bound = match rule {
            CombinationRule::Max => running_bound.max(study_max),
            CombinationRule::WeightedSum(_) => running_bound + study_max,
            CombinationRule::ProbabilisticUnion => 1.0,
        };
        check_bin_range(running_bound + bin_width, bin_width)?;

        let histogram = study_histogram(map.entries(), n_mask, weight, bin_width);
        let mut next: BTreeMap<usize, f64> = BTreeMap::new();
        for (&a, &pa) in &running {
            if pa == 0.0 {
                continue;
            }
            for &(b, pb) in &histogram {
                *next.entry(combine_bins(rule, a, b, bin_width, last_union_bin)).or_insert(0.0) += pa * pb;
            }
        }
        debug!(
            "Analytic null: folded study '{}' ({} distinct values, {} occupied bins)",
            study.id(),
            histogram.len(),
            next.len()
        );
        running = next;
    }

    Ok(AnalyticNull::from_pmf(bin_width, rule, running))
}
