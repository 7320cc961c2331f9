// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `cbma_configuration.toml`. Every struct rejects unknown keys so a typo in
//! an option name fails at load time instead of silently using a default.

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CbmaConfig {
    pub system: SystemConfig,
    pub kernel: KernelConfigSection,
    pub combination: CombinationConfigSection,
    pub null: NullConfigSection,
    pub correction: CorrectionConfigSection,
}

/// System-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    /// Worker threads for null generation (0 = one per core)
    pub max_workers: usize,
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            log_level: "info".to_string(),
        }
    }
}

/// Kernel family and parameters
///
/// `family` is one of `sphere`, `gaussian`, `sample-size-gaussian`.
/// Only the parameters of the selected family are read.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfigSection {
    pub family: String,
    /// Sphere radius in mm
    pub radius_mm: f64,
    /// Value deposited inside the sphere
    pub value: f64,
    /// Gaussian full width at half maximum in mm
    pub fwhm_mm: f64,
    /// Between-template uncertainty (FWHM, mm) for sample-size kernels
    pub template_uncertainty_mm: f64,
    /// Between-subject uncertainty (FWHM, mm) at n = 1 for sample-size kernels
    pub subject_uncertainty_mm: f64,
    /// Within-study peak combination: `max`, `probabilistic-union` or `sum`
    pub peak_combination: String,
    /// Out-of-mask policy: `reject`, `drop` or `clip`
    pub out_of_mask: String,
}

impl Default for KernelConfigSection {
    fn default() -> Self {
        Self {
            family: "sphere".to_string(),
            radius_mm: 10.0,
            value: 1.0,
            fwhm_mm: 10.0,
            template_uncertainty_mm: 5.7,
            subject_uncertainty_mm: 11.6,
            peak_combination: "max".to_string(),
            out_of_mask: "reject".to_string(),
        }
    }
}

/// Between-study combination rule
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CombinationConfigSection {
    /// `max`, `probabilistic-union` or `weighted-sum`
    pub rule: String,
    /// For `weighted-sum`: `uniform`, `sample-size` or `sqrt-sample-size`
    pub weighting: String,
}

impl Default for CombinationConfigSection {
    fn default() -> Self {
        Self {
            rule: "weighted-sum".to_string(),
            weighting: "uniform".to_string(),
        }
    }
}

/// Null distribution generation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NullConfigSection {
    /// `monte-carlo` or `analytic`
    pub method: String,
    pub n_iterations: usize,
    pub seed: u64,
    /// Spatial model for redrawn coordinates; `uniform-mask`
    pub spatial_model: String,
    /// Histogram bin width for voxel-level null values
    pub bin_width: f64,
}

impl Default for NullConfigSection {
    fn default() -> Self {
        Self {
            method: "monte-carlo".to_string(),
            n_iterations: 1000,
            seed: 0,
            spatial_model: "uniform-mask".to_string(),
            bin_width: 1e-4,
        }
    }
}

/// Multiple-comparisons correction
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrectionConfigSection {
    /// `voxel-fwe`, `cluster-fwe` or `fdr`
    pub method: String,
    pub alpha: f64,
    /// Primary (cluster-forming) threshold on the summary statistic
    pub primary_threshold: Option<f64>,
    /// Neighbourhood used to form clusters: 6, 18 or 26
    pub connectivity: u8,
    /// For `cluster-fwe`: `size` or `mass`
    pub cluster_metric: String,
    /// For `fdr`: `indep` (Benjamini-Hochberg) or `negcorr` (Benjamini-Yekutieli)
    pub fdr_procedure: String,
}

impl Default for CorrectionConfigSection {
    fn default() -> Self {
        Self {
            method: "voxel-fwe".to_string(),
            alpha: 0.05,
            primary_threshold: None,
            connectivity: 26,
            cluster_metric: "size".to_string(),
            fdr_procedure: "indep".to_string(),
        }
    }
}

/// Recognized string values per option, used by validation and error messages
pub mod allowed {
    pub const KERNEL_FAMILIES: &[&str] = &["sphere", "gaussian", "sample-size-gaussian"];
    pub const PEAK_COMBINATIONS: &[&str] = &["max", "probabilistic-union", "sum"];
    pub const OUT_OF_MASK: &[&str] = &["reject", "drop", "clip"];
    pub const COMBINATION_RULES: &[&str] = &["max", "probabilistic-union", "weighted-sum"];
    pub const WEIGHTINGS: &[&str] = &["uniform", "sample-size", "sqrt-sample-size"];
    pub const NULL_METHODS: &[&str] = &["monte-carlo", "analytic"];
    pub const SPATIAL_MODELS: &[&str] = &["uniform-mask"];
    pub const CORRECTION_METHODS: &[&str] = &["voxel-fwe", "cluster-fwe", "fdr"];
    pub const CLUSTER_METRICS: &[&str] = &["size", "mass"];
    pub const FDR_PROCEDURES: &[&str] = &["indep", "negcorr"];
    pub const CONNECTIVITIES: &[u8] = &[6, 18, 26];
}
