// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! This module checks that every option holds a recognized value, that
//! numeric parameters are within range, and that the selected methods are
//! compatible with each other. All problems are collected and reported
//! together before any computation starts.

use crate::types::allowed;
use crate::{CbmaConfig, ConfigError, ConfigResult};

/// Validation errors that can occur during config validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    UnknownValue {
        field: String,
        value: String,
        allowed: Vec<String>,
    },
    MissingRequired {
        field: String,
    },
    InvalidValue {
        field: String,
        reason: String,
    },
    Incompatible {
        field: String,
        reason: String,
    },
}

impl ConfigValidationError {
    /// Dotted option name the error refers to
    pub fn field(&self) -> &str {
        match self {
            Self::UnknownValue { field, .. }
            | Self::MissingRequired { field }
            | Self::InvalidValue { field, .. }
            | Self::Incompatible { field, .. } => field,
        }
    }
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownValue {
                field,
                value,
                allowed,
            } => {
                write!(
                    f,
                    "Unrecognized value '{}' for {} (expected one of: {})",
                    value,
                    field,
                    allowed.join(", ")
                )
            }
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
            Self::Incompatible { field, reason } => {
                write!(f, "Incompatible configuration for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// Checks for:
/// - Recognized enumeration strings (kernel family, rules, methods)
/// - Valid numeric ranges (radius, FWHM, alpha, iterations, bin width)
/// - Required fields for the selected methods
/// - Incompatible combinations
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &CbmaConfig) -> ConfigResult<()> {
    let errors = collect_validation_errors(config);

    if !errors.is_empty() {
        let fields = errors.iter().map(|e| e.field().to_string()).collect();
        let message = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError {
            fields,
            message: format!("Configuration validation failed:\n{}", message),
        });
    }

    Ok(())
}

/// Run every check and return the problems found (empty when valid)
pub fn collect_validation_errors(config: &CbmaConfig) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    validate_enumerations(config, &mut errors);
    validate_value_ranges(config, &mut errors);
    validate_required_fields(config, &mut errors);
    validate_compatibility(config, &mut errors);

    errors
}

fn check_one_of(field: &str, value: &str, options: &[&str], errors: &mut Vec<ConfigValidationError>) {
    if !options.contains(&value) {
        errors.push(ConfigValidationError::UnknownValue {
            field: field.to_string(),
            value: value.to_string(),
            allowed: options.iter().map(|s| s.to_string()).collect(),
        });
    }
}

/// Validate that every string option holds a recognized value
fn validate_enumerations(config: &CbmaConfig, errors: &mut Vec<ConfigValidationError>) {
    check_one_of("kernel.family", &config.kernel.family, allowed::KERNEL_FAMILIES, errors);
    check_one_of(
        "kernel.peak_combination",
        &config.kernel.peak_combination,
        allowed::PEAK_COMBINATIONS,
        errors,
    );
    check_one_of("kernel.out_of_mask", &config.kernel.out_of_mask, allowed::OUT_OF_MASK, errors);
    check_one_of("combination.rule", &config.combination.rule, allowed::COMBINATION_RULES, errors);
    check_one_of(
        "combination.weighting",
        &config.combination.weighting,
        allowed::WEIGHTINGS,
        errors,
    );
    check_one_of("null.method", &config.null.method, allowed::NULL_METHODS, errors);
    check_one_of(
        "null.spatial_model",
        &config.null.spatial_model,
        allowed::SPATIAL_MODELS,
        errors,
    );
    check_one_of(
        "correction.method",
        &config.correction.method,
        allowed::CORRECTION_METHODS,
        errors,
    );
    check_one_of(
        "correction.cluster_metric",
        &config.correction.cluster_metric,
        allowed::CLUSTER_METRICS,
        errors,
    );
    check_one_of(
        "correction.fdr_procedure",
        &config.correction.fdr_procedure,
        allowed::FDR_PROCEDURES,
        errors,
    );
    if !allowed::CONNECTIVITIES.contains(&config.correction.connectivity) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "correction.connectivity".to_string(),
            reason: format!("must be 6, 18 or 26, got {}", config.correction.connectivity),
        });
    }
    if !["trace", "debug", "info", "warn", "error"]
        .contains(&config.system.log_level.to_lowercase().as_str())
    {
        errors.push(ConfigValidationError::InvalidValue {
            field: "system.log_level".to_string(),
            reason: format!("unknown level '{}'", config.system.log_level),
        });
    }
}

fn positive_finite(field: &str, value: f64, errors: &mut Vec<ConfigValidationError>) {
    if !(value.is_finite() && value > 0.0) {
        errors.push(ConfigValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be a positive finite number, got {}", value),
        });
    }
}

/// Validate value ranges and constraints
fn validate_value_ranges(config: &CbmaConfig, errors: &mut Vec<ConfigValidationError>) {
    match config.kernel.family.as_str() {
        "sphere" => {
            positive_finite("kernel.radius_mm", config.kernel.radius_mm, errors);
            positive_finite("kernel.value", config.kernel.value, errors);
        }
        "gaussian" => positive_finite("kernel.fwhm_mm", config.kernel.fwhm_mm, errors),
        "sample-size-gaussian" => {
            positive_finite(
                "kernel.template_uncertainty_mm",
                config.kernel.template_uncertainty_mm,
                errors,
            );
            positive_finite(
                "kernel.subject_uncertainty_mm",
                config.kernel.subject_uncertainty_mm,
                errors,
            );
        }
        _ => {}
    }

    if config.null.n_iterations == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "null.n_iterations".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    positive_finite("null.bin_width", config.null.bin_width, errors);

    // Alpha must lie strictly between 0 and 1
    if !(config.correction.alpha > 0.0 && config.correction.alpha < 1.0) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "correction.alpha".to_string(),
            reason: format!("must be in (0, 1), got {}", config.correction.alpha),
        });
    }

    if let Some(threshold) = config.correction.primary_threshold {
        if !threshold.is_finite() {
            errors.push(ConfigValidationError::InvalidValue {
                field: "correction.primary_threshold".to_string(),
                reason: "must be finite".to_string(),
            });
        }
    }
}

/// Validate fields that the selected methods require
fn validate_required_fields(config: &CbmaConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.correction.method == "cluster-fwe" && config.correction.primary_threshold.is_none()
    {
        errors.push(ConfigValidationError::MissingRequired {
            field: "correction.primary_threshold".to_string(),
        });
    }
}

/// Validate combinations of options that cannot work together
fn validate_compatibility(config: &CbmaConfig, errors: &mut Vec<ConfigValidationError>) {
    let fwe = matches!(config.correction.method.as_str(), "voxel-fwe" | "cluster-fwe");
    if fwe && config.null.method == "analytic" {
        errors.push(ConfigValidationError::Incompatible {
            field: "correction.method".to_string(),
            reason: format!(
                "'{}' needs a monte-carlo null; the analytic null only supports fdr",
                config.correction.method
            ),
        });
    }

    // Union of probabilities needs values in [0, 1]
    let union_used = config.kernel.peak_combination == "probabilistic-union"
        || config.combination.rule == "probabilistic-union";
    if union_used && config.kernel.family == "sphere" && config.kernel.value > 1.0 {
        errors.push(ConfigValidationError::Incompatible {
            field: "kernel.value".to_string(),
            reason: "probabilistic union requires kernel values in [0, 1]".to_string(),
        });
    }
    if config.combination.rule == "probabilistic-union" && config.kernel.peak_combination == "sum"
    {
        errors.push(ConfigValidationError::Incompatible {
            field: "kernel.peak_combination".to_string(),
            reason: "summed peaks can exceed 1 and cannot feed a probabilistic union".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CbmaConfig;

    fn messages(config: &CbmaConfig) -> String {
        match validate_config(config) {
            Err(ConfigError::ValidationError { message, .. }) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CbmaConfig::default();
        let result = validate_config(&config);
        if let Err(e) = &result {
            eprintln!("Validation error: {}", e);
        }
        assert!(result.is_ok());
    }

    #[test]
    fn test_unknown_kernel_family() {
        let mut config = CbmaConfig::default();
        config.kernel.family = "cubic".to_string();

        let msg = messages(&config);
        assert!(msg.contains("kernel.family"));
        assert!(msg.contains("sample-size-gaussian"));
    }

    #[test]
    fn test_invalid_alpha() {
        let mut config = CbmaConfig::default();
        config.correction.alpha = 1.5;

        let msg = messages(&config);
        assert!(msg.contains("correction.alpha"));
    }

    #[test]
    fn test_cluster_fwe_requires_threshold() {
        let mut config = CbmaConfig::default();
        config.correction.method = "cluster-fwe".to_string();

        let msg = messages(&config);
        assert!(msg.contains("correction.primary_threshold"));

        config.correction.primary_threshold = Some(0.01);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_connectivity() {
        let mut config = CbmaConfig::default();
        config.correction.connectivity = 8;

        let msg = messages(&config);
        assert!(msg.contains("correction.connectivity"));
    }

    #[test]
    fn test_fwe_with_analytic_null_rejected() {
        let mut config = CbmaConfig::default();
        config.null.method = "analytic".to_string();

        let msg = messages(&config);
        assert!(msg.contains("monte-carlo"));

        config.correction.method = "fdr".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = CbmaConfig::default();
        config.kernel.radius_mm = -1.0;
        config.null.n_iterations = 0;

        match validate_config(&config) {
            Err(ConfigError::ValidationError { fields, .. }) => {
                assert!(fields.contains(&"kernel.radius_mm".to_string()));
                assert!(fields.contains(&"null.n_iterations".to_string()));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
