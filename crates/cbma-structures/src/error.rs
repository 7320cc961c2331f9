// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every CBMA stage.
//!
//! Every variant identifies the offending entity (study id, grid coordinate,
//! option name or correction method) so callers can report it directly.

/// Result type for CBMA operations
pub type CbmaResult<T> = Result<T, CbmaError>;

/// Errors that can occur while estimating, generating nulls or correcting
///
/// # Examples
/// ```
/// use cbma_structures::{CbmaError, CbmaResult};
///
/// fn require_positive(n: u32) -> CbmaResult<u32> {
///     if n == 0 {
///         return Err(CbmaError::input("study-01", "sample size must be positive"));
///     }
///     Ok(n)
/// }
///
/// assert!(require_positive(0).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CbmaError {
    /// Malformed or out-of-mask coordinates, empty studies, missing sample sizes
    #[error("Invalid input for {entity}: {reason}")]
    Input { entity: String, reason: String },

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Insufficient data: {n_studies} studies supplied, at least {minimum} required")]
    InsufficientData { n_studies: usize, minimum: usize },

    #[error("Invalid configuration option '{option}': {reason}")]
    Config { option: String, reason: String },

    #[error("Correction method '{method}' requires a {required} null distribution, got {available}")]
    MethodMismatch {
        method: String,
        required: String,
        available: String,
    },

    #[error("Null distribution generation cancelled after {completed} of {requested} iterations")]
    Cancelled { completed: usize, requested: usize },
}

impl CbmaError {
    pub fn input(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        CbmaError::Input {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn config(option: impl Into<String>, reason: impl Into<String>) -> Self {
        CbmaError::Config {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn method_mismatch(
        method: impl Into<String>,
        required: impl Into<String>,
        available: impl Into<String>,
    ) -> Self {
        CbmaError::MethodMismatch {
            method: method.into(),
            required: required.into(),
            available: available.into(),
        }
    }
}
