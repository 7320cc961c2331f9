// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Small statistical helpers shared by null generation and correction.

use statrs::distribution::{ContinuousCDF, Normal};

/// Smallest p-value passed to the normal quantile; keeps z finite
const P_FLOOR: f64 = 1e-300;

/// One-sided p-value → z-score (upper tail).
///
/// p = 0.5 maps to 0, small p to large positive z. NaN stays NaN.
pub fn p_to_z(p: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    let p = p.clamp(P_FLOOR, 1.0 - f64::EPSILON);
    // Normal(0, 1) parameters are always valid
    match Normal::new(0.0, 1.0) {
        Ok(normal) => -normal.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

/// `-log10(p)`; NaN stays NaN.
pub fn neg_log10(p: f64) -> f64 {
    if p.is_nan() {
        f64::NAN
    } else {
        -p.max(P_FLOOR).log10()
    }
}

/// Number of values in an ascending slice that are `>= value`
pub fn count_at_least(sorted: &[f64], value: f64) -> usize {
    sorted.len() - sorted.partition_point(|&x| x < value)
}

/// Permutation p-value with continuity correction: `(#{null >= v} + 1) / (n + 1)`.
///
/// Never 0, at most 1. `sorted_null` must be ascending.
pub fn empirical_p(sorted_null: &[f64], value: f64) -> f64 {
    let exceed = count_at_least(sorted_null, value);
    (exceed as f64 + 1.0) / (sorted_null.len() as f64 + 1.0)
}

/// SplitMix64 finalizer: a bijective avalanche mix of 64 bits
fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Mix a base seed and an iteration index into an independent stream seed.
///
/// The seed is scrambled before the index is added, so nearby seeds and
/// indices do not map onto each other's streams.
pub fn iteration_seed(seed: u64, index: usize) -> u64 {
    splitmix64(splitmix64(seed).wrapping_add(index as u64))
}
