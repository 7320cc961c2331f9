// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # CBMA - Coordinate-Based Meta-Analysis
//!
//! Pools peak coordinates reported by independent neuroimaging studies and
//! asks where, in a common grid space, they converge more than chance would
//! predict. This crate re-exports the workspace members behind one import.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! cbma = "0.1"
//! ```
//!
//! ```rust,no_run
//! use cbma::prelude::*;
//! use std::sync::Arc;
//!
//! let grid = Arc::new(GridSpace::full((91, 109, 91), Affine::from_voxel_size([2.0; 3], [-90.0, -126.0, -72.0])?)?);
//! let studies = StudyCollection::new(vec![
//!     Study::new("smith-2019", vec![Coordinate::new(-42.0, 18.0, 24.0)]).with_sample_size(24),
//!     Study::new("li-2021", vec![Coordinate::new(-40.0, 20.0, 22.0)]).with_sample_size(31),
//! ])?;
//!
//! let config = cbma::config::load_config(None, None)?;
//! let analysis = MetaAnalysis::from_config(&config)?;
//! let result = analysis.run(&studies, &grid, &CancellationToken::new())?;
//! println!("{} significant voxels", result.corrected.n_significant(result.corrected.alpha()));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Feature Flags
//!
//! - **`file-logging`**: per-run JSON log folders with retention
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Foundation: cbma-structures, cbma-config               │
//! │  (GridSpace, StudyCollection, maps, errors, options)    │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Algorithms: cbma-engine                                │
//! │  (kernels, estimation, null generation, correction)     │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Infrastructure: cbma-observability                     │
//! │  (tracing subscriber setup, per-crate debug flags)      │
//! └─────────────────────────────────────────────────────────┘
//! ```

// Re-export foundation
pub use cbma_config as config;
pub use cbma_structures as structures;

// Re-export algorithms
pub use cbma_engine as engine;

// Re-export infrastructure
pub use cbma_observability as observability;

/// Prelude - commonly used types and entry points
pub mod prelude {
    pub use cbma_config::{load_config, CbmaConfig};
    pub use cbma_engine::{
        correct, correct_p_map, estimate, generate, simulate_coordinate_dataset, transform, CancellationToken,
        ClusterMetric, ClusterThreshold, CombinationRule, Connectivity, CorrectionMethod, FdrProcedure,
        KernelConfig, KernelFamily, MetaAnalysis, MetaAnalysisResult, NullDistribution, NullMethod,
        NullSpatialModel, OutOfMaskPolicy, PeakCombination, SignificanceMap, SimulationConfig, StudyWeighting,
    };
    pub use cbma_structures::{
        Affine, CbmaError, CbmaResult, Coordinate, GridSpace, KernelMap, Study, StudyCollection,
        SummaryStatisticMap,
    };
}
