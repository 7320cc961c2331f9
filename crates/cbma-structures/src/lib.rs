// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # CBMA Structures
//!
//! Core data types shared by every stage of a coordinate-based meta-analysis:
//!
//! - [`GridSpace`] / [`Affine`]: the discretized brain volume and its mask
//! - [`Coordinate`], [`Study`], [`StudyCollection`]: the materialized dataset
//! - [`KernelMap`], [`SummaryStatisticMap`]: dense maps over the grid
//! - [`CbmaError`]: the error taxonomy used across the workspace
//!
//! Nothing in this crate performs statistics; see `cbma-engine`.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod dataset;
pub mod error;
pub mod grid;
pub mod maps;

pub use dataset::{Coordinate, Study, StudyCollection};
pub use error::{CbmaError, CbmaResult};
pub use grid::{Affine, GridShape, GridSpace, Ijk};
pub use maps::{KernelMap, SummaryStatisticMap};
