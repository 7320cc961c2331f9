// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # cbma-observability
//!
//! Logging setup shared by CBMA binaries and test harnesses, with per-crate
//! debug flag support.
//!
//! Library crates only emit `tracing` events; installing a subscriber is
//! left to the application through [`init_console_logging`] or, with the
//! `file-logging` feature, `init_logging`.
//!
//! ## Features
//! - `file-logging`: Per-run JSON log files with rotation and retention

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod config;
pub mod init;

pub use cli::*;
pub use config::*;
pub use init::*;

/// Known CBMA crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "cbma-structures",
    "cbma-config",
    "cbma-engine",
    "cbma",
];
