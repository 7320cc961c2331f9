// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # CBMA Configuration System
//!
//! Type-safe configuration loader for the CBMA engine with support for:
//! - TOML file parsing
//! - Environment variable overrides
//! - CLI argument overrides (dotted option names)
//! - Up-front validation that reports every problem at once
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cbma_config::{load_config, CbmaConfig};
//!
//! // Load configuration with automatic file discovery and overrides
//! let config = load_config(None, None).expect("Failed to load config");
//!
//! println!("Kernel: {}", config.kernel.family);
//! println!("Iterations: {}", config.null.n_iterations);
//! ```
//!
//! Options are kept as plain strings and numbers here; `cbma-engine` turns the
//! validated sections into its typed kernel, combination, null and
//! correction enums.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{
    apply_cli_overrides, apply_environment_overrides, find_config_file, load_config,
    parse_config, set_option, CONFIG_FILE_NAME,
};

pub use types::*;
pub use validation::{collect_validation_errors, validate_config, ConfigValidationError};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("Unknown configuration option: {0}")]
    UnknownOption(String),

    #[error("Invalid value '{value}' for configuration option {option}")]
    InvalidValue { option: String, value: String },

    #[error("{message}")]
    ValidationError { fields: Vec<String>, message: String },
}

impl ConfigError {
    /// Option name the error refers to, when there is a single one
    pub fn option(&self) -> Option<&str> {
        match self {
            ConfigError::UnknownOption(option) => Some(option),
            ConfigError::InvalidValue { option, .. } => Some(option),
            ConfigError::ValidationError { fields, .. } => fields.first().map(String::as_str),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
