// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the 3-tier configuration loading system:
//! 1. TOML file (base defaults)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{CbmaConfig, ConfigError, ConfigResult};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name searched for when no explicit path is given
pub const CONFIG_FILE_NAME: &str = "cbma_configuration.toml";

/// Find the CBMA configuration file
///
/// Search order:
/// 1. `CBMA_CONFIG_PATH` environment variable
/// 2. Current working directory: `./cbma_configuration.toml`
/// 3. Parent directories (searches up to 5 levels)
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("CBMA_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        } else {
            return Err(ConfigError::FileNotFound(format!(
                "Config file specified by CBMA_CONFIG_PATH not found: {}",
                path.display()
            )));
        }
    }

    let mut search_paths = Vec::new();

    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));

        let mut current = cwd.clone();
        for _ in 0..5 {
            if let Some(parent) = current.parent() {
                search_paths.push(parent.join(CONFIG_FILE_NAME));
                current = parent.to_path_buf();
            }
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "CBMA configuration file '{}' not found in any of these locations:\n{}\n\nSet CBMA_CONFIG_PATH environment variable to specify custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides keyed by dotted option name
///
/// # Returns
///
/// Complete `CbmaConfig` with all overrides applied and validated
///
/// # Errors
///
/// Returns error if config file is not found, contains invalid TOML or
/// unknown options, has an unparsable override, or fails validation
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<CbmaConfig> {
    let config_file = if let Some(path) = config_path {
        path.to_path_buf()
    } else {
        find_config_file()?
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config = parse_config(&content)?;

    apply_environment_overrides(&mut config)?;

    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli)?;
    }

    crate::validate_config(&config)?;
    Ok(config)
}

/// Parse configuration from a TOML string without overrides or validation
pub fn parse_config(content: &str) -> ConfigResult<CbmaConfig> {
    Ok(toml::from_str(content)?)
}

fn parse_value<T: FromStr>(option: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    })
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `CBMA_MAX_WORKERS` -> `system.max_workers`
/// - `CBMA_LOG_LEVEL` -> `system.log_level`
/// - `CBMA_N_ITERATIONS` -> `null.n_iterations`
/// - `CBMA_SEED` -> `null.seed`
/// - `CBMA_ALPHA` -> `correction.alpha`
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed
pub fn apply_environment_overrides(config: &mut CbmaConfig) -> ConfigResult<()> {
    const ENV_OPTIONS: &[(&str, &str)] = &[
        ("CBMA_MAX_WORKERS", "system.max_workers"),
        ("CBMA_LOG_LEVEL", "system.log_level"),
        ("CBMA_N_ITERATIONS", "null.n_iterations"),
        ("CBMA_SEED", "null.seed"),
        ("CBMA_ALPHA", "correction.alpha"),
    ];

    for (var, option) in ENV_OPTIONS {
        if let Ok(value) = env::var(var) {
            set_option(config, option, &value)?;
        }
    }
    Ok(())
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - Dotted option names to values (e.g., `{"null.n_iterations": "500"}`)
///
/// # Errors
///
/// Returns `ConfigError::UnknownOption` for an unrecognized key and
/// `ConfigError::InvalidValue` for a value that cannot be parsed
pub fn apply_cli_overrides(
    config: &mut CbmaConfig,
    cli_args: &HashMap<String, String>,
) -> ConfigResult<()> {
    // Sorted so the first reported error does not depend on hash order
    let mut keys: Vec<&String> = cli_args.keys().collect();
    keys.sort();
    for key in keys {
        set_option(config, key, &cli_args[key])?;
    }
    Ok(())
}

/// Set one option by its dotted name
pub fn set_option(config: &mut CbmaConfig, option: &str, value: &str) -> ConfigResult<()> {
    match option {
        "system.max_workers" => config.system.max_workers = parse_value(option, value)?,
        "system.log_level" => config.system.log_level = value.to_string(),

        "kernel.family" => config.kernel.family = value.to_string(),
        "kernel.radius_mm" => config.kernel.radius_mm = parse_value(option, value)?,
        "kernel.value" => config.kernel.value = parse_value(option, value)?,
        "kernel.fwhm_mm" => config.kernel.fwhm_mm = parse_value(option, value)?,
        "kernel.template_uncertainty_mm" => {
            config.kernel.template_uncertainty_mm = parse_value(option, value)?
        }
        "kernel.subject_uncertainty_mm" => {
            config.kernel.subject_uncertainty_mm = parse_value(option, value)?
        }
        "kernel.peak_combination" => config.kernel.peak_combination = value.to_string(),
        "kernel.out_of_mask" => config.kernel.out_of_mask = value.to_string(),

        "combination.rule" => config.combination.rule = value.to_string(),
        "combination.weighting" => config.combination.weighting = value.to_string(),

        "null.method" => config.null.method = value.to_string(),
        "null.n_iterations" => config.null.n_iterations = parse_value(option, value)?,
        "null.seed" => config.null.seed = parse_value(option, value)?,
        "null.spatial_model" => config.null.spatial_model = value.to_string(),
        "null.bin_width" => config.null.bin_width = parse_value(option, value)?,

        "correction.method" => config.correction.method = value.to_string(),
        "correction.alpha" => config.correction.alpha = parse_value(option, value)?,
        "correction.primary_threshold" => {
            config.correction.primary_threshold = match value.trim() {
                "" | "none" => None,
                v => Some(parse_value(option, v)?),
            }
        }
        "correction.connectivity" => config.correction.connectivity = parse_value(option, value)?,
        "correction.cluster_metric" => config.correction.cluster_metric = value.to_string(),
        "correction.fdr_procedure" => config.correction.fdr_procedure = value.to_string(),

        _ => return Err(ConfigError::UnknownOption(option.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "CBMA_MAX_WORKERS",
        "CBMA_LOG_LEVEL",
        "CBMA_N_ITERATIONS",
        "CBMA_SEED",
        "CBMA_ALPHA",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom_config.toml");
        File::create(&config_path).unwrap();

        env::set_var("CBMA_CONFIG_PATH", config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var("CBMA_CONFIG_PATH");

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_find_config_file_env_var_missing() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::set_var("CBMA_CONFIG_PATH", "/nonexistent/cbma.toml");
        let result = find_config_file();
        env::remove_var("CBMA_CONFIG_PATH");

        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[kernel]").unwrap();
        writeln!(file, "family = \"gaussian\"").unwrap();
        writeln!(file, "fwhm_mm = 8.0").unwrap();
        writeln!(file, "[null]").unwrap();
        writeln!(file, "n_iterations = 250").unwrap();

        let config = load_config(Some(&config_path), None).unwrap();

        assert_eq!(config.kernel.family, "gaussian");
        assert_eq!(config.kernel.fwhm_mm, 8.0);
        assert_eq!(config.null.n_iterations, 250);
        assert_eq!(config.correction.alpha, 0.05);
    }

    #[test]
    fn test_unknown_option_in_file_rejected() {
        let err = parse_config("[kernel]\nradius = 4.0\n").unwrap_err();
        match err {
            ConfigError::ParseError(msg) => assert!(msg.contains("radius")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_environment_overrides() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = CbmaConfig::default();

        env::set_var("CBMA_N_ITERATIONS", "42");
        env::set_var("CBMA_SEED", "7");
        env::set_var("CBMA_ALPHA", "0.01");

        let result = apply_environment_overrides(&mut config);
        clear_env();

        result.unwrap();
        assert_eq!(config.null.n_iterations, 42);
        assert_eq!(config.null.seed, 7);
        assert_eq!(config.correction.alpha, 0.01);
    }

    #[test]
    fn test_unparsable_environment_override_is_error() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let mut config = CbmaConfig::default();

        env::set_var("CBMA_MAX_WORKERS", "many");
        let result = apply_environment_overrides(&mut config);
        clear_env();

        match result {
            Err(ConfigError::InvalidValue { option, .. }) => {
                assert_eq!(option, "system.max_workers")
            }
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = CbmaConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("kernel.radius_mm".to_string(), "6".to_string());
        cli_args.insert("correction.method".to_string(), "fdr".to_string());
        cli_args.insert("correction.primary_threshold".to_string(), "0.02".to_string());

        apply_cli_overrides(&mut config, &cli_args).unwrap();

        assert_eq!(config.kernel.radius_mm, 6.0);
        assert_eq!(config.correction.method, "fdr");
        assert_eq!(config.correction.primary_threshold, Some(0.02));
    }

    #[test]
    fn test_cli_unknown_option() {
        let mut config = CbmaConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("kernel.radius".to_string(), "6".to_string());

        let err = apply_cli_overrides(&mut config, &cli_args).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(ref k) if k == "kernel.radius"));
    }

    #[test]
    fn test_override_precedence() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[null]").unwrap();
        writeln!(file, "n_iterations = 100").unwrap();
        writeln!(file, "seed = 1").unwrap();

        env::set_var("CBMA_N_ITERATIONS", "200");
        env::set_var("CBMA_SEED", "2");

        let mut cli_args = HashMap::new();
        cli_args.insert("null.n_iterations".to_string(), "300".to_string());

        let config = load_config(Some(&config_path), Some(&cli_args));
        clear_env();
        let config = config.unwrap();

        // CLI wins for iterations, env wins for seed (no CLI override)
        assert_eq!(config.null.n_iterations, 300);
        assert_eq!(config.null.seed, 2);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[correction]").unwrap();
        writeln!(file, "alpha = 0.0").unwrap();

        let err = load_config(Some(&config_path), None).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }
}
