// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization for CBMA runs
//!
//! Console logging is always available. With the `file-logging` feature,
//! each run additionally writes JSON logs into a timestamped folder with
//! per-crate files and configurable retention.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::config::{LogFormat, LoggingConfig};

#[cfg(feature = "file-logging")]
use std::path::{Path, PathBuf};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the filter for a config and set of debug flags
pub fn build_filter(config: &LoggingConfig, debug_flags: &CrateDebugFlags) -> Result<EnvFilter> {
    let directives = debug_flags.to_filter_string(&config.level);
    EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter directives: {}", directives))
}

fn console_layer(config: &LoggingConfig, filter: EnvFilter) -> BoxedLayer {
    match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Initialize console-only logging
///
/// # Errors
/// Fails if the filter is invalid or a global subscriber is already installed.
pub fn init_console_logging(config: &LoggingConfig, debug_flags: &CrateDebugFlags) -> Result<()> {
    let filter = build_filter(config, debug_flags)?;
    let layers = vec![console_layer(config, filter)];
    Registry::default()
        .with(layers)
        .try_init()
        .context("A global tracing subscriber is already installed")?;
    Ok(())
}

/// Logging initialization result
#[cfg(feature = "file-logging")]
pub struct LoggingGuard {
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: PathBuf,
}

#[cfg(feature = "file-logging")]
impl LoggingGuard {
    /// Get the log directory path of this run
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Initialize logging with file output and console output
///
/// Creates a timestamped folder structure:
/// ```text
/// ./logs/
///   └── run_20250101_120000/
///       ├── cbma-engine.log
///       ├── cbma-config.log
///       └── cbma.log (combined)
/// ```
///
/// The returned guard flushes the file writers when dropped.
#[cfg(feature = "file-logging")]
pub fn init_logging(config: &LoggingConfig, debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    use chrono::Utc;
    use tracing_appender::rolling;

    let base_log_dir = config
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./logs"));

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let run_folder = base_log_dir.join(format!("run_{}", timestamp));
    std::fs::create_dir_all(&run_folder)
        .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

    cleanup_old_logs(&base_log_dir, config.retention_days, config.retention_runs)?;

    let env_filter = build_filter(config, debug_flags)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guards = Vec::new();

    layers.push(console_layer(config, env_filter.clone()));

    // One file per crate
    for crate_name in crate::KNOWN_CRATES {
        let file_appender = rolling::daily(&run_folder, format!("{}.log", crate_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        file_guards.push(guard);

        let target = crate_name.replace('-', "_");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_filter(EnvFilter::try_new(format!("{}=debug", target))?)
            .boxed();
        layers.push(file_layer);
    }

    // Combined log file (all crates)
    let combined_appender = rolling::daily(&run_folder, "cbma.log");
    let (combined_non_blocking, combined_guard) = tracing_appender::non_blocking(combined_appender);
    file_guards.push(combined_guard);

    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(combined_non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_filter(env_filter)
            .boxed(),
    );

    Registry::default()
        .with(layers)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard {
        _file_guards: file_guards,
        log_dir: run_folder,
    })
}

/// Remove run folders older than `retention_days`, then keep at most
/// `retention_runs` of the remaining ones.
#[cfg(feature = "file-logging")]
fn cleanup_old_logs(base_log_dir: &Path, retention_days: u64, retention_runs: usize) -> Result<()> {
    use chrono::{DateTime, NaiveDateTime, Utc};

    if !base_log_dir.exists() {
        return Ok(());
    }

    let cutoff_date = Utc::now() - chrono::Duration::days(retention_days as i64);

    let mut runs: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
    for entry in std::fs::read_dir(base_log_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(timestamp_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("run_"))
        else {
            continue;
        };
        if let Ok(dt) = NaiveDateTime::parse_from_str(timestamp_str, "%Y%m%d_%H%M%S") {
            runs.push((path, dt.and_utc()));
        }
    }

    // Oldest first
    runs.sort_by_key(|(_, dt)| *dt);

    let mut kept = Vec::with_capacity(runs.len());
    for (path, dt) in runs {
        if dt < cutoff_date {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::warn!("Failed to remove old log directory {}: {}", path.display(), e);
            }
        } else {
            kept.push(path);
        }
    }

    if kept.len() > retention_runs {
        let excess = kept.len() - retention_runs;
        for path in kept.iter().take(excess) {
            if let Err(e) = std::fs::remove_dir_all(path) {
                tracing::warn!("Failed to remove old log directory {}: {}", path.display(), e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_levels() {
        let flags = CrateDebugFlags::from_args(vec!["--debug-cbma-engine".to_string()]);
        assert!(build_filter(&LoggingConfig::with_level("warn"), &flags).is_ok());
    }

    #[test]
    fn test_console_logging_installs_once() {
        let config = LoggingConfig::default();
        let flags = CrateDebugFlags::default();
        let _ = init_console_logging(&config, &flags);
        assert!(init_console_logging(&config, &flags).is_err());
    }

    #[cfg(feature = "file-logging")]
    #[test]
    fn test_cleanup_keeps_most_recent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let now = chrono::Utc::now();
        for minutes in 0..4 {
            let ts = (now - chrono::Duration::minutes(minutes)).format("%Y%m%d_%H%M%S");
            std::fs::create_dir_all(dir.path().join(format!("run_{}", ts))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("run_20000101_000000")).unwrap();
        std::fs::create_dir_all(dir.path().join("not_a_run")).unwrap();

        cleanup_old_logs(dir.path(), 30, 2).unwrap();

        let remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("run_"))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(dir.path().join("not_a_run").exists());
    }
}
