//! Logging system configuration and initialization
//!
//! This module provides the logging setup with:
//! - Console output for operators
//! - Optional rolling file output through a non-blocking writer
//! - Structured JSON logging (optional)
//! - Configuration based log level control, overridable with `RUST_LOG`

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

/// Keeps the background file writer alive; drop it on shutdown to flush
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Directory for log files when the config does not name one
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config
        .log_dir
        .clone()
        .unwrap_or_else(|| crate::infrastructure::config::app_data_dir().join("logs"))
}

/// Build the filter, suppressing dependency noise unless TRACE is requested
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", config.level, e))?;

    if !config.level.to_lowercase().contains("trace") {
        for directive in ["sqlx::query=warn", "sqlx::sqlite=warn", "tokio=info"] {
            filter = filter.add_directive(directive.parse()?);
        }
    }

    for (module, level) in &config.module_filters {
        filter = filter.add_directive(format!("{module}={level}").parse()?);
    }

    Ok(filter)
}

/// Initialize logging with custom configuration
///
/// The returned guard must be held for as long as file output is wanted.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = build_env_filter(config)?;
    let registry = Registry::default().with(env_filter);

    let console_layer = config
        .console_output
        .then(|| fmt::Layer::new().with_writer(std::io::stdout).with_target(false));

    let mut file_guard = None;
    let (json_file_layer, plain_file_layer) = if config.file_output {
        let log_dir = get_log_directory(config);
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

        let appender = match config.rotation.as_str() {
            "hourly" => rolling::hourly(&log_dir, &config.file_name),
            "never" => rolling::never(&log_dir, &config.file_name),
            _ => rolling::daily(&log_dir, &config.file_name),
        };
        let (writer, guard) = non_blocking(appender);
        file_guard = Some(guard);

        if config.json_format {
            let layer = fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false);
            (Some(layer), None)
        } else {
            let layer = fmt::Layer::new()
                .with_writer(writer)
                .with_target(false)
                .with_ansi(false);
            (None, Some(layer))
        }
    } else {
        (None, None)
    };

    if console_layer.is_none() && json_file_layer.is_none() && plain_file_layer.is_none() {
        return Err(anyhow!("No logging output configured"));
    }

    registry
        .with(console_layer)
        .with(json_file_layer)
        .with(plain_file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log directory: {:?}", get_log_directory(config));
    }
    if !config.level.to_lowercase().contains("trace") {
        info!("SQL and verbose logs suppressed (use TRACE level to see all logs)");
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Catalog Sync System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("=======================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(!config.level.is_empty());
        assert!(config.console_output);
    }

    #[test]
    fn test_log_directory_prefers_configured_path() {
        let config = LoggingConfig {
            log_dir: Some(PathBuf::from("/tmp/sync-logs")),
            ..LoggingConfig::default()
        };
        assert_eq!(get_log_directory(&config), PathBuf::from("/tmp/sync-logs"));

        let default_dir = get_log_directory(&LoggingConfig::default());
        assert!(default_dir.to_string_lossy().ends_with("logs"));
    }

    #[test]
    fn test_env_filter_builds_with_module_filters() {
        let mut config = LoggingConfig::default();
        config
            .module_filters
            .insert("catalog_sync::infrastructure".to_string(), "debug".to_string());
        assert!(build_env_filter(&config).is_ok());
    }
}
