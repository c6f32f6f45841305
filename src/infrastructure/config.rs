//! Configuration infrastructure
//!
//! 설정은 세 단계로 병합됩니다:
//! 1. `AppConfig::default()` 기본값
//! 2. 선택적 설정 파일 (TOML/JSON/YAML)
//! 3. `CATALOG_SYNC__SECTION__KEY` 형식의 환경 변수

#![allow(clippy::derivable_impls)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::approval_rule::FieldPatterns;

pub const ENV_PREFIX: &str = "CATALOG_SYNC";
const APP_DIR_NAME: &str = "catalog-sync";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub batch: BatchConfig,
    pub memory: MemoryConfig,
    pub streaming: StreamingConfig,
    pub remote: RemoteConfig,
    pub conflicts: ConflictConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url (`sqlite:/path/to/sync.db`, `sqlite::memory:`)
    pub url: String,
    pub max_connections: u32,
}

/// Batch execution engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per chunk
    pub batch_size: usize,
    pub max_workers: usize,
    pub enable_parallel: bool,
    /// Retries after the first attempt
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Add up to 10% random delay on top of the schedule
    pub retry_jitter: bool,
    /// Wall-clock deadline per batch
    pub timeout_seconds: u64,
    /// Cap on per-item errors kept in the batch summary
    pub max_error_details: usize,
    pub completed_batch_max_age_secs: u64,
}

impl BatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn completed_batch_max_age(&self) -> Duration {
        Duration::from_secs(self.completed_batch_max_age_secs)
    }
}

/// Memory monitor thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Percent of the budget at which warning callbacks fire
    pub warning_threshold_percent: f64,
    /// Percent of the budget treated as critical
    pub critical_threshold_percent: f64,
    pub poll_interval_ms: u64,
    /// Optional process budget; percentages use total system memory without it
    pub memory_limit_mb: Option<u64>,
    /// Pause before dispatching a chunk while usage is critical
    pub throttle_delay_ms: u64,
}

impl MemoryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_size: usize,
    pub cache_capacity: usize,
    /// Eviction starts once occupancy passes this fraction of capacity
    pub cache_high_water: f64,
    /// An eviction pass shrinks down to this fraction
    pub cache_low_water: f64,
    pub buffer_pool_size: usize,
    /// Initial capacity of pooled buffers in bytes
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub max_requests_per_second: u32,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Fields never compared (bookkeeping timestamps and the like)
    pub ignore_fields: Vec<String>,
    pub key_field: String,
    /// Resolved conflicts kept in the queue for audit before the oldest are dropped
    pub max_resolved_conflicts: usize,
}

/// Sync health indicator thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Item error rate (0-1) at which health turns degraded
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub max_open_conflicts: usize,
    /// Default report window
    pub window_secs: u64,
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    /// Enable JSON formatted file logs
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to the platform data directory when unset
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// "daily", "hourly" or "never"
    pub rotation: String,
    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            batch: BatchConfig::default(),
            memory: MemoryConfig::default(),
            streaming: StreamingConfig::default(),
            remote: RemoteConfig::default(),
            conflicts: ConflictConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = app_data_dir().join("sync.db");
        Self {
            url: format!("sqlite:{}", path.display()),
            max_connections: 8,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_workers: 4,
            enable_parallel: true,
            retry_attempts: 3,
            retry_delay_ms: 500,
            retry_backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            retry_jitter: true,
            timeout_seconds: 3600,
            max_error_details: 100,
            completed_batch_max_age_secs: 24 * 3600,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold_percent: 75.0,
            critical_threshold_percent: 90.0,
            poll_interval_ms: 5_000,
            memory_limit_mb: None,
            throttle_delay_ms: 250,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            cache_capacity: 10_000,
            cache_high_water: 0.9,
            cache_low_water: 0.7,
            buffer_pool_size: 32,
            buffer_capacity: 4096,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 4,
            request_timeout_seconds: 30,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            ignore_fields: vec!["updated_at".to_string(), "created_at".to_string()],
            key_field: "sku".to_string(),
            max_resolved_conflicts: 500,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.25,
            max_open_conflicts: 50,
            window_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_filters = HashMap::new();
        module_filters.insert("sqlx".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            file_name: "catalog-sync.log".to_string(),
            rotation: "daily".to_string(),
            module_filters,
        }
    }
}

/// Platform data directory for the database and logs
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

impl AppConfig {
    /// 기본값 + 선택적 파일 + 환경 변수 병합 후 검증
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            info!("📄 Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 설정값 유효성 검증
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database.max_connections must be greater than 0"));
        }

        let batch = &self.batch;
        if batch.batch_size == 0 || batch.max_workers == 0 {
            return Err(ConfigError::invalid(
                "batch.batch_size and batch.max_workers must be greater than 0",
            ));
        }
        if batch.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(format!(
                "batch.retry_backoff_multiplier must be >= 1.0 (got {})",
                batch.retry_backoff_multiplier
            )));
        }
        if batch.retry_delay_ms > batch.max_retry_delay_ms {
            return Err(ConfigError::invalid(
                "batch.retry_delay_ms cannot be greater than batch.max_retry_delay_ms",
            ));
        }
        if batch.timeout_seconds == 0 {
            return Err(ConfigError::invalid("batch.timeout_seconds must be greater than 0"));
        }

        let memory = &self.memory;
        if !(0.0..=100.0).contains(&memory.critical_threshold_percent)
            || memory.warning_threshold_percent <= 0.0
        {
            return Err(ConfigError::invalid("memory thresholds must be within (0, 100]"));
        }
        if memory.warning_threshold_percent >= memory.critical_threshold_percent {
            return Err(ConfigError::invalid(
                "memory.warning_threshold_percent must be lower than critical_threshold_percent",
            ));
        }
        if memory.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("memory.poll_interval_ms must be greater than 0"));
        }
        if memory.memory_limit_mb == Some(0) {
            return Err(ConfigError::invalid("memory.memory_limit_mb must be greater than 0"));
        }

        let streaming = &self.streaming;
        if streaming.chunk_size == 0 || streaming.cache_capacity == 0 {
            return Err(ConfigError::invalid(
                "streaming.chunk_size and streaming.cache_capacity must be greater than 0",
            ));
        }
        if !(0.0 < streaming.cache_low_water
            && streaming.cache_low_water < streaming.cache_high_water
            && streaming.cache_high_water <= 1.0)
        {
            return Err(ConfigError::invalid(
                "streaming cache water marks must satisfy 0 < low < high <= 1",
            ));
        }

        if self.remote.max_requests_per_second == 0 {
            return Err(ConfigError::invalid(
                "remote.max_requests_per_second must be greater than 0",
            ));
        }
        if self.conflicts.key_field.is_empty() {
            return Err(ConfigError::invalid("conflicts.key_field must not be empty"));
        }
        if let Err(e) = FieldPatterns::new(&self.conflicts.ignore_fields) {
            return Err(ConfigError::invalid(format!("conflicts.ignore_fields: {e}")));
        }

        let health = &self.health;
        if !(0.0 <= health.degraded_error_rate
            && health.degraded_error_rate <= health.unhealthy_error_rate
            && health.unhealthy_error_rate <= 1.0)
        {
            return Err(ConfigError::invalid(
                "health error rates must satisfy 0 <= degraded <= unhealthy <= 1",
            ));
        }

        Ok(())
    }
}
