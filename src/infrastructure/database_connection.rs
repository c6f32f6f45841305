// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use crate::infrastructure::config::DatabaseConfig;

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 10).await
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::with_max_connections(&config.url, config.max_connections).await
    }

    async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        if is_memory_url(database_url) {
            return Self::in_memory().await;
        }

        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        // Create database file directory if it doesn't exist
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        Ok(Self { pool })
    }

    /// Single shared in-memory connection; every handle sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn migrate(&self) -> Result<()> {
        // Create tables manually; one statement per execute
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sync_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                remote_id TEXT,
                version_hash TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                data_snapshot TEXT NOT NULL,
                source_system TEXT NOT NULL,
                change_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (entity_type, entity_id, version_number)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS staged_changes (
                change_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT,
                remote_id TEXT,
                change_type TEXT NOT NULL,
                sync_direction TEXT NOT NULL,
                current_data TEXT,
                proposed_data TEXT,
                field_changes TEXT NOT NULL,
                has_conflicts INTEGER NOT NULL DEFAULT 0,
                conflict_fields TEXT NOT NULL,
                conflict_severity TEXT,
                conflict_resolution TEXT,
                status TEXT NOT NULL,
                reviewed_by TEXT,
                reviewed_at TEXT,
                review_notes TEXT,
                auto_approved INTEGER NOT NULL DEFAULT 0,
                approval_rule_id INTEGER,
                applied_at TEXT,
                applied_by TEXT,
                application_result TEXT,
                rollback_data TEXT,
                previous_version_id INTEGER,
                batch_id TEXT,
                priority INTEGER NOT NULL DEFAULT 100,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_batches (
                batch_id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                total_items INTEGER NOT NULL,
                processed_items INTEGER NOT NULL,
                successful_items INTEGER NOT NULL,
                failed_items INTEGER NOT NULL,
                skipped_items INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                processing_rate REAL NOT NULL DEFAULT 0,
                api_calls_made INTEGER NOT NULL DEFAULT 0,
                rate_limit_hits INTEGER NOT NULL DEFAULT 0,
                retry_attempts INTEGER NOT NULL DEFAULT 0,
                error_summary TEXT NOT NULL,
                error_message TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_approval_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                entity_type TEXT,
                change_type TEXT,
                field_patterns TEXT NOT NULL,
                value_thresholds TEXT NOT NULL,
                requires_approval INTEGER NOT NULL,
                auto_approve_conditions TEXT NOT NULL,
                approval_level TEXT NOT NULL,
                priority INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_rollbacks (
                rollback_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                staged_change_id TEXT NOT NULL,
                previous_version_id INTEGER,
                rollback_data TEXT,
                status TEXT NOT NULL,
                executed_by TEXT NOT NULL,
                reason TEXT,
                error_message TEXT,
                restored_version_id INTEGER,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_versions_entity ON sync_versions (entity_type, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_changes_status ON staged_changes (status, priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_changes_batch ON staged_changes (batch_id)",
            "CREATE INDEX IF NOT EXISTS idx_batches_created ON sync_batches (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_batches_status ON sync_batches (status)",
            "CREATE INDEX IF NOT EXISTS idx_rules_active ON sync_approval_rules (is_active, priority)",
            "CREATE INDEX IF NOT EXISTS idx_rollbacks_change ON sync_rollbacks (staged_change_id)",
            "CREATE INDEX IF NOT EXISTS idx_rollbacks_status ON sync_rollbacks (status)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("running schema migration")?;
        }

        Ok(())
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:")
}

/// Fixed-width UTC text so lexical order equals time order
pub fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

pub fn decode_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_timestamp).transpose()
}

/// JSON text column
pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("encoding JSON column")
}

pub fn encode_optional_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(encode_json).transpose()
}

pub fn decode_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("decoding JSON column {column}"))
}

pub fn decode_optional_json<T: DeserializeOwned>(raw: Option<String>, column: &str) -> Result<Option<T>> {
    raw.as_deref().map(|raw| decode_json(raw, column)).transpose()
}
