//! Infrastructure layer for persistence, execution and external integrations
//!
//! This module provides the database connection and SQLite repositories, the
//! batch execution engine, memory monitoring, streaming and bounded caches,
//! the remote platform client, configuration and logging.

pub mod batch_engine; // Chunked parallel batch executor
pub mod bounded_cache;
pub mod config; // Layered configuration
pub mod database_connection;
pub mod entity_locks; // Per-entity async locks
pub mod logging; // Logging infrastructure
pub mod memory_monitor;
pub mod remote_platform; // Remote catalog client + rate limiting
pub mod retry_manager;
pub mod sqlite_approval_rule_repository;
pub mod sqlite_batch_repository;
pub mod sqlite_rollback_repository;
pub mod sqlite_staged_change_repository;
pub mod sqlite_version_repository;
pub mod streaming;

// Re-export commonly used items
pub use batch_engine::{
    BatchItem, BatchProcessor, BatchProgress, BatchTransform, ChunkFn, ItemFn, ItemOutcome,
    SystemStats,
};
pub use bounded_cache::{BoundedCache, CleanupLevel, ObjectPool, Reclaimable};
pub use config::AppConfig;
pub use database_connection::DatabaseConnection;
pub use entity_locks::EntityLocks;
pub use logging::{LogGuard, get_log_directory, init_logging_with_config};
pub use memory_monitor::{MemoryMonitor, MemoryPressure, MemoryStats};
pub use remote_platform::{InMemoryPlatform, RateLimitedPlatform, RemoteError, RemotePlatform};
pub use retry_manager::{BackoffSchedule, RetryPolicy, StandardFailureClassifier};
pub use sqlite_approval_rule_repository::SqliteApprovalRuleRepository;
pub use sqlite_batch_repository::SqliteBatchRepository;
pub use sqlite_rollback_repository::SqliteRollbackRepository;
pub use sqlite_staged_change_repository::SqliteStagedChangeRepository;
pub use sqlite_version_repository::SqliteVersionRepository;
pub use streaming::StreamingChunkProcessor;
