//! Application layer module
//!
//! Services that orchestrate the domain: conflict detection, approval rules,
//! staging and application of changes, rollback, record validation, health
//! reporting and the engine facade that wires them together.

pub mod approval_engine;
pub mod conflict_detector;
pub mod record_validation;
pub mod rollback_manager;
pub mod staging_service;
pub mod sync_engine;
pub mod sync_health;

pub use approval_engine::{ApprovalDecision, ApprovalRuleEngine, evaluate_rules};
pub use conflict_detector::{ConflictDetector, ResolutionRule, default_resolution_rules};
pub use record_validation::{CatalogRecord, RequiredFieldsValidator};
pub use rollback_manager::RollbackManager;
pub use staging_service::{StageRequest, StagingService};
pub use sync_engine::{SyncEngine, ValidationSummary};
pub use sync_health::{HealthStatus, SyncHealthReport, SyncHealthService};
