//! Domain module - sync entities, state machines and store interfaces
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod approval_rule;
pub mod conflict;
pub mod entity;
pub mod errors;
pub mod repositories;
pub mod rollback;
pub mod staged_change;
pub mod sync_batch;
pub mod sync_version;

pub use approval_rule::{
    ApprovalLevel, AutoApproveConditions, NewApprovalRule, SyncApprovalRule, ValueThreshold,
};
pub use conflict::{
    Conflict, ConflictResolution, ConflictSeverity, ConflictStatus, ConflictType, FieldConflict,
    ResolutionStrategy,
};
pub use entity::{
    CategorySnapshot, EntityRef, EntitySnapshot, EntityType, FieldMap, ProductSnapshot, entity_key,
};
pub use errors::{ItemError, ItemErrorKind, ParseEnumError, SyncError, SyncResult};
pub use rollback::{RollbackStatus, SyncRollback};
pub use staged_change::{
    ApplicationResult, ChangeStatus, ChangeType, FieldChange, StagedChange, SyncDirection,
};
pub use sync_batch::{BatchItemError, BatchStatus, SyncBatch};
pub use sync_version::{NewVersion, SourceSystem, SyncVersion};
