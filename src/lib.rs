//! Catalog Sync - staged, versioned and reversible catalog synchronization
//!
//! Changes to products and categories are detected against a versioned
//! history, staged for rule-based or human approval, applied to the remote
//! platform through a chunked batch engine and can be rolled back to the
//! previous version.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{SyncEngine, ValidationSummary};
pub use domain::{SyncError, SyncResult};
pub use infrastructure::AppConfig;
