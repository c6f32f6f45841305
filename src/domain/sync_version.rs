//! Immutable, hashed snapshots of an entity's synced state

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntitySnapshot, EntityType};
use super::errors::ParseEnumError;

/// Which side a snapshot was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    Local,
    Remote,
}

impl SourceSystem {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(ParseEnumError::new("source_system", other)),
        }
    }
}

/// One entry of an entity's append-only version chain
///
/// `(entity_type, entity_id, version_number)` is unique and version numbers
/// start at 1 and increase by exactly one per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncVersion {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub remote_id: Option<String>,
    pub version_hash: String,
    pub version_number: i64,
    pub data_snapshot: EntitySnapshot,
    pub source_system: SourceSystem,
    /// Staged change whose application produced this version, if any
    pub change_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncVersion {
    /// Cheap equality check against another snapshot
    pub fn matches(&self, snapshot: &EntitySnapshot) -> bool {
        self.version_hash == snapshot.content_hash()
    }
}

/// Input for appending a version; number and hash are assigned by the store
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub remote_id: Option<String>,
    pub data_snapshot: EntitySnapshot,
    pub source_system: SourceSystem,
    pub change_id: Option<String>,
}

impl NewVersion {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        data_snapshot: EntitySnapshot,
        source_system: SourceSystem,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            remote_id: None,
            data_snapshot,
            source_system,
            change_id: None,
        }
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: Option<String>) -> Self {
        self.remote_id = remote_id;
        self
    }

    #[must_use]
    pub fn with_change_id(mut self, change_id: impl Into<String>) -> Self {
        self.change_id = Some(change_id.into());
        self
    }
}
