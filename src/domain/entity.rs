//! Entity identity and snapshot schemas
//!
//! Every record under sync is addressed by `(entity_type, entity_id)` plus an
//! optional remote identifier. Snapshots are a tagged union over the known
//! schemas (product, category) with a dynamic key-value fallback for payloads
//! whose shape we do not own.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{ParseEnumError, SyncError, SyncResult};

/// Generic field-level view of a record
pub type FieldMap = BTreeMap<String, Value>;

/// Kind of entity kept in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Category,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Category => "category",
        }
    }

    /// Name of the matching resource on the remote platform
    pub const fn remote_resource(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Category => "collection",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(Self::Product),
            "category" | "collection" => Ok(Self::Category),
            other => Err(ParseEnumError::new("entity_type", other)),
        }
    }
}

/// Address of a synced record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub remote_id: Option<String>,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            remote_id: None,
        }
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn key(&self) -> String {
        entity_key(self.entity_type, &self.entity_id)
    }
}

/// Stable map key for per-entity locks and caches
pub fn entity_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{}", entity_type.as_str(), entity_id)
}

/// Product record as exchanged with the remote platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_at_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Remote fields without a typed home (metafields, channel data, ...)
    #[serde(flatten)]
    pub extra: FieldMap,
}

/// Category (remote: collection) record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: FieldMap,
}

/// Snapshot of an entity's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", content = "data", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Product(ProductSnapshot),
    Category(CategorySnapshot),
    /// Payload whose schema is not known to the engine
    Dynamic(FieldMap),
    /// The entity was deleted at this point in its history
    Tombstone,
}

impl EntitySnapshot {
    /// Flatten the snapshot into its field-level view
    pub fn to_fields(&self) -> FieldMap {
        let value = match self {
            Self::Product(product) => serde_json::to_value(product),
            Self::Category(category) => serde_json::to_value(category),
            Self::Dynamic(fields) => return fields.clone(),
            Self::Tombstone => return FieldMap::new(),
        };

        match value {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => FieldMap::new(),
        }
    }

    /// Rebuild a typed snapshot from a field map
    ///
    /// Type mismatches on typed fields are validation errors, never silently
    /// dropped.
    pub fn from_fields(entity_type: EntityType, fields: FieldMap) -> SyncResult<Self> {
        let object = Value::Object(fields.into_iter().collect());
        match entity_type {
            EntityType::Product => serde_json::from_value(object)
                .map(Self::Product)
                .map_err(|e| SyncError::Validation(format!("invalid product payload: {e}"))),
            EntityType::Category => serde_json::from_value(object)
                .map(Self::Category)
                .map_err(|e| SyncError::Validation(format!("invalid category payload: {e}"))),
        }
    }

    pub const fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    pub const fn schema_name(&self) -> &'static str {
        match self {
            Self::Product(_) => "product",
            Self::Category(_) => "category",
            Self::Dynamic(_) => "dynamic",
            Self::Tombstone => "tombstone",
        }
    }

    /// Content hash of the snapshot, written through a caller-supplied buffer
    ///
    /// Field maps are ordered, so equal content always hashes equally.
    pub fn content_hash_with(&self, buffer: &mut Vec<u8>) -> String {
        buffer.clear();
        buffer.extend_from_slice(self.schema_name().as_bytes());
        buffer.push(b'\n');
        // BTreeMap<String, Value> serialization cannot fail
        let _ = serde_json::to_writer(&mut *buffer, &self.to_fields());
        blake3::hash(buffer).to_hex().to_string()
    }

    pub fn content_hash(&self) -> String {
        let mut buffer = Vec::with_capacity(512);
        self.content_hash_with(&mut buffer)
    }
}
