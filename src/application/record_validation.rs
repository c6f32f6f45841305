//! Catalog record validation transform
//!
//! 필수 필드가 빠진 레코드는 영구 실패로, 비활성 레코드는 사전 조건에 의한
//! 건너뜀으로 처리합니다.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::entity::FieldMap;
use crate::domain::errors::ItemError;
use crate::infrastructure::batch_engine::{BatchItem, BatchTransform, ItemOutcome};

/// Status values that take a record out of validation
const INACTIVE_STATUSES: [&str; 3] = ["archived", "inactive", "deleted"];

/// One input record, usually a line of a JSON-lines file
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRecord {
    /// 1-based source line
    pub line: usize,
    pub fields: FieldMap,
    /// Set when the line could not be decoded into an object
    pub parse_error: Option<String>,
}

impl CatalogRecord {
    pub fn new(line: usize, fields: FieldMap) -> Self {
        Self {
            line,
            fields,
            parse_error: None,
        }
    }

    /// Decode one JSON-lines entry; malformed lines become failing records
    pub fn parse_line(line: usize, raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self::new(line, map.into_iter().collect()),
            Ok(other) => Self {
                line,
                fields: FieldMap::new(),
                parse_error: Some(format!("expected a JSON object, got {other}")),
            },
            Err(e) => Self {
                line,
                fields: FieldMap::new(),
                parse_error: Some(e.to_string()),
            },
        }
    }

    fn is_inactive(&self) -> bool {
        if self.fields.get("active") == Some(&Value::Bool(false)) {
            return true;
        }
        self.fields
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|status| {
                INACTIVE_STATUSES
                    .iter()
                    .any(|inactive| status.eq_ignore_ascii_case(inactive))
            })
    }
}

impl BatchItem for CatalogRecord {
    fn item_id(&self) -> String {
        match self.fields.get("sku").and_then(Value::as_str) {
            Some(sku) => format!("line {} ({sku})", self.line),
            None => format!("line {}", self.line),
        }
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Fails records lacking any of `required_fields`
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    required_fields: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new<I, S>(required_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_fields: required_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// sku, title, price
    pub fn for_products() -> Self {
        Self::new(["sku", "title", "price"])
    }

    pub fn validate(&self, record: &CatalogRecord) -> ItemOutcome {
        if let Some(parse_error) = &record.parse_error {
            return ItemOutcome::failed(ItemError::permanent(format!(
                "malformed record: {parse_error}"
            )));
        }
        if record.is_inactive() {
            return ItemOutcome::skipped("record is inactive");
        }

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| is_missing(record.fields.get(field.as_str())))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            ItemOutcome::Success
        } else {
            ItemOutcome::failed(ItemError::permanent(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

#[async_trait]
impl BatchTransform<CatalogRecord> for RequiredFieldsValidator {
    async fn transform(&self, items: &[CatalogRecord]) -> Vec<ItemOutcome> {
        items.iter().map(|record| self.validate(record)).collect()
    }
}
