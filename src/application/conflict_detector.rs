//! Field-level conflict detection and resolution
//!
//! 두 스냅샷(로컬 vs 원격)을 필드 단위로 비교해 충돌을 분류하고,
//! 선언적 해결 규칙으로 자동 해결을 시도합니다. 감지된 충돌은 큐에 보관되어
//! 상태별로 조회하거나 수동으로 해결할 수 있습니다.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::approval_rule::FieldPatterns;
use crate::domain::conflict::{
    Conflict, ConflictResolution, ConflictSeverity, ConflictStatus, ConflictType, FieldConflict,
    ResolutionStrategy,
};
use crate::domain::entity::FieldMap;
use crate::domain::errors::{SyncError, SyncResult};
use crate::infrastructure::bounded_cache::{CleanupLevel, Reclaimable};
use crate::infrastructure::config::ConflictConfig;

/// Field used to decide which side was modified last
const RECENCY_FIELD: &str = "updated_at";

/// Maps a field glob onto a resolution strategy; first match wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRule {
    pub field_pattern: String,
    pub strategy: ResolutionStrategy,
}

impl ResolutionRule {
    pub fn new(field_pattern: impl Into<String>, strategy: ResolutionStrategy) -> Self {
        Self {
            field_pattern: field_pattern.into(),
            strategy,
        }
    }
}

/// Rules shipped with the detector
pub fn default_resolution_rules() -> Vec<ResolutionRule> {
    vec![
        ResolutionRule::new("tags", ResolutionStrategy::UnionLists),
        ResolutionRule::new("image_urls", ResolutionStrategy::UnionLists),
        ResolutionRule::new("category_ids", ResolutionStrategy::UnionLists),
        ResolutionRule::new("inventory_*", ResolutionStrategy::PreferMostRecent),
        ResolutionRule::new("description", ResolutionStrategy::PreferMostRecent),
        ResolutionRule::new("sort_order", ResolutionStrategy::PreferSmaller),
    ]
}

/// Business weight of a field
pub fn field_severity(field: &str, key_field: &str) -> ConflictSeverity {
    if field == key_field {
        return ConflictSeverity::Critical;
    }
    match field {
        "sku" | "price" | "compare_at_price" | "cost" => ConflictSeverity::High,
        f if f.starts_with("inventory_") => ConflictSeverity::High,
        "title" | "handle" | "name" | "status" | "parent_id" => ConflictSeverity::Medium,
        _ => ConflictSeverity::Low,
    }
}

/// JSON equality where `10` and `10.0` are the same number
fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.as_f64() == y.as_f64(),
        (a, b) => a == b,
    }
}

fn same_json_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn record_timestamp(fields: &FieldMap) -> Option<DateTime<Utc>> {
    let raw = fields.get(RECENCY_FIELD)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn classify(source: Option<&Value>, target: Option<&Value>) -> ConflictType {
    match (source, target) {
        (Some(_), None) => ConflictType::MissingInTarget,
        (None, Some(_)) => ConflictType::MissingInSource,
        (Some(Value::Null), Some(_)) | (Some(_), Some(Value::Null)) => ConflictType::NullMismatch,
        (Some(s), Some(t)) if !same_json_kind(s, t) => ConflictType::TypeMismatch,
        _ => ConflictType::ValueMismatch,
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Side timestamps used by recency-based resolution
#[derive(Debug, Clone, Copy, Default)]
struct Recency {
    source: Option<DateTime<Utc>>,
    target: Option<DateTime<Utc>>,
}

/// Mechanically resolve one field
///
/// Outer `None` means the strategy does not apply; inner `None` means the
/// resolved record has no value for the field.
fn resolve_value(
    strategy: ResolutionStrategy,
    conflict: &FieldConflict,
    recency: Recency,
) -> Option<Option<Value>> {
    let source = conflict.source_value.as_ref();
    let target = conflict.target_value.as_ref();

    match strategy {
        ResolutionStrategy::PreferSource => Some(source.cloned()),
        ResolutionStrategy::PreferTarget => Some(target.cloned()),
        ResolutionStrategy::PreferNonNull => match (is_blank(source), is_blank(target)) {
            (false, true) => Some(source.cloned()),
            (true, false) => Some(target.cloned()),
            _ => None,
        },
        ResolutionStrategy::PreferMostRecent => {
            let (source_ts, target_ts) = (recency.source?, recency.target?);
            if source_ts == target_ts {
                return None;
            }
            Some(if source_ts > target_ts { source.cloned() } else { target.cloned() })
        }
        ResolutionStrategy::PreferLarger | ResolutionStrategy::PreferSmaller => {
            let s = source?.as_f64()?;
            let t = target?.as_f64()?;
            let pick_source = if strategy == ResolutionStrategy::PreferLarger { s >= t } else { s <= t };
            Some(if pick_source { source.cloned() } else { target.cloned() })
        }
        ResolutionStrategy::UnionLists => {
            let mut merged = source?.as_array()?.clone();
            for item in target?.as_array()? {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Some(Some(Value::Array(merged)))
        }
        ResolutionStrategy::Manual => None,
    }
}

/// Resolved record: `fields` with every conflicting field replaced
pub fn apply_resolution(fields: &FieldMap, conflict: &Conflict) -> Option<FieldMap> {
    let resolution = conflict.resolution.as_ref()?;
    let mut merged = fields.clone();
    for field in conflict.conflicting_fields() {
        match resolution.resolved_values.get(&field) {
            Some(value) => {
                merged.insert(field, value.clone());
            }
            None => {
                merged.remove(&field);
            }
        }
    }
    Some(merged)
}

struct QueuedConflict {
    conflict: Conflict,
    recency: Recency,
}

pub struct ConflictDetector {
    config: ConflictConfig,
    rules: Vec<ResolutionRule>,
    rule_patterns: FieldPatterns,
    queue: RwLock<HashMap<String, QueuedConflict>>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self::with_rules(config, default_resolution_rules())
    }

    pub fn with_rules(config: ConflictConfig, rules: Vec<ResolutionRule>) -> Self {
        let rule_patterns = FieldPatterns::lenient(rules.iter().map(|r| r.field_pattern.as_str()));
        Self {
            config,
            rules,
            rule_patterns,
            queue: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    fn suggest_strategy(&self, field: &str, conflict_type: ConflictType, key_field: &str) -> ResolutionStrategy {
        if field == key_field || conflict_type == ConflictType::TypeMismatch {
            return ResolutionStrategy::Manual;
        }
        if let Some(rule) = self
            .rule_patterns
            .first_match(field)
            .and_then(|position| self.rules.get(position))
        {
            return rule.strategy;
        }
        match conflict_type {
            ConflictType::MissingInSource | ConflictType::MissingInTarget | ConflictType::NullMismatch => {
                ResolutionStrategy::PreferNonNull
            }
            _ => ResolutionStrategy::PreferMostRecent,
        }
    }

    fn field_conflict(
        &self,
        field: &str,
        source: Option<&Value>,
        target: Option<&Value>,
        key_field: &str,
        recency: Recency,
    ) -> FieldConflict {
        let conflict_type = classify(source, target);
        let mut severity = field_severity(field, key_field);
        if conflict_type == ConflictType::TypeMismatch {
            severity = severity.escalate();
        }

        let strategy = self.suggest_strategy(field, conflict_type, key_field);
        let mut conflict = FieldConflict {
            field: field.to_string(),
            conflict_type,
            source_value: source.cloned(),
            target_value: target.cloned(),
            severity,
            auto_resolvable: false,
            suggested_strategy: strategy,
            confidence: 0.0,
        };
        if resolve_value(strategy, &conflict, recency).is_some() {
            conflict.auto_resolvable = true;
            conflict.confidence = strategy.confidence();
        }
        conflict
    }

    fn record_key(source: &FieldMap, target: &FieldMap, key_field: &str) -> String {
        source
            .get(key_field)
            .or_else(|| target.get(key_field))
            .map_or_else(
                || "unknown".to_string(),
                |value| value.as_str().map_or_else(|| value.to_string(), str::to_string),
            )
    }

    fn enqueue(&self, conflict: Conflict, recency: Recency) -> Conflict {
        info!(
            "⚠️ Conflict {} on {}: {} field(s), severity {}",
            conflict.conflict_id,
            conflict.record_key,
            conflict.field_conflicts.len(),
            conflict.severity
        );
        self.queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                conflict.conflict_id.clone(),
                QueuedConflict {
                    conflict: conflict.clone(),
                    recency,
                },
            );
        conflict
    }

    /// Two-way comparison; every differing, non-ignored field conflicts
    pub fn detect_conflicts(
        &self,
        source: &FieldMap,
        target: &FieldMap,
        key_field: &str,
        ignore_fields: &[String],
    ) -> Option<Conflict> {
        let recency = Recency {
            source: record_timestamp(source),
            target: record_timestamp(target),
        };
        let ignored = FieldPatterns::lenient(ignore_fields);
        let fields: BTreeSet<&String> = source.keys().chain(target.keys()).collect();
        let field_conflicts: Vec<FieldConflict> = fields
            .into_iter()
            .filter(|field| !ignored.is_match(field))
            .filter_map(|field| {
                let (s, t) = (source.get(field), target.get(field));
                (!values_equal(s, t)).then(|| self.field_conflict(field, s, t, key_field, recency))
            })
            .collect();

        if field_conflicts.is_empty() {
            return None;
        }
        let conflict = Conflict::from_fields(Self::record_key(source, target, key_field), field_conflicts);
        Some(self.enqueue(conflict, recency))
    }

    /// Three-way comparison against the common ancestor
    ///
    /// A field conflicts only when both sides changed it away from `base` to
    /// different values. Without a base this is [`detect_conflicts`](Self::detect_conflicts).
    pub fn detect_conflicts_with_base(
        &self,
        base: Option<&FieldMap>,
        source: &FieldMap,
        target: &FieldMap,
        key_field: &str,
        ignore_fields: &[String],
    ) -> Option<Conflict> {
        let Some(base) = base else {
            return self.detect_conflicts(source, target, key_field, ignore_fields);
        };

        let recency = Recency {
            source: record_timestamp(source),
            target: record_timestamp(target),
        };
        let ignored = FieldPatterns::lenient(ignore_fields);
        let fields: BTreeSet<&String> = base.keys().chain(source.keys()).chain(target.keys()).collect();
        let field_conflicts: Vec<FieldConflict> = fields
            .into_iter()
            .filter(|field| !ignored.is_match(field))
            .filter_map(|field| {
                let (b, s, t) = (base.get(field), source.get(field), target.get(field));
                let both_changed = !values_equal(s, t) && !values_equal(s, b) && !values_equal(t, b);
                both_changed.then(|| self.field_conflict(field, s, t, key_field, recency))
            })
            .collect();

        if field_conflicts.is_empty() {
            return None;
        }
        let conflict = Conflict::from_fields(Self::record_key(source, target, key_field), field_conflicts);
        Some(self.enqueue(conflict, recency))
    }

    /// Same as [`detect_conflicts`](Self::detect_conflicts) with configured key and ignore list
    pub fn detect(&self, source: &FieldMap, target: &FieldMap) -> Option<Conflict> {
        self.detect_conflicts(source, target, &self.config.key_field, &self.config.ignore_fields)
    }

    pub fn detect_with_base(&self, base: Option<&FieldMap>, source: &FieldMap, target: &FieldMap) -> Option<Conflict> {
        self.detect_conflicts_with_base(base, source, target, &self.config.key_field, &self.config.ignore_fields)
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Option<Conflict> {
        self.queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conflict_id)
            .map(|queued| queued.conflict.clone())
    }

    /// Queue view, most severe first then oldest
    pub fn list_conflicts(&self, status: Option<ConflictStatus>) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|queued| &queued.conflict)
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        conflicts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.detected_at.cmp(&b.detected_at))
        });
        conflicts
    }

    pub fn open_conflict_count(&self) -> usize {
        self.queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|queued| queued.conflict.status == ConflictStatus::Open)
            .count()
    }

    /// Associate a queued conflict with the change it blocks
    pub fn link_change(&self, conflict_id: &str, change_id: &str) -> SyncResult<()> {
        let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
        let queued = queue
            .get_mut(conflict_id)
            .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
        queued.conflict.change_id = Some(change_id.to_string());
        Ok(())
    }

    /// Open conflict blocking `change_id`, if any
    pub fn open_conflict_for_change(&self, change_id: &str) -> Option<Conflict> {
        self.queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|queued| &queued.conflict)
            .find(|c| !c.is_resolved() && c.change_id.as_deref() == Some(change_id))
            .cloned()
    }

    /// Settle a conflict by hand
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
        resolved_by: &str,
    ) -> SyncResult<Conflict> {
        let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
        let queued = queue
            .get_mut(conflict_id)
            .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
        if queued.conflict.is_resolved() {
            return Err(SyncError::Validation(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let conflict = &mut queued.conflict;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_by = Some(resolved_by.to_string());
        conflict.resolved_at = Some(Utc::now());
        let resolved = conflict.clone();
        Self::trim_resolved(&mut queue, self.config.max_resolved_conflicts, Some(conflict_id));
        info!("✅ Conflict {} resolved by {}", conflict_id, resolved_by);
        Ok(resolved)
    }

    /// Resolve every field with its suggested strategy
    ///
    /// Returns `None` and leaves the conflict open unless every field resolves.
    pub fn attempt_auto_resolution(&self, conflict_id: &str) -> SyncResult<Option<Conflict>> {
        let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
        let queued = queue
            .get_mut(conflict_id)
            .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
        if queued.conflict.is_resolved() {
            return Ok(Some(queued.conflict.clone()));
        }

        let mut resolved_values = FieldMap::new();
        let mut strategies = BTreeSet::new();
        for field_conflict in &queued.conflict.field_conflicts {
            let strategy = field_conflict.suggested_strategy;
            let Some(value) = resolve_value(strategy, field_conflict, queued.recency) else {
                debug!(
                    "Conflict {} needs review: {} cannot use {:?}",
                    conflict_id, field_conflict.field, strategy
                );
                return Ok(None);
            };
            if let Some(value) = value {
                resolved_values.insert(field_conflict.field.clone(), value);
            }
            strategies.insert(format!("{}={:?}", field_conflict.field, strategy));
        }

        let uniform = queued
            .conflict
            .field_conflicts
            .first()
            .map(|c| c.suggested_strategy)
            .filter(|first| {
                queued
                    .conflict
                    .field_conflicts
                    .iter()
                    .all(|c| c.suggested_strategy == *first)
            });

        let conflict = &mut queued.conflict;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(ConflictResolution {
            strategy: uniform,
            resolved_values,
            notes: Some(format!(
                "auto-resolved: {}",
                strategies.into_iter().collect::<Vec<_>>().join(", ")
            )),
        });
        conflict.resolved_by = Some("system".to_string());
        conflict.resolved_at = Some(Utc::now());
        let resolved = conflict.clone();
        Self::trim_resolved(&mut queue, self.config.max_resolved_conflicts, Some(conflict_id));
        info!("🤖 Conflict {} auto-resolved", conflict_id);
        Ok(Some(resolved))
    }

    /// Drop resolved conflicts from the queue
    pub fn purge_resolved(&self) -> usize {
        let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
        let before = queue.len();
        queue.retain(|_, queued| !queued.conflict.is_resolved());
        before - queue.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Keep at most `keep` resolved conflicts, oldest resolutions go first.
    /// Open conflicts are never dropped.
    fn trim_resolved(
        queue: &mut HashMap<String, QueuedConflict>,
        keep: usize,
        protect: Option<&str>,
    ) -> usize {
        let mut resolved: Vec<(Option<DateTime<Utc>>, String)> = queue
            .iter()
            .filter(|(id, queued)| queued.conflict.is_resolved() && Some(id.as_str()) != protect)
            .map(|(id, queued)| (queued.conflict.resolved_at, id.clone()))
            .collect();
        let keep = keep.saturating_sub(usize::from(protect.is_some()));
        if resolved.len() <= keep {
            return 0;
        }
        resolved.sort();
        let excess = resolved.len() - keep;
        for (_, id) in resolved.into_iter().take(excess) {
            queue.remove(&id);
        }
        debug!("Dropped {} resolved conflicts from the queue", excess);
        excess
    }
}

impl Reclaimable for ConflictDetector {
    fn reclaim(&self, level: CleanupLevel) -> usize {
        match level {
            CleanupLevel::Gentle => {
                let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
                Self::trim_resolved(&mut queue, self.config.max_resolved_conflicts / 2, None)
            }
            CleanupLevel::Forced => self.purge_resolved(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => FieldMap::new(),
        }
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::new(ConflictConfig::default())
    }

    #[test]
    fn test_identical_records_do_not_conflict() {
        let record = fields(json!({"sku": "A-1", "price": 10, "tags": ["x"]}));
        assert!(detector().detect(&record, &record).is_none());
    }

    #[test]
    fn test_integer_and_float_of_same_value_are_equal() {
        let a = fields(json!({"sku": "A-1", "price": 10}));
        let b = fields(json!({"sku": "A-1", "price": 10.0}));
        assert!(detector().detect(&a, &b).is_none());
    }

    #[test]
    fn test_ignored_fields_are_not_compared() {
        let a = fields(json!({"sku": "A-1", "updated_at": "2026-01-01T00:00:00Z"}));
        let b = fields(json!({"sku": "A-1", "updated_at": "2026-02-01T00:00:00Z"}));
        assert!(detector().detect(&a, &b).is_none());
    }

    #[test]
    fn test_field_types_and_severity() {
        let source = fields(json!({"sku": "A-1", "price": 10, "title": "Lamp", "vendor": "Acme", "note": null}));
        let target = fields(json!({"sku": "A-2", "price": "10", "title": "Desk lamp", "note": "hi"}));

        let conflict = detector().detect(&source, &target).unwrap();
        let by_field: HashMap<&str, &FieldConflict> = conflict
            .field_conflicts
            .iter()
            .map(|c| (c.field.as_str(), c))
            .collect();

        assert_eq!(by_field["sku"].severity, ConflictSeverity::Critical);
        assert!(!by_field["sku"].auto_resolvable);
        assert_eq!(by_field["price"].conflict_type, ConflictType::TypeMismatch);
        assert_eq!(by_field["price"].severity, ConflictSeverity::Critical);
        assert_eq!(by_field["title"].conflict_type, ConflictType::ValueMismatch);
        assert_eq!(by_field["title"].severity, ConflictSeverity::Medium);
        assert_eq!(by_field["vendor"].conflict_type, ConflictType::MissingInTarget);
        assert_eq!(by_field["note"].conflict_type, ConflictType::NullMismatch);
        assert!(by_field["note"].auto_resolvable);
        assert_eq!(by_field["note"].suggested_strategy, ResolutionStrategy::PreferNonNull);

        assert_eq!(conflict.severity, ConflictSeverity::Critical);
        assert!(!conflict.is_auto_resolvable);
        assert_eq!(conflict.record_key, "A-1");
    }

    #[test]
    fn test_disjoint_edits_do_not_conflict_three_way() {
        let base = fields(json!({"sku": "A-1", "price": 10.0, "description": "old"}));
        let local = fields(json!({"sku": "A-1", "price": 12.0, "description": "old"}));
        let remote = fields(json!({"sku": "A-1", "price": 10.0, "description": "new"}));
        assert!(detector().detect_with_base(Some(&base), &local, &remote).is_none());

        let remote_price = fields(json!({"sku": "A-1", "price": 11.0, "description": "new"}));
        let conflict = detector()
            .detect_with_base(Some(&base), &local, &remote_price)
            .unwrap();
        assert_eq!(conflict.conflicting_fields(), vec!["price".to_string()]);
    }

    #[test]
    fn test_auto_resolution_requires_every_field() {
        let detector = detector();
        let source = fields(json!({
            "sku": "A-1",
            "tags": ["a", "b"],
            "inventory_quantity": 5,
            "updated_at": "2026-03-02T00:00:00Z"
        }));
        let target = fields(json!({
            "sku": "A-1",
            "tags": ["b", "c"],
            "inventory_quantity": 7,
            "updated_at": "2026-03-01T00:00:00Z"
        }));
        let conflict = detector.detect(&source, &target).unwrap();
        assert!(conflict.is_auto_resolvable);

        let resolved = detector
            .attempt_auto_resolution(&conflict.conflict_id)
            .unwrap()
            .unwrap();
        let values = &resolved.resolution.as_ref().unwrap().resolved_values;
        assert_eq!(values["tags"], json!(["a", "b", "c"]));
        assert_eq!(values["inventory_quantity"], json!(5));
        assert_eq!(resolved.resolved_by.as_deref(), Some("system"));

        let merged = apply_resolution(&target, &resolved).unwrap();
        assert_eq!(merged["inventory_quantity"], json!(5));

        let blocked = detector
            .detect(
                &fields(json!({"sku": "B-1", "title": "x"})),
                &fields(json!({"sku": "B-1", "title": "y"})),
            )
            .unwrap();
        assert!(detector.attempt_auto_resolution(&blocked.conflict_id).unwrap().is_none());
        assert_eq!(detector.list_conflicts(Some(ConflictStatus::Open)).len(), 1);
    }

    #[test]
    fn test_manual_resolution_closes_conflict_once() {
        let detector = detector();
        let conflict = detector
            .detect(
                &fields(json!({"sku": "A-1", "title": "x"})),
                &fields(json!({"sku": "A-1", "title": "y"})),
            )
            .unwrap();
        let resolution = ConflictResolution {
            strategy: None,
            resolved_values: fields(json!({"title": "z"})),
            notes: Some("merged by hand".into()),
        };

        let resolved = detector
            .resolve_conflict(&conflict.conflict_id, resolution.clone(), "editor@shop")
            .unwrap();
        assert!(resolved.is_resolved());
        assert!(matches!(
            detector.resolve_conflict(&conflict.conflict_id, resolution, "editor@shop"),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            detector.resolve_conflict("missing", ConflictResolution {
                strategy: None,
                resolved_values: FieldMap::new(),
                notes: None,
            }, "x"),
            Err(SyncError::NotFound { .. })
        ));
        assert_eq!(detector.open_conflict_count(), 0);
        assert_eq!(detector.purge_resolved(), 1);
    }

    #[test]
    fn test_resolved_conflicts_are_bounded() {
        let detector = ConflictDetector::new(ConflictConfig {
            max_resolved_conflicts: 3,
            ..ConflictConfig::default()
        });
        let mut ids = Vec::new();
        for i in 0..6 {
            let conflict = detector
                .detect(
                    &fields(json!({"sku": format!("A-{i}"), "title": "x"})),
                    &fields(json!({"sku": format!("A-{i}"), "title": "y"})),
                )
                .unwrap();
            ids.push(conflict.conflict_id);
        }
        let open = detector
            .detect(
                &fields(json!({"sku": "B-1", "title": "x"})),
                &fields(json!({"sku": "B-1", "title": "y"})),
            )
            .unwrap();
        assert_eq!(detector.queue_len(), 7);

        for id in &ids {
            let resolution = ConflictResolution {
                strategy: Some(ResolutionStrategy::PreferSource),
                resolved_values: FieldMap::new(),
                notes: None,
            };
            detector.resolve_conflict(id, resolution, "editor").unwrap();
        }

        // 최근 해결된 3건과 열린 충돌만 남음
        assert_eq!(detector.queue_len(), 4);
        assert!(detector.get_conflict(&ids[5]).is_some());
        assert!(detector.get_conflict(&open.conflict_id).is_some());
        assert_eq!(detector.open_conflict_count(), 1);

        assert_eq!(detector.reclaim(CleanupLevel::Gentle), 2);
        assert_eq!(detector.reclaim(CleanupLevel::Forced), 1);
        assert_eq!(detector.queue_len(), 1);
        assert_eq!(detector.open_conflict_count(), 1);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
            proptest::collection::vec("[a-z]{0,4}", 0..4).prop_map(|v| json!(v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_identical_records_never_conflict(
            record in proptest::collection::btree_map("[a-z_]{1,10}", arb_value(), 0..12)
        ) {
            let detector = detector();
            prop_assert!(detector.detect_conflicts(&record, &record, "sku", &[]).is_none());
            prop_assert!(detector
                .detect_conflicts_with_base(Some(&record), &record, &record, "sku", &[])
                .is_none());
        }

        #[test]
        fn prop_auto_resolvable_iff_all_fields_are(
            source in proptest::collection::btree_map("[a-e]", arb_value(), 0..5),
            target in proptest::collection::btree_map("[a-e]", arb_value(), 0..5),
        ) {
            if let Some(conflict) = detector().detect_conflicts(&source, &target, "sku", &[]) {
                prop_assert_eq!(
                    conflict.is_auto_resolvable,
                    conflict.field_conflicts.iter().all(|c| c.auto_resolvable)
                );
            }
        }
    }
}
