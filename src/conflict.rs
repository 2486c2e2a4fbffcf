//! Conflict detection and resolution.
//!
//! A conflict exists when an update or delete from one side targets a
//! record whose `sync_version` on the other side differs from the version
//! observed at read time. Resolution is pure: strategies never touch the
//! store or the network; the orchestrator applies the chosen record.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::record::SyncRecord;

// ============================================================================
// Strategy names
// ============================================================================

/// The six resolution strategies, selectable per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategyName {
    LocalWins,
    RemoteWins,
    TimestampWins,
    IntelligentMerge,
    FieldLevelDetection,
    Custom,
}

impl ConflictStrategyName {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategyName::LocalWins => "local_wins",
            ConflictStrategyName::RemoteWins => "remote_wins",
            ConflictStrategyName::TimestampWins => "timestamp_wins",
            ConflictStrategyName::IntelligentMerge => "intelligent_merge",
            ConflictStrategyName::FieldLevelDetection => "field_level_detection",
            ConflictStrategyName::Custom => "custom",
        }
    }
}

/// Per-collection hints consumed by IntelligentMerge.
#[derive(Debug, Clone, Default)]
pub struct MergeHints {
    /// Numeric fields merged as `monotone=min` (smaller value wins).
    pub monotone_min: BTreeSet<String>,
}

// ============================================================================
// Descriptor and resolution
// ============================================================================

/// A structured description of one per-row divergence, handed to the
/// resolver. Lives from detection to resolution, within one cycle.
#[derive(Debug, Clone)]
pub struct ConflictDescriptor {
    pub collection: String,
    pub record_id: String,
    pub local: SyncRecord,
    pub remote: SyncRecord,
    /// Application fields whose values differ (absent values compare as null).
    pub field_conflicts: Map<String, Value>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictDescriptor {
    pub fn new(collection: impl Into<String>, local: SyncRecord, remote: SyncRecord) -> Self {
        let field_conflicts = detect_field_conflicts(&local.fields, &remote.fields);
        Self {
            collection: collection.into(),
            record_id: local.id.clone(),
            local,
            remote,
            field_conflicts,
            detected_at: Utc::now(),
        }
    }

    /// Event-payload form: both snapshots plus the per-field diff.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("collection".into(), Value::String(self.collection.clone()));
        map.insert("record_id".into(), Value::String(self.record_id.clone()));
        map.insert("local".into(), Value::Object(self.local.to_map()));
        map.insert("remote".into(), Value::Object(self.remote.to_map()));
        map.insert(
            "field_conflicts".into(),
            Value::Object(self.field_conflicts.clone()),
        );
        map.insert(
            "detected_at".into(),
            Value::String(self.detected_at.to_rfc3339()),
        );
        Value::Object(map)
    }
}

/// Compute the per-field diff of two application-field maps. Each entry is
/// `{"local_value": .., "remote_value": ..}`; a side missing the field
/// contributes null.
pub fn detect_field_conflicts(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut keys: Vec<&String> = local.keys().collect();
    for k in remote.keys() {
        if !local.contains_key(k) {
            keys.push(k);
        }
    }

    let mut conflicts = Map::new();
    for key in keys {
        let l = local.get(key).cloned().unwrap_or(Value::Null);
        let r = remote.get(key).cloned().unwrap_or(Value::Null);
        if l != r {
            let mut entry = Map::new();
            entry.insert("local_value".into(), l);
            entry.insert("remote_value".into(), r);
            conflicts.insert(key.clone(), Value::Object(entry));
        }
    }
    conflicts
}

/// Which side the resolved record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSide {
    Local,
    Remote,
    Merged,
}

/// The resolver's output: the chosen record, its origin, the strategy that
/// produced it, and strategy-specific metadata.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: SyncRecord,
    pub side: ResolutionSide,
    pub strategy: ConflictStrategyName,
    pub resolved_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// Caller-supplied resolution function, used by the Custom strategy and as
/// the decision hook for FieldLevelDetection. Errors (or a panicking
/// implementation caught upstream) fall back to the configured safe default.
pub type CustomResolveFn =
    Arc<dyn Fn(&ConflictDescriptor) -> std::result::Result<Resolution, String> + Send + Sync>;

// ============================================================================
// Resolver
// ============================================================================

/// Strategy-driven conflict resolver. Pure: no I/O, no suspension.
#[derive(Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategyName,
    hints: MergeHints,
    custom: Option<CustomResolveFn>,
    /// Safe default when Custom / FieldLevelDetection cannot decide.
    fallback: ConflictStrategyName,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategyName) -> Self {
        Self {
            strategy,
            hints: MergeHints::default(),
            custom: None,
            fallback: ConflictStrategyName::RemoteWins,
        }
    }

    pub fn with_hints(mut self, hints: MergeHints) -> Self {
        self.hints = hints;
        self
    }

    /// Install the decision function for Custom / FieldLevelDetection.
    pub fn with_custom(mut self, f: CustomResolveFn) -> Self {
        self.custom = Some(f);
        self
    }

    /// Override the fallback used when a custom function fails. Must be
    /// one of the non-delegating strategies.
    pub fn with_fallback(mut self, fallback: ConflictStrategyName) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn strategy(&self) -> ConflictStrategyName {
        self.strategy
    }

    /// Resolve a conflict. Always produces a resolution; delegating
    /// strategies that fail fall back to the configured default.
    pub fn resolve(&self, desc: &ConflictDescriptor) -> Resolution {
        // Deletion conflicts are resolved by policy before field logic:
        // delete wins over update unless the strategy pins a side.
        if desc.local.is_deleted != desc.remote.is_deleted
            && !matches!(
                self.strategy,
                ConflictStrategyName::LocalWins | ConflictStrategyName::RemoteWins
            )
        {
            let (record, side) = if desc.local.is_deleted {
                (desc.local.clone(), ResolutionSide::Local)
            } else {
                (desc.remote.clone(), ResolutionSide::Remote)
            };
            let mut metadata = Map::new();
            metadata.insert("delete_wins".into(), Value::Bool(true));
            return Resolution {
                record,
                side,
                strategy: self.strategy,
                resolved_at: Utc::now(),
                metadata,
            };
        }

        match self.strategy {
            ConflictStrategyName::LocalWins => take_side(desc, ResolutionSide::Local, self.strategy),
            ConflictStrategyName::RemoteWins => {
                take_side(desc, ResolutionSide::Remote, self.strategy)
            }
            ConflictStrategyName::TimestampWins => timestamp_wins(desc, self.strategy),
            ConflictStrategyName::IntelligentMerge => intelligent_merge(desc, &self.hints),
            ConflictStrategyName::FieldLevelDetection | ConflictStrategyName::Custom => {
                self.delegate(desc)
            }
        }
    }

    fn delegate(&self, desc: &ConflictDescriptor) -> Resolution {
        if let Some(ref f) = self.custom {
            match f(desc) {
                Ok(mut resolution) => {
                    resolution.strategy = self.strategy;
                    if self.strategy == ConflictStrategyName::FieldLevelDetection {
                        resolution
                            .metadata
                            .insert("field_conflicts".into(), Value::Object(desc.field_conflicts.clone()));
                    }
                    return resolution;
                }
                Err(e) => {
                    tracing::warn!(
                        collection = %desc.collection,
                        record_id = %desc.record_id,
                        error = %e,
                        "custom conflict resolution failed, using fallback"
                    );
                }
            }
        }

        let mut resolution = ConflictResolver::new(self.fallback)
            .with_hints(self.hints.clone())
            .resolve(desc);
        resolution
            .metadata
            .insert("fallback_from".into(), Value::String(self.strategy.as_str().into()));
        resolution
    }
}

// ============================================================================
// Simple strategies
// ============================================================================

fn take_side(
    desc: &ConflictDescriptor,
    side: ResolutionSide,
    strategy: ConflictStrategyName,
) -> Resolution {
    let record = match side {
        ResolutionSide::Local => desc.local.clone(),
        _ => desc.remote.clone(),
    };
    Resolution {
        record,
        side,
        strategy,
        resolved_at: Utc::now(),
        metadata: Map::new(),
    }
}

/// Newer `updated_at` wins; ties broken by higher `sync_version`, then by
/// origin ("local" < "remote"). Clock skew is not corrected; the chosen
/// timestamps are recorded in the resolution metadata.
fn timestamp_wins(desc: &ConflictDescriptor, strategy: ConflictStrategyName) -> Resolution {
    let side = newer_side(&desc.local, &desc.remote);
    let mut resolution = take_side(desc, side, strategy);
    resolution.metadata.insert(
        "local_updated_at".into(),
        Value::String(desc.local.updated_at.to_rfc3339()),
    );
    resolution.metadata.insert(
        "remote_updated_at".into(),
        Value::String(desc.remote.updated_at.to_rfc3339()),
    );
    resolution
}

fn newer_side(local: &SyncRecord, remote: &SyncRecord) -> ResolutionSide {
    match local.updated_at.cmp(&remote.updated_at) {
        std::cmp::Ordering::Greater => ResolutionSide::Local,
        std::cmp::Ordering::Less => ResolutionSide::Remote,
        std::cmp::Ordering::Equal => match local.sync_version.cmp(&remote.sync_version) {
            std::cmp::Ordering::Greater => ResolutionSide::Local,
            std::cmp::Ordering::Less => ResolutionSide::Remote,
            // "local" < "remote": deterministic lexicographic tie-break
            std::cmp::Ordering::Equal => ResolutionSide::Local,
        },
    }
}

// ============================================================================
// IntelligentMerge
// ============================================================================

/// Beyond this nesting depth, the newer side's value is taken wholesale.
const MAX_MERGE_DEPTH: usize = 100;

/// Field-level reconciliation. Per-field rules:
/// one-sided and equal values are taken; type mismatches fall back to the
/// newer side; strings take the newer non-empty value; numbers take the
/// larger (or smaller, under a `monotone=min` hint); `true` beats `false`;
/// arrays union by value preserving local order; objects merge recursively.
fn intelligent_merge(desc: &ConflictDescriptor, hints: &MergeHints) -> Resolution {
    let remote_newer = matches!(newer_side(&desc.local, &desc.remote), ResolutionSide::Remote);

    let merged_fields = merge_maps(&desc.local.fields, &desc.remote.fields, remote_newer, hints, 0);

    let mut record = desc.local.clone();
    record.fields = merged_fields;
    record.sync_version = desc.local.sync_version.max(desc.remote.sync_version) + 1;
    record.updated_at = desc.local.updated_at.max(desc.remote.updated_at);
    record.is_dirty = true;

    let mut metadata = Map::new();
    metadata.insert(
        "merged_fields".into(),
        Value::Array(
            desc.field_conflicts
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect(),
        ),
    );
    metadata.insert(
        "local_updated_at".into(),
        Value::String(desc.local.updated_at.to_rfc3339()),
    );
    metadata.insert(
        "remote_updated_at".into(),
        Value::String(desc.remote.updated_at.to_rfc3339()),
    );

    Resolution {
        record,
        side: ResolutionSide::Merged,
        strategy: ConflictStrategyName::IntelligentMerge,
        resolved_at: Utc::now(),
        metadata,
    }
}

fn merge_maps(
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    remote_newer: bool,
    hints: &MergeHints,
    depth: usize,
) -> Map<String, Value> {
    let mut merged = Map::new();

    // Local keys first (preserves local field order), then remote extras.
    for (key, l) in local {
        match remote.get(key) {
            None => {
                merged.insert(key.clone(), l.clone());
            }
            Some(r) => {
                merged.insert(key.clone(), merge_values(key, l, r, remote_newer, hints, depth));
            }
        }
    }
    for (key, r) in remote {
        if !local.contains_key(key) {
            merged.insert(key.clone(), r.clone());
        }
    }
    merged
}

fn merge_values(
    field: &str,
    local: &Value,
    remote: &Value,
    remote_newer: bool,
    hints: &MergeHints,
    depth: usize,
) -> Value {
    if local == remote {
        return local.clone();
    }
    let newer = if remote_newer { remote } else { local };
    if depth > MAX_MERGE_DEPTH {
        return newer.clone();
    }

    match (local, remote) {
        (Value::String(l), Value::String(r)) => {
            // Newer non-empty value; both empty stays empty.
            let (newer_s, older_s) = if remote_newer { (r, l) } else { (l, r) };
            if !newer_s.is_empty() {
                Value::String(newer_s.clone())
            } else {
                Value::String(older_s.clone())
            }
        }

        (Value::Number(l), Value::Number(r)) => {
            let lf = l.as_f64().unwrap_or(0.0);
            let rf = r.as_f64().unwrap_or(0.0);
            if (lf - rf).abs() < f64::EPSILON {
                return newer.clone();
            }
            let take_local = if hints.monotone_min.contains(field) {
                lf < rf
            } else {
                lf > rf
            };
            if take_local {
                Value::Number(l.clone())
            } else {
                Value::Number(r.clone())
            }
        }

        (Value::Bool(l), Value::Bool(r)) => Value::Bool(*l || *r),

        (Value::Array(l), Value::Array(r)) => {
            // Union by value equality: local order, then remote extras.
            let mut union = l.clone();
            for item in r {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            Value::Array(union)
        }

        (Value::Object(l), Value::Object(r)) => {
            Value::Object(merge_maps(l, r, remote_newer, hints, depth + 1))
        }

        // Differing types: per-field timestamp fallback.
        _ => newer.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
