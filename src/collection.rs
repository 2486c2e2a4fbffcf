//! Collection definitions: the unit of registration and strategy selection.

use std::collections::BTreeSet;

use crate::conflict::{ConflictStrategyName, MergeHints};

// ============================================================================
// SyncDirection
// ============================================================================

/// Which way records in a collection flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    UploadOnly,
    DownloadOnly,
    Bidirectional,
}

impl SyncDirection {
    pub fn uploads(self) -> bool {
        matches!(self, SyncDirection::UploadOnly | SyncDirection::Bidirectional)
    }

    pub fn downloads(self) -> bool {
        matches!(self, SyncDirection::DownloadOnly | SyncDirection::Bidirectional)
    }
}

/// Remote key naming convention, applied by adapters at the wire boundary.
/// Source backends disagree on this, so it is per-collection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldNameStyle {
    #[default]
    Snake,
    Camel,
}

// ============================================================================
// CollectionDef
// ============================================================================

/// A named, schema-homogeneous set of records subject to sync.
#[derive(Debug, Clone)]
pub struct CollectionDef {
    pub name: String,
    pub direction: SyncDirection,
    pub strategy: ConflictStrategyName,
    pub field_style: FieldNameStyle,
    pub merge_hints: MergeHints,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SyncDirection::Bidirectional,
            strategy: ConflictStrategyName::RemoteWins,
            field_style: FieldNameStyle::Snake,
            merge_hints: MergeHints::default(),
        }
    }
}

/// Start building a collection definition.
pub fn collection(name: impl Into<String>) -> CollectionBuilder {
    CollectionBuilder {
        def: CollectionDef::new(name),
    }
}

pub struct CollectionBuilder {
    def: CollectionDef,
}

impl CollectionBuilder {
    pub fn direction(mut self, direction: SyncDirection) -> Self {
        self.def.direction = direction;
        self
    }

    pub fn strategy(mut self, strategy: ConflictStrategyName) -> Self {
        self.def.strategy = strategy;
        self
    }

    pub fn field_style(mut self, style: FieldNameStyle) -> Self {
        self.def.field_style = style;
        self
    }

    /// Mark numeric fields merged as `monotone=min` by IntelligentMerge.
    pub fn monotone_min<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.def.merge_hints.monotone_min =
            fields.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        self
    }

    pub fn build(self) -> CollectionDef {
        self.def
    }
}

// ============================================================================
// Tests
// ============================================================================
