//! Tasks dispatched through the scheduler and the resource keys that
//! serialize them.

use crate::types::entity::EntityId;
use crate::types::report::ReportKey;
use serde_json::json;
use std::fmt;

/// Action kinds executed by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskAction {
    RefreshEntity,
    UpdateDataSourceSummary,
    UpdateCrossSourceSummary,
    UpdateEntitySizeBreakdown,
    UpdateEntityRelationBreakdown,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::RefreshEntity => "REFRESH_ENTITY",
            TaskAction::UpdateDataSourceSummary => "UPDATE_DATA_SOURCE_SUMMARY",
            TaskAction::UpdateCrossSourceSummary => "UPDATE_CROSS_SOURCE_SUMMARY",
            TaskAction::UpdateEntitySizeBreakdown => "UPDATE_ENTITY_SIZE_BREAKDOWN",
            TaskAction::UpdateEntityRelationBreakdown => "UPDATE_ENTITY_RELATION_BREAKDOWN",
        }
    }

    /// The aggregator action responsible for one report key.
    pub fn for_report(key: &ReportKey) -> Self {
        match key {
            ReportKey::DataSourceSummary { .. } => TaskAction::UpdateDataSourceSummary,
            ReportKey::CrossSourceSummary { .. } => TaskAction::UpdateCrossSourceSummary,
            ReportKey::EntitySizeBreakdown { .. } => TaskAction::UpdateEntitySizeBreakdown,
            ReportKey::EntityRelationBreakdown { .. } => TaskAction::UpdateEntityRelationBreakdown,
        }
    }

    pub fn is_report_update(&self) -> bool {
        !matches!(self, TaskAction::RefreshEntity)
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work queued for the worker pool. The resource key is the
/// scheduler's deduplication handle: tasks sharing a key are coalesced so at
/// most one executes at a time.
#[derive(Debug, Clone)]
pub struct Task {
    pub action: TaskAction,
    pub resource_key: String,
    pub params: serde_json::Value,
}

impl Task {
    pub fn refresh_entity(entity_id: EntityId) -> Self {
        Self {
            action: TaskAction::RefreshEntity,
            resource_key: format!("ENTITY|{entity_id}"),
            params: json!({ "entityId": entity_id }),
        }
    }

    pub fn update_report(key: &ReportKey) -> Self {
        let key_string = key.to_string();
        Self {
            action: TaskAction::for_report(key),
            resource_key: key_string.clone(),
            params: json!({ "reportKey": key_string }),
        }
    }

    /// The `entityId` parameter, when present and integral.
    pub fn entity_id(&self) -> Option<EntityId> {
        self.params.get("entityId").and_then(|v| v.as_i64())
    }

    /// The `reportKey` parameter, when present.
    pub fn report_key(&self) -> Option<&str> {
        self.params.get("reportKey").and_then(|v| v.as_str())
    }
}

/// Canonical key of one row in the resource lock table.
///
/// The derived ordering is the lock acquisition order: all `RECORD` keys
/// sort before all `RELATIONSHIP` keys, records lexicographically by
/// `(data_source, record_id)`, relationship edges numerically by `(lo, hi)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    Record {
        data_source: String,
        record_id: String,
    },
    Relationship {
        lo: EntityId,
        hi: EntityId,
    },
}

impl ResourceKey {
    pub fn record(data_source: impl Into<String>, record_id: impl Into<String>) -> Self {
        ResourceKey::Record {
            data_source: data_source.into(),
            record_id: record_id.into(),
        }
    }

    /// Canonically oriented relationship key; accepts endpoints in any order.
    pub fn relationship(a: EntityId, b: EntityId) -> Self {
        ResourceKey::Relationship {
            lo: a.min(b),
            hi: a.max(b),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Record {
                data_source,
                record_id,
            } => write!(f, "RECORD|{data_source}|{record_id}"),
            ResourceKey::Relationship { lo, hi } => write!(f, "RELATIONSHIP|{lo}|{hi}"),
        }
    }
}
