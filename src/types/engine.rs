//! JSON document shapes returned by the resolution engine.

use crate::types::entity::{EntityRecord, EntitySnapshot, MatchType, RelatedEntity};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Engine reported a match type outside the four known classifications.
#[derive(Debug, Error)]
#[error("unknown match type: {0}")]
pub struct UnknownMatchType(pub String);

/// Top-level entity document returned by `getEntity`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineDocument {
    #[serde(rename = "RESOLVED_ENTITY")]
    pub resolved_entity: ResolvedEntity,
    #[serde(rename = "RELATED_ENTITIES", default)]
    pub related_entities: Vec<EngineRelated>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedEntity {
    #[serde(rename = "ENTITY_ID")]
    pub entity_id: i64,
    #[serde(rename = "ENTITY_NAME", default)]
    pub entity_name: Option<String>,
    #[serde(rename = "RECORDS", default)]
    pub records: Vec<EngineRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineRecord {
    #[serde(rename = "DATA_SOURCE")]
    pub data_source: String,
    #[serde(rename = "RECORD_ID")]
    pub record_id: String,
    #[serde(rename = "MATCH_KEY", default)]
    pub match_key: Option<String>,
    #[serde(rename = "ERRULE_CODE", default)]
    pub errule_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineRelated {
    #[serde(rename = "ENTITY_ID")]
    pub entity_id: i64,
    #[serde(rename = "MATCH_LEVEL", default)]
    pub match_level: i64,
    #[serde(rename = "MATCH_KEY", default)]
    pub match_key: Option<String>,
    #[serde(rename = "MATCH_TYPE")]
    pub match_type: String,
    #[serde(rename = "ERRULE_CODE", default)]
    pub errule_code: Option<String>,
    #[serde(rename = "RECORD_SUMMARY", default)]
    pub record_summary: Vec<EngineRecordSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineRecordSummary {
    #[serde(rename = "DATA_SOURCE")]
    pub data_source: String,
    #[serde(rename = "RECORD_COUNT")]
    pub record_count: i64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl EngineDocument {
    /// Convert the engine document into the canonical snapshot form.
    pub fn into_snapshot(self) -> Result<EntitySnapshot, UnknownMatchType> {
        let mut snapshot = EntitySnapshot::new(self.resolved_entity.entity_id);
        snapshot.entity_name = non_empty(self.resolved_entity.entity_name);

        for record in self.resolved_entity.records {
            snapshot.records.push(EntityRecord {
                data_source: record.data_source,
                record_id: record.record_id,
                match_key: non_empty(record.match_key),
                principle: non_empty(record.errule_code),
            });
        }
        snapshot.normalize();

        for related in self.related_entities {
            let match_type = MatchType::parse(&related.match_type)
                .ok_or_else(|| UnknownMatchType(related.match_type.clone()))?;
            let mut source_summary = BTreeMap::new();
            for summary in related.record_summary {
                *source_summary.entry(summary.data_source).or_insert(0) += summary.record_count;
            }
            snapshot.related.insert(
                related.entity_id,
                RelatedEntity {
                    entity_id: related.entity_id,
                    match_level: related.match_level,
                    match_key: non_empty(related.match_key),
                    match_type,
                    principle: non_empty(related.errule_code),
                    source_summary,
                },
            );
        }

        Ok(snapshot)
    }
}
