//! Core model for entities, records, and relationships replicated into the
//! data mart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Entity identifier assigned by the resolution engine.
pub type EntityId = i64;

/// Relationship classification reported by the resolution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MatchType {
    AmbiguousMatch,
    PossibleMatch,
    DisclosedRelation,
    PossibleRelation,
}

impl MatchType {
    /// Wire form used by the engine and by report keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::AmbiguousMatch => "AMBIGUOUS_MATCH",
            MatchType::PossibleMatch => "POSSIBLE_MATCH",
            MatchType::DisclosedRelation => "DISCLOSED_RELATION",
            MatchType::PossibleRelation => "POSSIBLE_RELATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AMBIGUOUS_MATCH" => Some(MatchType::AmbiguousMatch),
            "POSSIBLE_MATCH" => Some(MatchType::PossibleMatch),
            "DISCLOSED_RELATION" => Some(MatchType::DisclosedRelation),
            "POSSIBLE_RELATION" => Some(MatchType::PossibleRelation),
            _ => None,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique address of a single input record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub data_source: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(data_source: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.data_source, self.record_id)
    }
}

/// A record as carried by an entity snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub data_source: String,
    pub record_id: String,
    pub match_key: Option<String>,
    pub principle: Option<String>,
}

impl EntityRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.data_source.clone(), self.record_id.clone())
    }
}

/// A related entity as seen from one side of a relationship edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedEntity {
    pub entity_id: EntityId,
    pub match_level: i64,
    pub match_key: Option<String>,
    pub match_type: MatchType,
    pub principle: Option<String>,
    /// Record count per data source on the related entity's side.
    pub source_summary: BTreeMap<String, i64>,
}

/// Point-in-time state of one resolved entity.
///
/// Records are kept sorted by `(data_source, record_id)` and related entities
/// are keyed by id, so two semantically equal snapshots compare equal and
/// serialize to identical hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub entity_name: Option<String>,
    pub records: Vec<EntityRecord>,
    pub related: BTreeMap<EntityId, RelatedEntity>,
}

impl EntitySnapshot {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            entity_name: None,
            records: Vec::new(),
            related: BTreeMap::new(),
        }
    }

    /// Restore canonical record order after construction.
    pub fn normalize(&mut self) {
        self.records
            .sort_by(|a, b| (a.data_source.as_str(), a.record_id.as_str()).cmp(&(b.data_source.as_str(), b.record_id.as_str())));
        self.records
            .dedup_by(|a, b| a.data_source == b.data_source && a.record_id == b.record_id);
    }

    pub fn record_count(&self) -> i64 {
        self.records.len() as i64
    }

    pub fn relation_count(&self) -> i64 {
        self.related.len() as i64
    }

    /// Record count per data source.
    pub fn source_breakdown(&self) -> BTreeMap<String, i64> {
        let mut breakdown = BTreeMap::new();
        for record in &self.records {
            *breakdown.entry(record.data_source.clone()).or_insert(0) += 1;
        }
        breakdown
    }

    pub fn has_record(&self, key: &RecordKey) -> bool {
        self.records
            .iter()
            .any(|r| r.data_source == key.data_source && r.record_id == key.record_id)
    }
}

/// Previously stored state of a relationship edge, recovered from its
/// canonical hash. Summaries are keyed by the canonical orientation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRelation {
    pub lo: EntityId,
    pub hi: EntityId,
    pub match_level: i64,
    pub match_key: Option<String>,
    pub match_type: MatchType,
    pub principle: Option<String>,
    pub lo_summary: BTreeMap<String, i64>,
    pub hi_summary: BTreeMap<String, i64>,
}

impl StoredRelation {
    /// Source summary for one endpoint, or `None` when the entity is not an
    /// endpoint of this edge.
    pub fn summary_for(&self, entity_id: EntityId) -> Option<&BTreeMap<String, i64>> {
        if entity_id == self.lo {
            Some(&self.lo_summary)
        } else if entity_id == self.hi {
            Some(&self.hi_summary)
        } else {
            None
        }
    }

    /// The opposite endpoint of `entity_id`, or `None` for a non-endpoint.
    pub fn other_end(&self, entity_id: EntityId) -> Option<EntityId> {
        if entity_id == self.lo {
            Some(self.hi)
        } else if entity_id == self.hi {
            Some(self.lo)
        } else {
            None
        }
    }
}
