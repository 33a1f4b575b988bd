//! Canonical serialization of entity snapshots and relationship edges.
//!
//! The "hash" of an entity is not a digest: it is a stable, line-based
//! rendering of the snapshot whose textual equality implies semantic
//! equality, and which parses back into the snapshot it was produced from.
//! That round trip is what lets a refresh reconstruct the previously
//! replicated state from `sz_dm_entity.entity_hash` alone, with no second
//! query against the engine.
//!
//! Format, one line per element, elements in canonical order:
//!
//! ```text
//! E|<entity_id>|<entity_name>
//! R|<data_source>|<record_id>|<match_key>|<principle>
//! L|<related_id>|<match_type>|<match_level>|<match_key>|<principle>|<src=cnt,...>
//! ```
//!
//! Relationship rows use a single-line form carrying both endpoints'
//! per-source record counts:
//!
//! ```text
//! X|<lo>|<hi>|<match_level>|<match_type>|<match_key>|<principle>|<lo src=cnt,...>|<hi src=cnt,...>
//! ```
//!
//! Free-text fields are percent-escaped so the `|`, `,`, `=`, and newline
//! delimiters stay unambiguous; absent optional fields render as the empty
//! string.

use crate::types::{EntityId, EntityRecord, EntitySnapshot, MatchType, RelatedEntity, StoredRelation};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// A stored hash string could not be interpreted.
#[derive(Debug, Error)]
pub enum HashParseError {
    #[error("hash is empty")]
    Empty,
    #[error("hash line {line}: unexpected tag {tag:?}")]
    UnexpectedTag { line: usize, tag: String },
    #[error("hash line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("hash line {line}: invalid number {value:?}")]
    InvalidNumber { line: usize, value: String },
    #[error("hash line {line}: unknown match type {value:?}")]
    UnknownMatchType { line: usize, value: String },
    #[error("hash line {line}: invalid source summary token {value:?}")]
    InvalidSummary { line: usize, value: String },
    #[error("hash line {line}: invalid escape in {value:?}")]
    InvalidEscape { line: usize, value: String },
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            ',' => out.push_str("%2C"),
            '=' => out.push_str("%3D"),
            '\n' => out.push_str("%0A"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(value: &str, line: usize) -> Result<String, HashParseError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => out.push('%'),
            "7C" => out.push('|'),
            "2C" => out.push(','),
            "3D" => out.push('='),
            "0A" => out.push('\n'),
            _ => {
                return Err(HashParseError::InvalidEscape {
                    line,
                    value: value.to_string(),
                })
            }
        }
    }
    Ok(out)
}

fn opt_field(value: &Option<String>) -> String {
    value.as_deref().map(escape).unwrap_or_default()
}

fn parse_opt_field(value: &str, line: usize) -> Result<Option<String>, HashParseError> {
    if value.is_empty() {
        Ok(None)
    } else {
        unescape(value, line).map(Some)
    }
}

fn parse_number(value: &str, line: usize) -> Result<i64, HashParseError> {
    value.parse().map_err(|_| HashParseError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}

fn parse_match_type(value: &str, line: usize) -> Result<MatchType, HashParseError> {
    MatchType::parse(value).ok_or_else(|| HashParseError::UnknownMatchType {
        line,
        value: value.to_string(),
    })
}

fn render_summary(summary: &BTreeMap<String, i64>) -> String {
    let mut out = String::new();
    for (i, (source, count)) in summary.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}={}", escape(source), count);
    }
    out
}

fn parse_summary(value: &str, line: usize) -> Result<BTreeMap<String, i64>, HashParseError> {
    let mut summary = BTreeMap::new();
    if value.is_empty() {
        return Ok(summary);
    }
    for token in value.split(',') {
        let (source, count) = token.split_once('=').ok_or_else(|| HashParseError::InvalidSummary {
            line,
            value: token.to_string(),
        })?;
        summary.insert(unescape(source, line)?, parse_number(count, line)?);
    }
    Ok(summary)
}

/// Render the canonical hash of an entity snapshot.
pub fn entity_hash(snapshot: &EntitySnapshot) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "E|{}|{}",
        snapshot.entity_id,
        opt_field(&snapshot.entity_name)
    );

    let mut records: Vec<&EntityRecord> = snapshot.records.iter().collect();
    records.sort_by(|a, b| {
        (a.data_source.as_str(), a.record_id.as_str())
            .cmp(&(b.data_source.as_str(), b.record_id.as_str()))
    });
    for record in records {
        let _ = write!(
            out,
            "\nR|{}|{}|{}|{}",
            escape(&record.data_source),
            escape(&record.record_id),
            opt_field(&record.match_key),
            opt_field(&record.principle)
        );
    }

    for related in snapshot.related.values() {
        let _ = write!(
            out,
            "\nL|{}|{}|{}|{}|{}|{}",
            related.entity_id,
            related.match_type,
            related.match_level,
            opt_field(&related.match_key),
            opt_field(&related.principle),
            render_summary(&related.source_summary)
        );
    }

    out
}

/// Reconstruct a snapshot from its canonical hash.
pub fn parse_entity_hash(hash: &str) -> Result<EntitySnapshot, HashParseError> {
    if hash.is_empty() {
        return Err(HashParseError::Empty);
    }

    let mut lines = hash.lines().enumerate();
    let (_, header) = lines.next().ok_or(HashParseError::Empty)?;
    let fields: Vec<&str> = header.split('|').collect();
    if fields.first() != Some(&"E") {
        return Err(HashParseError::UnexpectedTag {
            line: 1,
            tag: fields.first().unwrap_or(&"").to_string(),
        });
    }
    if fields.len() != 3 {
        return Err(HashParseError::FieldCount {
            line: 1,
            expected: 3,
            found: fields.len(),
        });
    }

    let mut snapshot = EntitySnapshot::new(parse_number(fields[1], 1)?);
    snapshot.entity_name = parse_opt_field(fields[2], 1)?;

    for (index, text) in lines {
        let line = index + 1;
        let fields: Vec<&str> = text.split('|').collect();
        match fields[0] {
            "R" => {
                if fields.len() != 5 {
                    return Err(HashParseError::FieldCount {
                        line,
                        expected: 5,
                        found: fields.len(),
                    });
                }
                snapshot.records.push(EntityRecord {
                    data_source: unescape(fields[1], line)?,
                    record_id: unescape(fields[2], line)?,
                    match_key: parse_opt_field(fields[3], line)?,
                    principle: parse_opt_field(fields[4], line)?,
                });
            }
            "L" => {
                if fields.len() != 7 {
                    return Err(HashParseError::FieldCount {
                        line,
                        expected: 7,
                        found: fields.len(),
                    });
                }
                let related_id = parse_number(fields[1], line)?;
                snapshot.related.insert(
                    related_id,
                    RelatedEntity {
                        entity_id: related_id,
                        match_type: parse_match_type(fields[2], line)?,
                        match_level: parse_number(fields[3], line)?,
                        match_key: parse_opt_field(fields[4], line)?,
                        principle: parse_opt_field(fields[5], line)?,
                        source_summary: parse_summary(fields[6], line)?,
                    },
                );
            }
            tag => {
                return Err(HashParseError::UnexpectedTag {
                    line,
                    tag: tag.to_string(),
                })
            }
        }
    }

    snapshot.normalize();
    Ok(snapshot)
}

/// Render the canonical hash of a relationship edge.
pub fn relation_hash(relation: &StoredRelation) -> String {
    format!(
        "X|{}|{}|{}|{}|{}|{}|{}|{}",
        relation.lo,
        relation.hi,
        relation.match_level,
        relation.match_type,
        opt_field(&relation.match_key),
        opt_field(&relation.principle),
        render_summary(&relation.lo_summary),
        render_summary(&relation.hi_summary)
    )
}

/// Reconstruct a relationship edge from its canonical hash.
pub fn parse_relation_hash(hash: &str) -> Result<StoredRelation, HashParseError> {
    if hash.is_empty() {
        return Err(HashParseError::Empty);
    }
    let fields: Vec<&str> = hash.split('|').collect();
    if fields[0] != "X" {
        return Err(HashParseError::UnexpectedTag {
            line: 1,
            tag: fields[0].to_string(),
        });
    }
    if fields.len() != 9 {
        return Err(HashParseError::FieldCount {
            line: 1,
            expected: 9,
            found: fields.len(),
        });
    }

    Ok(StoredRelation {
        lo: parse_number(fields[1], 1)?,
        hi: parse_number(fields[2], 1)?,
        match_level: parse_number(fields[3], 1)?,
        match_type: parse_match_type(fields[4], 1)?,
        match_key: parse_opt_field(fields[5], 1)?,
        principle: parse_opt_field(fields[6], 1)?,
        lo_summary: parse_summary(fields[7], 1)?,
        hi_summary: parse_summary(fields[8], 1)?,
    })
}

/// Build the stored form of a relationship as seen from `entity_id`, whose
/// own source breakdown is `my_summary`.
pub fn stored_relation_from(
    entity_id: EntityId,
    my_summary: BTreeMap<String, i64>,
    related: &RelatedEntity,
) -> StoredRelation {
    let (lo, hi) = if entity_id < related.entity_id {
        (entity_id, related.entity_id)
    } else {
        (related.entity_id, entity_id)
    };
    let (lo_summary, hi_summary) = if entity_id == lo {
        (my_summary, related.source_summary.clone())
    } else {
        (related.source_summary.clone(), my_summary)
    };
    StoredRelation {
        lo,
        hi,
        match_level: related.match_level,
        match_key: related.match_key.clone(),
        match_type: related.match_type,
        principle: related.principle.clone(),
        lo_summary,
        hi_summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> EntitySnapshot {
        let mut snapshot = EntitySnapshot::new(42);
        snapshot.entity_name = Some("Jane | Smith, Jr.".to_string());
        snapshot.records = vec![
            EntityRecord {
                data_source: "CUSTOMERS".to_string(),
                record_id: "1001".to_string(),
                match_key: Some("+NAME+DOB".to_string()),
                principle: Some("SF1".to_string()),
            },
            EntityRecord {
                data_source: "WATCHLIST".to_string(),
                record_id: "W-3".to_string(),
                match_key: None,
                principle: None,
            },
        ];
        snapshot.related.insert(
            77,
            RelatedEntity {
                entity_id: 77,
                match_level: 3,
                match_key: Some("+ADDRESS".to_string()),
                match_type: MatchType::PossibleMatch,
                principle: None,
                source_summary: BTreeMap::from([
                    ("CUSTOMERS".to_string(), 2),
                    ("VENDORS".to_string(), 1),
                ]),
            },
        );
        snapshot
    }

    #[test]
    fn test_entity_hash_round_trip() {
        let snapshot = sample_snapshot();
        let hash = entity_hash(&snapshot);
        let parsed = parse_entity_hash(&hash).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_hash_is_order_insensitive() {
        let snapshot = sample_snapshot();
        let mut shuffled = snapshot.clone();
        shuffled.records.reverse();
        assert_eq!(entity_hash(&snapshot), entity_hash(&shuffled));
    }

    #[test]
    fn test_hash_differs_when_record_moves() {
        let snapshot = sample_snapshot();
        let mut other = snapshot.clone();
        other.records.pop();
        assert_ne!(entity_hash(&snapshot), entity_hash(&other));
    }

    #[test]
    fn test_minimal_entity_hash() {
        let snapshot = EntitySnapshot::new(7);
        let hash = entity_hash(&snapshot);
        assert_eq!(hash, "E|7|");
        assert_eq!(parse_entity_hash(&hash).unwrap(), snapshot);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_entity_hash(""), Err(HashParseError::Empty)));
        assert!(matches!(
            parse_entity_hash("Z|1|x"),
            Err(HashParseError::UnexpectedTag { .. })
        ));
        assert!(matches!(
            parse_entity_hash("E|seven|"),
            Err(HashParseError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_entity_hash("E|1|\nR|A|1"),
            Err(HashParseError::FieldCount { .. })
        ));
        assert!(matches!(
            parse_entity_hash("E|1|\nL|2|RESOLVED|1|||"),
            Err(HashParseError::UnknownMatchType { .. })
        ));
        assert!(matches!(
            parse_entity_hash("E|1|\nL|2|POSSIBLE_MATCH|1|||A:2"),
            Err(HashParseError::InvalidSummary { .. })
        ));
    }

    #[test]
    fn test_escaped_fields_round_trip() {
        let mut snapshot = EntitySnapshot::new(1);
        snapshot.entity_name = Some("100%|=,\nescaped".to_string());
        snapshot.records.push(EntityRecord {
            data_source: "S|1".to_string(),
            record_id: "a,b=c".to_string(),
            match_key: None,
            principle: None,
        });
        let parsed = parse_entity_hash(&entity_hash(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_relation_hash_round_trip() {
        let relation = StoredRelation {
            lo: 10,
            hi: 11,
            match_level: 2,
            match_key: Some("+NAME".to_string()),
            match_type: MatchType::DisclosedRelation,
            principle: Some("DR1".to_string()),
            lo_summary: BTreeMap::from([("A".to_string(), 1)]),
            hi_summary: BTreeMap::from([("B".to_string(), 3)]),
        };
        let hash = relation_hash(&relation);
        assert_eq!(parse_relation_hash(&hash).unwrap(), relation);
    }

    #[test]
    fn test_stored_relation_orientation() {
        let related = RelatedEntity {
            entity_id: 5,
            match_level: 1,
            match_key: None,
            match_type: MatchType::PossibleMatch,
            principle: None,
            source_summary: BTreeMap::from([("B".to_string(), 2)]),
        };
        let mine = BTreeMap::from([("A".to_string(), 1)]);

        // Seen from the higher-numbered side the summaries swap ends.
        let stored = stored_relation_from(9, mine.clone(), &related);
        assert_eq!((stored.lo, stored.hi), (5, 9));
        assert_eq!(stored.lo_summary.get("B"), Some(&2));
        assert_eq!(stored.hi_summary.get("A"), Some(&1));

        let stored = stored_relation_from(3, mine, &related);
        assert_eq!((stored.lo, stored.hi), (3, 5));
        assert_eq!(stored.lo_summary.get("A"), Some(&1));
        assert_eq!(stored.hi_summary.get("B"), Some(&2));
    }

    #[test]
    fn test_relation_hash_rejects_garbage() {
        assert!(parse_relation_hash("").is_err());
        assert!(parse_relation_hash("E|1|").is_err());
        assert!(parse_relation_hash("X|1|2|3").is_err());
    }
}
