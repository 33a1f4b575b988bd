//! Affected-entity messages consumed from the ingestion channel.
//!
//! The bus adapters that deliver these are external; the consumer only
//! cares about the JSON body. Three shapes are accepted:
//!
//! ```text
//! {"ENTITY_ID": 42}
//! {"DATA_SOURCE": "CUSTOMERS", "RECORD_ID": "1001"}
//! {"DATA_SOURCE": "...", "RECORD_ID": "...", "AFFECTED_ENTITIES": [{"ENTITY_ID": 42}, ...]}
//! ```

use crate::types::entity::EntityId;
use serde::Deserialize;
use thiserror::Error;

/// One entity flagged as affected, addressed by id or by record key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffectedEntity {
    ById(EntityId),
    ByRecord {
        data_source: String,
        record_id: String,
    },
}

/// The message body could not be interpreted.
#[derive(Debug, Error)]
pub enum MessageParseError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message carries neither an entity id nor a record key")]
    MissingAddress,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "ENTITY_ID")]
    entity_id: Option<EntityId>,
    #[serde(rename = "DATA_SOURCE")]
    data_source: Option<String>,
    #[serde(rename = "RECORD_ID")]
    record_id: Option<String>,
    #[serde(rename = "AFFECTED_ENTITIES", default)]
    affected_entities: Vec<RawAffected>,
}

#[derive(Debug, Deserialize)]
struct RawAffected {
    #[serde(rename = "ENTITY_ID")]
    entity_id: EntityId,
}

/// Parse a raw message body into the entities it affects.
pub fn parse_message(body: &str) -> Result<Vec<AffectedEntity>, MessageParseError> {
    let raw: RawMessage = serde_json::from_str(body)?;

    if !raw.affected_entities.is_empty() {
        return Ok(raw
            .affected_entities
            .into_iter()
            .map(|a| AffectedEntity::ById(a.entity_id))
            .collect());
    }

    if let Some(entity_id) = raw.entity_id {
        return Ok(vec![AffectedEntity::ById(entity_id)]);
    }

    match (raw.data_source, raw.record_id) {
        (Some(data_source), Some(record_id)) => Ok(vec![AffectedEntity::ByRecord {
            data_source,
            record_id,
        }]),
        _ => Err(MessageParseError::MissingAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id_message() {
        let events = parse_message(r#"{"ENTITY_ID": 42}"#).unwrap();
        assert_eq!(events, vec![AffectedEntity::ById(42)]);
    }

    #[test]
    fn test_parse_record_key_message() {
        let events =
            parse_message(r#"{"DATA_SOURCE": "CUSTOMERS", "RECORD_ID": "1001"}"#).unwrap();
        assert_eq!(
            events,
            vec![AffectedEntity::ByRecord {
                data_source: "CUSTOMERS".to_string(),
                record_id: "1001".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_affected_entities_envelope() {
        let body = r#"{
            "DATA_SOURCE": "CUSTOMERS",
            "RECORD_ID": "1001",
            "AFFECTED_ENTITIES": [{"ENTITY_ID": 1}, {"ENTITY_ID": 2}]
        }"#;
        let events = parse_message(body).unwrap();
        assert_eq!(
            events,
            vec![AffectedEntity::ById(1), AffectedEntity::ById(2)]
        );
    }

    #[test]
    fn test_parse_rejects_unaddressed_message() {
        assert!(matches!(
            parse_message(r#"{"DATA_SOURCE": "CUSTOMERS"}"#),
            Err(MessageParseError::MissingAddress)
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            parse_message("not json"),
            Err(MessageParseError::Json(_))
        ));
    }
}
