//! Client for the external entity-resolution engine.
//!
//! The engine is the system of record; the replicator only ever asks it for
//! the current state of one entity, either by entity id or by record key.
//! `NOT_FOUND` is a normal answer (the entity was deleted) and maps to
//! `Ok(None)`.

use crate::types::{EngineDocument, EntityId};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Engine lookup failure. Transport-level problems are retryable; a document
/// the engine returned but we cannot interpret is not.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine returned status {status} for {context}")]
    Status {
        status: StatusCode,
        context: String,
    },

    #[error("engine returned a malformed document for {context}: {source}")]
    Malformed {
        context: String,
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Http(_) => true,
            EngineError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::Malformed { .. } => false,
        }
    }
}

/// HTTP client against the engine's JSON API.
pub struct HttpEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEngine {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent("Marten/1.0 (Entity Data Mart Replicator)")
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn fetch(&self, url: String, context: &str) -> Result<Option<EngineDocument>, EngineError> {
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("engine reports {} as not found", context);
                Ok(None)
            }
            status if status.is_success() => {
                let body = response.text().await?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|source| EngineError::Malformed {
                        context: context.to_string(),
                        source,
                    })
            }
            status => Err(EngineError::Status {
                status,
                context: context.to_string(),
            }),
        }
    }
}

/// In-memory engine fixture keyed by entity id and record key. Used by the
/// test suites and for dry runs without a live engine.
#[derive(Default)]
pub struct StaticEngine {
    entities: DashMap<EntityId, serde_json::Value>,
    records: DashMap<(String, String), EntityId>,
}

impl StaticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) an entity document. Record keys inside the
    /// document become addressable through `entity_by_record`.
    pub fn put_entity(&self, document: serde_json::Value) {
        let entity_id = document["RESOLVED_ENTITY"]["ENTITY_ID"]
            .as_i64()
            .expect("engine fixture document must carry RESOLVED_ENTITY.ENTITY_ID");

        // Drop record index entries from a previous version of this entity.
        self.records.retain(|_, owner| *owner != entity_id);
        if let Some(records) = document["RESOLVED_ENTITY"]["RECORDS"].as_array() {
            for record in records {
                if let (Some(source), Some(id)) =
                    (record["DATA_SOURCE"].as_str(), record["RECORD_ID"].as_str())
                {
                    self.records
                        .insert((source.to_string(), id.to_string()), entity_id);
                }
            }
        }
        self.entities.insert(entity_id, document);
    }

    /// Remove an entity, as if the engine had deleted it.
    pub fn remove_entity(&self, entity_id: EntityId) {
        self.entities.remove(&entity_id);
        self.records.retain(|_, owner| *owner != entity_id);
    }

    fn lookup(&self, entity_id: EntityId) -> Result<Option<EngineDocument>, EngineError> {
        match self.entities.get(&entity_id) {
            Some(doc) => serde_json::from_value(doc.value().clone())
                .map(Some)
                .map_err(|source| EngineError::Malformed {
                    context: format!("entity {entity_id}"),
                    source,
                }),
            None => Ok(None),
        }
    }
}

/// The engine interface used by the refresh and aggregation pipelines.
pub enum EngineClient {
    Http(HttpEngine),
    Static(StaticEngine),
}

impl EngineClient {
    pub fn http(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        EngineClient::Http(HttpEngine::new(base_url, api_key, timeout))
    }

    pub fn fixture() -> Self {
        EngineClient::Static(StaticEngine::new())
    }

    /// The underlying fixture, for tests that mutate engine state mid-run.
    pub fn as_fixture(&self) -> Option<&StaticEngine> {
        match self {
            EngineClient::Static(fixture) => Some(fixture),
            EngineClient::Http(_) => None,
        }
    }

    /// Current entity document by entity id; `None` means deleted.
    pub async fn entity_by_id(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EngineDocument>, EngineError> {
        match self {
            EngineClient::Http(engine) => {
                let url = format!("{}/entities/{}", engine.base_url, entity_id);
                engine.fetch(url, &format!("entity {entity_id}")).await
            }
            EngineClient::Static(fixture) => fixture.lookup(entity_id),
        }
    }

    /// Current entity document owning a record; `None` means the record is
    /// unknown to the engine.
    pub async fn entity_by_record(
        &self,
        data_source: &str,
        record_id: &str,
    ) -> Result<Option<EngineDocument>, EngineError> {
        match self {
            EngineClient::Http(engine) => {
                let url = format!(
                    "{}/entities?dataSource={}&recordId={}",
                    engine.base_url,
                    urlencode(data_source),
                    urlencode(record_id)
                );
                engine
                    .fetch(url, &format!("record {data_source}:{record_id}"))
                    .await
            }
            EngineClient::Static(fixture) => {
                match fixture
                    .records
                    .get(&(data_source.to_string(), record_id.to_string()))
                {
                    Some(owner) => fixture.lookup(*owner),
                    None => Ok(None),
                }
            }
        }
    }

    /// Reachability probe for `/health`. The fixture is always reachable.
    pub async fn ping(&self) -> bool {
        match self {
            EngineClient::Http(engine) => {
                let url = format!("{}/heartbeat", engine.base_url);
                match engine.client.get(&url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        warn!("engine heartbeat failed: {}", e);
                        false
                    }
                }
            }
            EngineClient::Static(_) => true,
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity_doc(entity_id: EntityId, records: &[(&str, &str)]) -> serde_json::Value {
        json!({
            "RESOLVED_ENTITY": {
                "ENTITY_ID": entity_id,
                "ENTITY_NAME": format!("Entity {entity_id}"),
                "RECORDS": records.iter().map(|(s, r)| json!({
                    "DATA_SOURCE": s,
                    "RECORD_ID": r,
                })).collect::<Vec<_>>(),
            },
            "RELATED_ENTITIES": [],
        })
    }

    #[tokio::test]
    async fn test_fixture_lookup_by_id() {
        let engine = EngineClient::fixture();
        engine
            .as_fixture()
            .unwrap()
            .put_entity(entity_doc(42, &[("A", "1")]));

        let doc = engine.entity_by_id(42).await.unwrap().unwrap();
        assert_eq!(doc.resolved_entity.entity_id, 42);
        assert!(engine.entity_by_id(43).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fixture_lookup_by_record() {
        let engine = EngineClient::fixture();
        engine
            .as_fixture()
            .unwrap()
            .put_entity(entity_doc(42, &[("A", "1"), ("B", "2")]));

        let doc = engine.entity_by_record("B", "2").await.unwrap().unwrap();
        assert_eq!(doc.resolved_entity.entity_id, 42);
        assert!(engine.entity_by_record("A", "9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fixture_record_index_follows_moves() {
        let engine = EngineClient::fixture();
        let fixture = engine.as_fixture().unwrap();
        fixture.put_entity(entity_doc(42, &[("A", "1"), ("A", "2")]));

        // Record (A,2) moves to a new entity 43.
        fixture.put_entity(entity_doc(42, &[("A", "1")]));
        fixture.put_entity(entity_doc(43, &[("A", "2")]));

        let doc = engine.entity_by_record("A", "2").await.unwrap().unwrap();
        assert_eq!(doc.resolved_entity.entity_id, 43);
    }

    #[tokio::test]
    async fn test_fixture_removal() {
        let engine = EngineClient::fixture();
        let fixture = engine.as_fixture().unwrap();
        fixture.put_entity(entity_doc(42, &[("A", "1")]));
        fixture.remove_entity(42);

        assert!(engine.entity_by_id(42).await.unwrap().is_none());
        assert!(engine.entity_by_record("A", "1").await.unwrap().is_none());
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("CUSTOMERS"), "CUSTOMERS");
        assert_eq!(urlencode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_retryability() {
        let err = EngineError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            context: "entity 1".to_string(),
        };
        assert!(err.is_retryable());

        let err = EngineError::Status {
            status: StatusCode::BAD_REQUEST,
            context: "entity 1".to_string(),
        };
        assert!(!err.is_retryable());

        let err = EngineError::Malformed {
            context: "entity 1".to_string(),
            source: serde_json::from_str::<i32>("x").unwrap_err(),
        };
        assert!(!err.is_retryable());
    }
}
