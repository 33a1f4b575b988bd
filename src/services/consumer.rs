//! Consumption of affected-entity messages.
//!
//! The consumer drains a channel of raw JSON bodies (fed by the admin
//! surface or any external bus adapter), materializes an entity id per
//! event, and schedules one refresh task per distinct entity. Backpressure
//! comes from the scheduler's high/low-water marks.

use crate::error::TaskError;
use crate::services::scheduler::Scheduler;
use crate::sources::EngineClient;
use crate::types::{parse_message, AffectedEntity, EntityId, Task};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Turns affected-entity messages into refresh tasks.
pub struct MessageConsumer {
    engine: Arc<EngineClient>,
    scheduler: Arc<Scheduler>,
}

impl MessageConsumer {
    pub fn new(engine: Arc<EngineClient>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self { engine, scheduler })
    }

    /// Spawn `parallelism` consumers sharing one message channel. They run
    /// until the channel closes.
    pub fn start(self: Arc<Self>, rx: mpsc::Receiver<String>, parallelism: usize) {
        info!("starting {} message consumer(s)", parallelism);
        let rx = Arc::new(Mutex::new(rx));
        for consumer_id in 0..parallelism {
            let consumer = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let message = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(body) = message else {
                        debug!("consumer {} shutting down, channel closed", consumer_id);
                        break;
                    };

                    consumer.scheduler.throttle().await;
                    match consumer.process(&body).await {
                        Ok(count) => debug!(
                            "consumer {} scheduled {} refresh task(s)",
                            consumer_id, count
                        ),
                        Err(e) if e.is_retryable() => {
                            // At-least-once: the adapter that fed the channel
                            // redelivers on a negative outcome; all we can do
                            // here is surface it.
                            warn!("consumer {} transient failure: {}", consumer_id, e);
                        }
                        Err(e) => error!("consumer {} dropped message: {}", consumer_id, e),
                    }
                }
            });
        }
    }

    /// Schedule refresh tasks for every distinct entity a message affects.
    /// Returns the number of entities scheduled.
    pub async fn process(&self, body: &str) -> Result<usize, TaskError> {
        let events = parse_message(body)?;

        let mut entity_ids: BTreeSet<EntityId> = BTreeSet::new();
        for event in events {
            match event {
                AffectedEntity::ById(entity_id) => {
                    entity_ids.insert(entity_id);
                }
                AffectedEntity::ByRecord {
                    data_source,
                    record_id,
                } => match self.engine.entity_by_record(&data_source, &record_id).await? {
                    Some(document) => {
                        entity_ids.insert(document.resolved_entity.entity_id);
                    }
                    None => {
                        warn!(
                            "record {}:{} is unknown to the engine, skipping",
                            data_source, record_id
                        );
                    }
                },
            }
        }

        for entity_id in &entity_ids {
            self.scheduler.schedule(Task::refresh_entity(*entity_id)).await;
        }
        Ok(entity_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture_with_entity(entity_id: EntityId, records: &[(&str, &str)]) -> Arc<EngineClient> {
        let engine = EngineClient::fixture();
        engine.as_fixture().unwrap().put_entity(json!({
            "RESOLVED_ENTITY": {
                "ENTITY_ID": entity_id,
                "RECORDS": records.iter().map(|(s, r)| json!({
                    "DATA_SOURCE": s,
                    "RECORD_ID": r,
                })).collect::<Vec<_>>(),
            },
        }));
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_entity_id_message_schedules_refresh() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        let consumer = MessageConsumer::new(Arc::new(EngineClient::fixture()), scheduler);

        let count = consumer.process(r#"{"ENTITY_ID": 42}"#).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(rx.recv().await.unwrap().resource_key, "ENTITY|42");
    }

    #[tokio::test]
    async fn test_record_key_message_resolves_through_engine() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        let engine = fixture_with_entity(7, &[("A", "1")]);
        let consumer = MessageConsumer::new(engine, scheduler);

        let count = consumer
            .process(r#"{"DATA_SOURCE": "A", "RECORD_ID": "1"}"#)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(rx.recv().await.unwrap().resource_key, "ENTITY|7");
    }

    #[tokio::test]
    async fn test_unknown_record_is_skipped() {
        let (scheduler, _rx) = Scheduler::new(16, 8, 2);
        let consumer = MessageConsumer::new(Arc::new(EngineClient::fixture()), scheduler.clone());

        let count = consumer
            .process(r#"{"DATA_SOURCE": "A", "RECORD_ID": "404"}"#)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(scheduler.depth(), 0);
    }

    #[tokio::test]
    async fn test_affected_entities_deduplicate() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        let consumer = MessageConsumer::new(Arc::new(EngineClient::fixture()), scheduler.clone());

        let body = r#"{"AFFECTED_ENTITIES": [{"ENTITY_ID": 1}, {"ENTITY_ID": 2}, {"ENTITY_ID": 1}]}"#;
        let count = consumer.process(body).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(rx.recv().await.unwrap().resource_key, "ENTITY|1");
        assert_eq!(rx.recv().await.unwrap().resource_key, "ENTITY|2");
    }

    #[tokio::test]
    async fn test_malformed_message_is_fatal() {
        let (scheduler, _rx) = Scheduler::new(16, 8, 2);
        let consumer = MessageConsumer::new(Arc::new(EngineClient::fixture()), scheduler);

        let err = consumer.process("not json").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
