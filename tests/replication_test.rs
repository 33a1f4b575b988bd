//! Whole-pipeline invariants: messages in, consistent mart out.

use marten::services::hash_codec::{entity_hash, parse_entity_hash};
use marten::services::{
    DataMartStore, MessageConsumer, RefreshService, ReportAggregator, RetryPolicy, Scheduler,
    WorkerPool,
};
use marten::sources::EngineClient;
use marten::types::{EntityId, RecordKey};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    store: Arc<DataMartStore>,
    engine: Arc<EngineClient>,
    scheduler: Arc<Scheduler>,
    consumer: Arc<MessageConsumer>,
}

impl Pipeline {
    fn start() -> Self {
        let store = Arc::new(DataMartStore::new_in_memory().unwrap());
        let engine = Arc::new(EngineClient::fixture());
        let (scheduler, task_rx) = Scheduler::new(1024, 512, 128);
        let refresher = RefreshService::new(store.clone(), engine.clone());
        let aggregator = ReportAggregator::new(store.clone(), engine.clone());
        WorkerPool::start(
            4,
            task_rx,
            scheduler.clone(),
            refresher,
            aggregator,
            RetryPolicy::default(),
        );
        let consumer = MessageConsumer::new(engine.clone(), scheduler.clone());
        Self {
            store,
            engine,
            scheduler,
            consumer,
        }
    }

    fn put_entity(&self, document: Value) {
        self.engine.as_fixture().unwrap().put_entity(document);
    }

    async fn notify(&self, entity_id: EntityId) {
        self.consumer
            .process(&json!({ "ENTITY_ID": entity_id }).to_string())
            .await
            .unwrap();
    }

    /// Wait until the task queue is empty and every resource key released.
    async fn drain(&self) {
        for _ in 0..400 {
            if self.scheduler.depth() == 0 && self.scheduler.in_flight() == 0 {
                // One more beat to let just-finished tasks settle.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.scheduler.depth() == 0 && self.scheduler.in_flight() == 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("pipeline did not drain");
    }

    /// Check the structural invariants over the whole mart.
    fn assert_invariants(&self) {
        let counts = self.store.table_counts().unwrap();
        assert_eq!(counts.pending, 0, "pending queue must be drained");

        for entity_id in self.known_entities() {
            let entity = self.store.entity_row(entity_id).unwrap().unwrap();

            // The stored hash parses back into a snapshot with the same hash.
            let snapshot = parse_entity_hash(&entity.entity_hash).unwrap();
            assert_eq!(entity_hash(&snapshot), entity.entity_hash);
            assert_eq!(snapshot.entity_id, entity_id);

            // Counts on the entity row agree with the snapshot and the
            // actual record rows.
            assert_eq!(entity.record_count, snapshot.record_count());
            for record in &snapshot.records {
                let row = self
                    .store
                    .record_row(&RecordKey::new(&*record.data_source, &*record.record_id))
                    .unwrap()
                    .unwrap();
                assert_eq!(row.entity_id, entity_id);
            }

            // Every stored edge is canonically oriented.
            let relations = self.store.relations_for(entity_id).unwrap();
            assert_eq!(entity.relation_count, relations.len() as i64);
            for relation in &relations {
                assert!(relation.entity_id < relation.related_id);
            }
        }
    }

    fn known_entities(&self) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for id in 1..100 {
            if self.store.entity_row(id).unwrap().is_some() {
                ids.push(id);
            }
        }
        ids
    }
}

fn entity_json(entity_id: i64, records: &[(&str, &str)], related: Vec<Value>) -> Value {
    json!({
        "RESOLVED_ENTITY": {
            "ENTITY_ID": entity_id,
            "ENTITY_NAME": format!("Entity {entity_id}"),
            "RECORDS": records.iter().map(|(source, id)| json!({
                "DATA_SOURCE": source,
                "RECORD_ID": id,
            })).collect::<Vec<_>>(),
        },
        "RELATED_ENTITIES": related,
    })
}

fn related_json(entity_id: i64, match_type: &str, summary: &[(&str, i64)]) -> Value {
    json!({
        "ENTITY_ID": entity_id,
        "MATCH_LEVEL": 2,
        "MATCH_TYPE": match_type,
        "RECORD_SUMMARY": summary.iter().map(|(source, count)| json!({
            "DATA_SOURCE": source,
            "RECORD_COUNT": count,
        })).collect::<Vec<_>>(),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_replicates_and_aggregates() {
    let p = Pipeline::start();
    p.put_entity(entity_json(1, &[("A", "1"), ("A", "2")], vec![]));
    p.put_entity(entity_json(2, &[("A", "3"), ("B", "1")], vec![]));
    p.put_entity(entity_json(3, &[("B", "2")], vec![]));

    for id in [1, 2, 3] {
        p.notify(id).await;
    }
    p.drain().await;
    p.assert_invariants();

    // The folded DSS entity count matches the live table contents.
    for source in ["A", "B"] {
        let folded = p
            .store
            .report_row(&format!("DSS|{source}|{source}|ENTITY_COUNT"))
            .unwrap()
            .unwrap()
            .entity_count;
        assert_eq!(folded, p.store.entity_count_for_source(source).unwrap());
    }

    // Size breakdown: two entities with two records, one with one.
    assert_eq!(p.store.report_row("ESB|2").unwrap().unwrap().entity_count, 2);
    assert_eq!(p.store.report_row("ESB|1").unwrap().unwrap().entity_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_follows_relationships() {
    let p = Pipeline::start();
    p.put_entity(entity_json(
        10,
        &[("A", "1")],
        vec![related_json(11, "POSSIBLE_MATCH", &[("B", 1)])],
    ));
    p.put_entity(entity_json(
        11,
        &[("B", "1")],
        vec![related_json(10, "POSSIBLE_MATCH", &[("A", 1)])],
    ));

    // Only entity 10 is notified; 11 arrives via the follow-up.
    p.notify(10).await;
    p.drain().await;
    p.assert_invariants();

    assert!(p.store.entity_row(11).unwrap().is_some());
    let relations = p.store.relations_for(10).unwrap();
    assert_eq!(relations.len(), 1);

    let css = p
        .store
        .report_row("CSS|A|B|POSSIBLE_MATCH_COUNT")
        .unwrap()
        .unwrap();
    assert_eq!(css.relation_count, 1);
    assert_eq!(css.record_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replayed_notifications_are_idempotent() {
    let p = Pipeline::start();
    p.put_entity(entity_json(1, &[("A", "1"), ("A", "2")], vec![]));

    p.notify(1).await;
    p.drain().await;

    let hash = p.store.entity_row(1).unwrap().unwrap().entity_hash;
    let esb = p.store.report_row("ESB|2").unwrap().unwrap().entity_count;

    // At-least-once delivery: the same notification lands four more times.
    for _ in 0..4 {
        p.notify(1).await;
    }
    p.drain().await;
    p.assert_invariants();

    assert_eq!(p.store.entity_row(1).unwrap().unwrap().entity_hash, hash);
    assert_eq!(p.store.report_row("ESB|2").unwrap().unwrap().entity_count, esb);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_handles_deletion_and_reconciliation() {
    let p = Pipeline::start();
    p.put_entity(entity_json(1, &[("A", "1")], vec![]));
    p.put_entity(entity_json(2, &[("A", "2")], vec![]));
    p.notify(1).await;
    p.notify(2).await;
    p.drain().await;

    // Entity 2 disappears; its record is truly gone.
    p.engine.as_fixture().unwrap().remove_entity(2);
    p.notify(2).await;
    p.drain().await;
    p.assert_invariants();

    assert!(p.store.entity_row(2).unwrap().is_none());
    // The orphaned record was confirmed deleted by the aggregation pass
    // that the deletion itself scheduled.
    assert!(p.store.record_row(&RecordKey::new("A", "2")).unwrap().is_none());
    assert_eq!(
        p.store
            .report_row("DSS|A|A|ENTITY_COUNT")
            .unwrap()
            .unwrap()
            .entity_count,
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_record_key_messages_resolve_entities() {
    let p = Pipeline::start();
    p.put_entity(entity_json(5, &[("A", "9")], vec![]));

    p.consumer
        .process(&json!({ "DATA_SOURCE": "A", "RECORD_ID": "9" }).to_string())
        .await
        .unwrap();
    p.drain().await;

    assert!(p.store.entity_row(5).unwrap().is_some());
}
