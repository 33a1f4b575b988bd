//! Scheduled folding of pending report deltas into aggregate rows.
//!
//! One task handles one report key. The scheduler's resource-key dedup makes
//! this the single writer for that key, which is what allows the lease /
//! fold / delete sequence to span more than one transaction.

use crate::error::TaskError;
use crate::services::datamart_store::DataMartStore;
use crate::services::scheduler::Scheduler;
use crate::sources::EngineClient;
use crate::types::{RecordKey, ReportKey, SourceStatistic, Task};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handler for the four `UPDATE_*` report tasks.
pub struct ReportAggregator {
    store: Arc<DataMartStore>,
    engine: Arc<EngineClient>,
}

impl ReportAggregator {
    pub fn new(store: Arc<DataMartStore>, engine: Arc<EngineClient>) -> Arc<Self> {
        Arc::new(Self { store, engine })
    }

    pub async fn handle(&self, task: &Task, scheduler: &Scheduler) -> Result<(), TaskError> {
        let key_string = task
            .report_key()
            .ok_or(TaskError::MissingParameter("reportKey"))?;
        let key = ReportKey::parse(key_string)?;
        let operation_id = Uuid::new_v4().to_string();

        let leased = self.store.lease_pending(key_string, &operation_id)?;

        // The per-source entity count cannot trust its negative pending
        // contributions: a record counted out of one entity may have been
        // adopted into another concurrently. Reconcile against the engine
        // instead.
        let mut entity_adjustment = 0;
        if let ReportKey::DataSourceSummary {
            data_source,
            statistic: SourceStatistic::EntityCount,
        } = &key
        {
            entity_adjustment = self
                .reconcile_orphans(data_source, &operation_id, scheduler)
                .await?;
        }

        if leased == 0 && entity_adjustment == 0 {
            debug!("no pending deltas for {}", key_string);
            return Ok(());
        }

        let row = self
            .store
            .fold_leased(key_string, &operation_id, entity_adjustment)?;
        info!(
            "folded {} pending delta(s) into {}: entities={} records={} relations={}",
            leased, key_string, row.entity_count, row.record_count, row.relation_count
        );
        Ok(())
    }

    /// Walk the orphaned records of one source and settle each against the
    /// engine: truly deleted records are removed, records the engine still
    /// resolves are re-adopted (or get their entity scheduled for refresh
    /// when it is not replicated yet). Returns the entity-count adjustment
    /// owed for re-adoptions.
    async fn reconcile_orphans(
        &self,
        data_source: &str,
        operation_id: &str,
        scheduler: &Scheduler,
    ) -> Result<i64, TaskError> {
        let orphans = self.store.orphaned_records(data_source)?;
        if orphans.is_empty() {
            return Ok(0);
        }
        debug!(
            "reconciling {} orphan(s) under source {}",
            orphans.len(),
            data_source
        );

        let mut readopted = 0;
        for record_id in orphans {
            let key = RecordKey::new(data_source, record_id.as_str());
            match self.engine.entity_by_record(data_source, &record_id).await? {
                None => {
                    if self.store.delete_orphaned_record(&key)? {
                        let update = DataMartStore::record_deletion_update(&key);
                        self.store.insert_pending(&update)?;
                        scheduler.schedule(Task::update_report(&update.key)).await;
                        debug!("deleted record {} gone from the engine", key);
                    }
                }
                Some(document) => {
                    let owner = document.resolved_entity.entity_id;
                    if self.store.entity_exists(owner)? {
                        if self.store.readopt_record(&key, owner, operation_id)? {
                            readopted += 1;
                            debug!("re-adopted record {} into entity {}", key, owner);
                        }
                    } else {
                        // Owner not replicated yet; the refresh will adopt
                        // the record, and the orphan waits for the next pass.
                        warn!(
                            "record {} resolves to unreplicated entity {}, scheduling refresh",
                            key, owner
                        );
                        scheduler.schedule(Task::refresh_entity(owner)).await;
                    }
                }
            }
        }
        Ok(readopted)
    }
}
