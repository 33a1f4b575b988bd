//! Per-entity refresh orchestration.
//!
//! One task, one transaction: fetch the entity's current state from the
//! engine, reconstruct the previously replicated state from the stored
//! hash, compute the delta, drive the persistence layer, then schedule the
//! follow-up refreshes and aggregator passes the commit calls for.

use crate::error::TaskError;
use crate::services::datamart_store::{DataMartStore, RefreshDisposition};
use crate::services::delta::EntityDelta;
use crate::services::hash_codec::parse_entity_hash;
use crate::services::scheduler::Scheduler;
use crate::sources::EngineClient;
use crate::types::Task;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Handler for `REFRESH_ENTITY` tasks.
pub struct RefreshService {
    store: Arc<DataMartStore>,
    engine: Arc<EngineClient>,
}

impl RefreshService {
    pub fn new(store: Arc<DataMartStore>, engine: Arc<EngineClient>) -> Arc<Self> {
        Arc::new(Self { store, engine })
    }

    pub async fn handle(&self, task: &Task, scheduler: &Scheduler) -> Result<(), TaskError> {
        let entity_id = task.entity_id().ok_or(TaskError::MissingParameter("entityId"))?;
        let operation_id = Uuid::new_v4().to_string();

        let new_snapshot = match self.engine.entity_by_id(entity_id).await? {
            Some(document) => Some(document.into_snapshot()?),
            None => None,
        };

        let old_snapshot = match self.store.get_entity_hash(entity_id)? {
            Some(hash) => Some(parse_entity_hash(&hash)?),
            None => None,
        };

        if old_snapshot.is_none() && new_snapshot.is_none() {
            debug!("entity {} unknown to both engine and mart, nothing to do", entity_id);
            return Ok(());
        }

        let mut delta = EntityDelta::compute(old_snapshot, new_snapshot)?;
        let outcome = self.store.apply_refresh(&operation_id, &mut delta)?;

        for related_id in &outcome.follow_ups {
            scheduler.schedule(Task::refresh_entity(*related_id)).await;
        }
        for report_key in &outcome.report_keys {
            scheduler.schedule(Task::update_report(report_key)).await;
        }

        match outcome.disposition {
            RefreshDisposition::Stored => info!(
                "refreshed entity {} (op {}): {} follow-ups, {} report keys",
                entity_id,
                operation_id,
                outcome.follow_ups.len(),
                outcome.report_keys.len()
            ),
            RefreshDisposition::Deleted => info!(
                "deleted entity {} (op {}): {} follow-ups, {} report keys",
                entity_id,
                operation_id,
                outcome.follow_ups.len(),
                outcome.report_keys.len()
            ),
            RefreshDisposition::Unchanged => {
                debug!("entity {} unchanged (op {})", entity_id, operation_id)
            }
        }
        Ok(())
    }
}
