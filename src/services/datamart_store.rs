//! SQLite persistence layer for the replicated data mart.
//!
//! One refresh runs as one transaction over six tables. Every statement is
//! an upsert or a claimed two-phase write so replaying a task is harmless:
//! the entity and relationship upserts only fire where the stored hash
//! differs, removed rows are claimed with the operation id before they are
//! read back and deleted, and lock rows are enrolled in canonical order so
//! concurrent refreshes touching the same records or edges serialize
//! without deadlock.

use crate::services::delta::{DeltaError, EntityDelta};
use crate::services::hash_codec::{
    entity_hash, parse_relation_hash, relation_hash, stored_relation_from, HashParseError,
};
use crate::types::{
    EntityId, MatchType, RecordKey, ReportKey, ReportUpdate, ResourceKey, SourceStatistic,
};
use rusqlite::{params, Connection, ErrorCode, Transaction};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Persistence failure. `Sqlite` contention errors are retryable; everything
/// else signals a bug or external corruption and fails the task.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("expected {expected} row(s) in {table} for entity {entity_id}, found {found}")]
    RowCount {
        table: &'static str,
        entity_id: EntityId,
        expected: usize,
        found: usize,
    },

    #[error("stored hash for entity {entity_id} is unreadable: {source}")]
    CorruptHash {
        entity_id: EntityId,
        source: HashParseError,
    },

    #[error("relationship ({entity_id},{related_id}) violates canonical orientation")]
    Orientation {
        entity_id: EntityId,
        related_id: EntityId,
    },

    #[error("stored match type {value:?} on relationship ({entity_id},{related_id}) is unknown")]
    CorruptMatchType {
        entity_id: EntityId,
        related_id: EntityId,
        value: String,
    },

    #[error(transparent)]
    Delta(#[from] DeltaError),
}

impl StoreError {
    /// Transient contention that a redelivered task can resolve.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// How a refresh transaction left the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDisposition {
    /// Entity row inserted or rewritten.
    Stored,
    /// Stored hash already matched; only the relation-integrity sweep ran.
    Unchanged,
    /// Entity row deleted.
    Deleted,
}

/// Result of one committed refresh transaction.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub disposition: RefreshDisposition,
    /// Related entities that need their own refresh.
    pub follow_ups: BTreeSet<EntityId>,
    /// Report keys with new pending deltas.
    pub report_keys: BTreeSet<ReportKey>,
}

/// Stored entity row.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub entity_id: EntityId,
    pub entity_name: Option<String>,
    pub record_count: i64,
    pub relation_count: i64,
    pub entity_hash: String,
    pub prev_entity_hash: Option<String>,
    pub creator_id: String,
    pub modifier_id: String,
}

/// Stored record row.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub data_source: String,
    pub record_id: String,
    pub entity_id: EntityId,
    pub match_key: Option<String>,
    pub errule_code: Option<String>,
    pub prev_entity_id: EntityId,
    pub creator_id: String,
    pub modifier_id: String,
    pub adopter_id: Option<String>,
}

/// Stored relationship row.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub entity_id: EntityId,
    pub related_id: EntityId,
    pub match_level: i64,
    pub match_key: Option<String>,
    pub match_type: MatchType,
    pub relation_hash: String,
    pub prev_relation_hash: Option<String>,
    pub creator_id: String,
    pub modifier_id: String,
}

/// Aggregate report row.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub report_key: String,
    pub entity_count: i64,
    pub record_count: i64,
    pub relation_count: i64,
    pub summary_json: Option<String>,
}

/// Pending report delta row.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub id: i64,
    pub report_key: String,
    pub entity_delta: i64,
    pub record_delta: i64,
    pub relation_delta: i64,
    pub entity_id: EntityId,
    pub related_id: Option<EntityId>,
    pub modifier_id: Option<String>,
}

/// Row counts across the mart tables, for `/stats`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TableCounts {
    pub entities: i64,
    pub records: i64,
    pub relations: i64,
    pub pending: i64,
    pub reports: i64,
    pub locks: i64,
}

/// SQLite-backed data mart store.
pub struct DataMartStore {
    conn: Mutex<Connection>,
    pub db_path: String,
}

impl DataMartStore {
    /// Open (or create) the mart at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let db_path = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.init_schema()?;
        info!("data mart store initialized");
        Ok(store)
    }

    /// Create an in-memory mart (for testing).
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: ":memory:".to_string(),
        };
        store.init_schema()?;
        debug!("in-memory data mart store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_entity (
                entity_id INTEGER PRIMARY KEY,
                entity_name TEXT,
                record_count INTEGER NOT NULL DEFAULT 0,
                relation_count INTEGER NOT NULL DEFAULT 0,
                entity_hash TEXT NOT NULL,
                prev_entity_hash TEXT,
                creator_id TEXT NOT NULL,
                modifier_id TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_record (
                data_source TEXT NOT NULL,
                record_id TEXT NOT NULL,
                entity_id INTEGER NOT NULL DEFAULT 0,
                match_key TEXT,
                errule_code TEXT,
                prev_entity_id INTEGER NOT NULL DEFAULT 0,
                creator_id TEXT NOT NULL,
                modifier_id TEXT NOT NULL,
                adopter_id TEXT,
                PRIMARY KEY (data_source, record_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_record_entity_id ON sz_dm_record(entity_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_record_orphans
             ON sz_dm_record(data_source) WHERE entity_id = 0",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_relation (
                entity_id INTEGER NOT NULL,
                related_id INTEGER NOT NULL,
                match_level INTEGER NOT NULL DEFAULT 0,
                match_key TEXT,
                match_type TEXT NOT NULL,
                relation_hash TEXT NOT NULL,
                prev_relation_hash TEXT,
                creator_id TEXT NOT NULL,
                modifier_id TEXT NOT NULL,
                PRIMARY KEY (entity_id, related_id),
                CHECK (entity_id < related_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relation_related_id ON sz_dm_relation(related_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_pending_report (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_key TEXT NOT NULL,
                entity_delta INTEGER NOT NULL DEFAULT 0,
                record_delta INTEGER NOT NULL DEFAULT 0,
                relation_delta INTEGER NOT NULL DEFAULT 0,
                entity_id INTEGER NOT NULL,
                related_id INTEGER,
                modifier_id TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_report_key
             ON sz_dm_pending_report(report_key)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_report (
                report_key TEXT PRIMARY KEY,
                entity_count INTEGER NOT NULL DEFAULT 0,
                record_count INTEGER NOT NULL DEFAULT 0,
                relation_count INTEGER NOT NULL DEFAULT 0,
                summary_json TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sz_dm_locks (
                resource_key TEXT PRIMARY KEY,
                modifier_id TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Stored hash of the previously replicated entity state.
    pub fn get_entity_hash(&self, entity_id: EntityId) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT entity_hash FROM sz_dm_entity WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        ) {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one refresh delta inside a single transaction.
    pub fn apply_refresh(
        &self,
        operation_id: &str,
        delta: &mut EntityDelta,
    ) -> Result<RefreshOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        // Dropping the transaction on the error path rolls everything back.
        let outcome = Self::refresh_in_tx(&tx, operation_id, delta)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn refresh_in_tx(
        tx: &Transaction<'_>,
        op: &str,
        delta: &mut EntityDelta,
    ) -> Result<RefreshOutcome, StoreError> {
        let entity_id = delta.entity_id();
        let mut follow_ups: BTreeSet<EntityId> = BTreeSet::new();

        // Step 1: enroll lock rows in canonical order. Concurrent refreshes
        // touching overlapping records or edges serialize here.
        Self::enroll_locks(tx, op, delta.resource_keys())?;

        // Step 2: entity row.
        let deleting = delta.new_snapshot().is_none();
        if deleting {
            let claimed = tx.execute(
                "UPDATE sz_dm_entity SET modifier_id = ?1 WHERE entity_id = ?2",
                params![op, entity_id],
            )?;
            if claimed == 0 {
                // A concurrent refresh already removed the row and emitted
                // the compensating deltas; nothing left to do.
                debug!("entity {} already deleted, skipping", entity_id);
                return Ok(RefreshOutcome {
                    disposition: RefreshDisposition::Unchanged,
                    follow_ups,
                    report_keys: BTreeSet::new(),
                });
            }
        } else {
            let new = delta.new_snapshot().expect("non-delete refresh has a snapshot");
            let hash = entity_hash(new);
            let changed = tx.execute(
                "INSERT INTO sz_dm_entity
                     (entity_id, entity_name, record_count, relation_count,
                      entity_hash, prev_entity_hash, creator_id, modifier_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                 ON CONFLICT(entity_id) DO UPDATE SET
                     entity_name = excluded.entity_name,
                     record_count = excluded.record_count,
                     relation_count = excluded.relation_count,
                     prev_entity_hash = entity_hash,
                     entity_hash = excluded.entity_hash,
                     modifier_id = excluded.modifier_id
                 WHERE entity_hash IS NOT excluded.entity_hash",
                params![
                    entity_id,
                    new.entity_name,
                    new.record_count(),
                    new.relation_count(),
                    hash,
                    op
                ],
            )?;
            if changed == 0 {
                // Another refresh already landed this exact state. Its report
                // deltas are authoritative; only recheck relation integrity.
                debug!("entity {} unchanged, running integrity sweep only", entity_id);
                Self::relation_integrity_sweep(tx, delta, &mut follow_ups)?;
                return Ok(RefreshOutcome {
                    disposition: RefreshDisposition::Unchanged,
                    follow_ups,
                    report_keys: BTreeSet::new(),
                });
            }
        }

        // Step 3: added records.
        Self::upsert_added_records(tx, op, delta)?;

        // Step 4: removed records become orphans.
        Self::orphan_removed_records(tx, op, delta)?;

        // Step 5: added/changed relationships.
        Self::upsert_relationships(tx, op, delta, &mut follow_ups)?;

        // Step 6: removed relationships.
        Self::delete_relationships(tx, op, delta, &mut follow_ups)?;

        // Step 7: relation-integrity sweep.
        Self::relation_integrity_sweep(tx, delta, &mut follow_ups)?;

        // Step 8: pending report deltas, final counts included.
        Self::insert_pending_updates(tx, delta.report_updates())?;

        // Deletion claims resolve last so steps 3-7 still see the row.
        if deleting {
            let deleted = tx.execute(
                "DELETE FROM sz_dm_entity WHERE entity_id = ?1 AND modifier_id = ?2",
                params![entity_id, op],
            )?;
            if deleted != 1 {
                return Err(StoreError::RowCount {
                    table: "sz_dm_entity",
                    entity_id,
                    expected: 1,
                    found: deleted,
                });
            }
        }

        follow_ups.remove(&entity_id);
        Ok(RefreshOutcome {
            disposition: if deleting {
                RefreshDisposition::Deleted
            } else {
                RefreshDisposition::Stored
            },
            follow_ups,
            report_keys: delta.report_keys(),
        })
    }

    fn enroll_locks(
        tx: &Transaction<'_>,
        op: &str,
        keys: &BTreeSet<ResourceKey>,
    ) -> Result<(), StoreError> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO sz_dm_locks (resource_key, modifier_id) VALUES (?1, ?2)
             ON CONFLICT(resource_key) DO UPDATE SET modifier_id = excluded.modifier_id",
        )?;
        for key in keys {
            stmt.execute(params![key.to_string(), op])?;
        }
        Ok(())
    }

    fn upsert_added_records(
        tx: &Transaction<'_>,
        op: &str,
        delta: &mut EntityDelta,
    ) -> Result<(), StoreError> {
        if delta.added_records().is_empty() {
            return Ok(());
        }
        let entity_id = delta.entity_id();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sz_dm_record
                     (data_source, record_id, entity_id, match_key, errule_code,
                      prev_entity_id, creator_id, modifier_id, adopter_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, NULL)
                 ON CONFLICT(data_source, record_id) DO UPDATE SET
                     prev_entity_id = entity_id,
                     entity_id = excluded.entity_id,
                     match_key = excluded.match_key,
                     errule_code = excluded.errule_code,
                     adopter_id = CASE WHEN entity_id = 0
                                       THEN excluded.modifier_id
                                       ELSE adopter_id END,
                     modifier_id = excluded.modifier_id",
            )?;
            for record in delta.added_records() {
                stmt.execute(params![
                    record.data_source,
                    record.record_id,
                    entity_id,
                    record.match_key,
                    record.principle,
                    op
                ])?;
            }
        }

        // Rows this operation created (rather than re-pointed) drive the
        // per-source record counts.
        let created: Vec<RecordKey> = {
            let mut stmt = tx.prepare_cached(
                "SELECT data_source, record_id FROM sz_dm_record WHERE creator_id = ?1",
            )?;
            let rows = stmt.query_map(params![op], |row| {
                Ok(RecordKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for key in created {
            delta.mark_created(&key)?;
        }
        Ok(())
    }

    fn orphan_removed_records(
        tx: &Transaction<'_>,
        op: &str,
        delta: &mut EntityDelta,
    ) -> Result<(), StoreError> {
        if delta.removed_records().is_empty() {
            return Ok(());
        }
        let entity_id = delta.entity_id();
        {
            // Rows whose entity_id already moved on update zero rows and are
            // left alone: the concurrent refresh owns them now.
            let mut stmt = tx.prepare_cached(
                "UPDATE sz_dm_record
                 SET prev_entity_id = entity_id, entity_id = 0, modifier_id = ?1
                 WHERE data_source = ?2 AND record_id = ?3 AND entity_id = ?4",
            )?;
            for record in delta.removed_records() {
                stmt.execute(params![op, record.data_source, record.record_id, entity_id])?;
            }
        }

        let orphaned: Vec<RecordKey> = {
            let mut stmt = tx.prepare_cached(
                "SELECT data_source, record_id FROM sz_dm_record
                 WHERE modifier_id = ?1 AND entity_id = 0",
            )?;
            let rows = stmt.query_map(params![op], |row| {
                Ok(RecordKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for key in orphaned {
            delta.mark_orphaned(&key)?;
        }
        Ok(())
    }

    fn upsert_relationships(
        tx: &Transaction<'_>,
        op: &str,
        delta: &mut EntityDelta,
        follow_ups: &mut BTreeSet<EntityId>,
    ) -> Result<(), StoreError> {
        let entity_id = delta.entity_id();
        let my_summary = delta
            .new_snapshot()
            .map(crate::types::EntitySnapshot::source_breakdown)
            .unwrap_or_default();

        let targets: Vec<crate::types::RelatedEntity> = delta
            .added_relations()
            .iter()
            .cloned()
            .chain(delta.changed_relations().iter().map(|(_, n)| n.clone()))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sz_dm_relation
                     (entity_id, related_id, match_level, match_key, match_type,
                      relation_hash, prev_relation_hash, creator_id, modifier_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)
                 ON CONFLICT(entity_id, related_id) DO UPDATE SET
                     match_level = excluded.match_level,
                     match_key = excluded.match_key,
                     match_type = excluded.match_type,
                     prev_relation_hash = relation_hash,
                     relation_hash = excluded.relation_hash,
                     modifier_id = excluded.modifier_id
                 WHERE relation_hash IS NOT excluded.relation_hash",
            )?;
            for related in &targets {
                if related.entity_id == entity_id {
                    return Err(StoreError::Orientation {
                        entity_id,
                        related_id: related.entity_id,
                    });
                }
                let stored = stored_relation_from(entity_id, my_summary.clone(), related);
                let hash = relation_hash(&stored);
                stmt.execute(params![
                    stored.lo,
                    stored.hi,
                    stored.match_level,
                    stored.match_key,
                    stored.match_type.as_str(),
                    hash,
                    op
                ])?;
            }
        }

        // Rows this operation actually touched carry its modifier id; the
        // prior hash tells the delta what the mart had accounted before.
        struct Touched {
            related_id: EntityId,
            prev_hash: Option<String>,
            match_type: String,
        }
        let touched: Vec<Touched> = {
            let mut stmt = tx.prepare_cached(
                "SELECT entity_id, related_id, prev_relation_hash, match_type
                 FROM sz_dm_relation WHERE modifier_id = ?1",
            )?;
            let rows = stmt.query_map(params![op], |row| {
                let lo: EntityId = row.get(0)?;
                let hi: EntityId = row.get(1)?;
                Ok(Touched {
                    related_id: if lo == entity_id { hi } else { lo },
                    prev_hash: row.get(2)?,
                    match_type: row.get(3)?,
                })
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for row in touched {
            let previous = match &row.prev_hash {
                Some(hash) => Some(parse_relation_hash(hash).map_err(|source| {
                    StoreError::CorruptHash {
                        entity_id,
                        source,
                    }
                })?),
                None => None,
            };
            let new_match_type =
                MatchType::parse(&row.match_type).ok_or_else(|| StoreError::CorruptMatchType {
                    entity_id,
                    related_id: row.related_id,
                    value: row.match_type.clone(),
                })?;

            // A brand-new edge, or one whose classification moved, has to be
            // observed from the other side as well.
            let match_type_changed = previous
                .as_ref()
                .map(|p| p.match_type != new_match_type)
                .unwrap_or(true);
            if match_type_changed {
                follow_ups.insert(row.related_id);
            }

            delta.track_stored_relationship(row.related_id, previous.as_ref())?;
        }
        Ok(())
    }

    fn delete_relationships(
        tx: &Transaction<'_>,
        op: &str,
        delta: &mut EntityDelta,
        follow_ups: &mut BTreeSet<EntityId>,
    ) -> Result<(), StoreError> {
        let entity_id = delta.entity_id();
        let removed: Vec<EntityId> = delta
            .removed_relations()
            .iter()
            .map(|r| r.entity_id)
            .collect();

        for related_id in removed {
            let (lo, hi) = (entity_id.min(related_id), entity_id.max(related_id));

            // Claim first so the row's final state is read unambiguously.
            let claimed = tx.execute(
                "UPDATE sz_dm_relation SET modifier_id = ?1
                 WHERE entity_id = ?2 AND related_id = ?3",
                params![op, lo, hi],
            )?;
            if claimed == 0 {
                // Already removed by the other endpoint's refresh.
                continue;
            }

            let hash: String = tx.query_row(
                "SELECT relation_hash FROM sz_dm_relation
                 WHERE entity_id = ?1 AND related_id = ?2 AND modifier_id = ?3",
                params![lo, hi, op],
                |row| row.get(0),
            )?;
            let stored = parse_relation_hash(&hash)
                .map_err(|source| StoreError::CorruptHash { entity_id, source })?;
            delta.track_deleted_relationship(related_id, &stored)?;

            let deleted = tx.execute(
                "DELETE FROM sz_dm_relation
                 WHERE entity_id = ?1 AND related_id = ?2 AND modifier_id = ?3",
                params![lo, hi, op],
            )?;
            if deleted != 1 {
                return Err(StoreError::RowCount {
                    table: "sz_dm_relation",
                    entity_id,
                    expected: 1,
                    found: deleted,
                });
            }
            follow_ups.insert(related_id);
        }
        Ok(())
    }

    /// Any stored edge whose other end is missing from the new snapshot, or
    /// any snapshot relation with no stored edge, schedules a refresh of the
    /// other end. This bounds the window in which concurrent refreshes of
    /// related entities can disagree.
    fn relation_integrity_sweep(
        tx: &Transaction<'_>,
        delta: &EntityDelta,
        follow_ups: &mut BTreeSet<EntityId>,
    ) -> Result<(), StoreError> {
        let entity_id = delta.entity_id();
        let snapshot_related: BTreeSet<EntityId> = delta
            .new_snapshot()
            .map(|s| s.related.keys().copied().collect())
            .unwrap_or_default();

        let stored_related: BTreeSet<EntityId> = {
            let mut stmt = tx.prepare_cached(
                "SELECT entity_id, related_id FROM sz_dm_relation
                 WHERE entity_id = ?1 OR related_id = ?1",
            )?;
            let rows = stmt.query_map(params![entity_id], |row| {
                let lo: EntityId = row.get(0)?;
                let hi: EntityId = row.get(1)?;
                Ok(if lo == entity_id { hi } else { lo })
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for other in stored_related.symmetric_difference(&snapshot_related) {
            follow_ups.insert(*other);
        }
        Ok(())
    }

    fn insert_pending_updates(
        tx: &Transaction<'_>,
        updates: &[ReportUpdate],
    ) -> Result<(), StoreError> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO sz_dm_pending_report
                 (report_key, entity_delta, record_delta, relation_delta,
                  entity_id, related_id, modifier_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        )?;
        for update in updates {
            if update.is_noop() {
                continue;
            }
            stmt.execute(params![
                update.key.to_string(),
                update.entity_delta,
                update.record_delta,
                update.relation_delta,
                update.entity_id,
                update.related_id
            ])?;
        }
        Ok(())
    }

    // ----- aggregation support -----

    /// Lease every pending row for a report key to this operation. The
    /// scheduler keeps one aggregator per key, so re-leasing rows stranded
    /// by a crashed pass is safe and self-healing.
    pub fn lease_pending(&self, report_key: &str, op: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let leased = conn.execute(
            "UPDATE sz_dm_pending_report SET modifier_id = ?1 WHERE report_key = ?2",
            params![op, report_key],
        )?;
        Ok(leased)
    }

    /// Fold the leased deltas (plus an aggregator-side adjustment to the
    /// entity sum) into the aggregate row and drop the leased rows, in one
    /// transaction.
    pub fn fold_leased(
        &self,
        report_key: &str,
        op: &str,
        entity_adjustment: i64,
    ) -> Result<ReportRow, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let (entity_sum, record_sum, relation_sum): (i64, i64, i64) = tx.query_row(
            "SELECT COALESCE(SUM(entity_delta), 0),
                    COALESCE(SUM(record_delta), 0),
                    COALESCE(SUM(relation_delta), 0)
             FROM sz_dm_pending_report
             WHERE report_key = ?1 AND modifier_id = ?2",
            params![report_key, op],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let entity_sum = entity_sum + entity_adjustment;

        let summary = json!({
            "reportKey": report_key,
            "lastOperationId": op,
            "foldedAt": chrono::Utc::now().timestamp_millis(),
            "entityDelta": entity_sum,
            "recordDelta": record_sum,
            "relationDelta": relation_sum,
        })
        .to_string();

        tx.execute(
            "INSERT INTO sz_dm_report
                 (report_key, entity_count, record_count, relation_count, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(report_key) DO UPDATE SET
                 entity_count = entity_count + excluded.entity_count,
                 record_count = record_count + excluded.record_count,
                 relation_count = relation_count + excluded.relation_count,
                 summary_json = excluded.summary_json",
            params![report_key, entity_sum, record_sum, relation_sum, summary],
        )?;

        tx.execute(
            "DELETE FROM sz_dm_pending_report WHERE report_key = ?1 AND modifier_id = ?2",
            params![report_key, op],
        )?;

        let row = tx.query_row(
            "SELECT report_key, entity_count, record_count, relation_count, summary_json
             FROM sz_dm_report WHERE report_key = ?1",
            params![report_key],
            |row| {
                Ok(ReportRow {
                    report_key: row.get(0)?,
                    entity_count: row.get(1)?,
                    record_count: row.get(2)?,
                    relation_count: row.get(3)?,
                    summary_json: row.get(4)?,
                })
            },
        )?;

        tx.commit()?;
        Ok(row)
    }

    /// Record ids currently orphaned under a data source.
    pub fn orphaned_records(&self, data_source: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT record_id FROM sz_dm_record
             WHERE entity_id = 0 AND data_source = ?1
             ORDER BY record_id",
        )?;
        let rows = stmt.query_map(params![data_source], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Delete a record the engine no longer knows, if still orphaned.
    pub fn delete_orphaned_record(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM sz_dm_record
             WHERE data_source = ?1 AND record_id = ?2 AND entity_id = 0",
            params![key.data_source, key.record_id],
        )?;
        Ok(deleted == 1)
    }

    /// Re-point an orphaned record at the entity the engine now resolves it
    /// to. Loses the race silently when a concurrent refresh adopted it.
    pub fn readopt_record(
        &self,
        key: &RecordKey,
        entity_id: EntityId,
        op: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sz_dm_record
             SET prev_entity_id = entity_id, entity_id = ?1,
                 adopter_id = ?2, modifier_id = ?2
             WHERE data_source = ?3 AND record_id = ?4 AND entity_id = 0",
            params![entity_id, op, key.data_source, key.record_id],
        )?;
        Ok(updated == 1)
    }

    pub fn entity_exists(&self, entity_id: EntityId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sz_dm_entity WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Queue a single pending delta outside a refresh (used by the
    /// aggregator when it confirms a record deletion).
    pub fn insert_pending(&self, update: &ReportUpdate) -> Result<(), StoreError> {
        if update.is_noop() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sz_dm_pending_report
                 (report_key, entity_delta, record_delta, relation_delta,
                  entity_id, related_id, modifier_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                update.key.to_string(),
                update.entity_delta,
                update.record_delta,
                update.relation_delta,
                update.entity_id,
                update.related_id
            ],
        )?;
        Ok(())
    }

    /// Pending delta for a confirmed record deletion.
    pub fn record_deletion_update(key: &RecordKey) -> ReportUpdate {
        ReportUpdate {
            key: ReportKey::dss(key.data_source.clone(), SourceStatistic::RecordCount),
            entity_delta: 0,
            record_delta: -1,
            relation_delta: 0,
            entity_id: 0,
            related_id: None,
        }
    }

    // ----- inspection (tests, /stats) -----

    pub fn entity_row(&self, entity_id: EntityId) -> Result<Option<EntityRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT entity_id, entity_name, record_count, relation_count,
                    entity_hash, prev_entity_hash, creator_id, modifier_id
             FROM sz_dm_entity WHERE entity_id = ?1",
            params![entity_id],
            |row| {
                Ok(EntityRow {
                    entity_id: row.get(0)?,
                    entity_name: row.get(1)?,
                    record_count: row.get(2)?,
                    relation_count: row.get(3)?,
                    entity_hash: row.get(4)?,
                    prev_entity_hash: row.get(5)?,
                    creator_id: row.get(6)?,
                    modifier_id: row.get(7)?,
                })
            },
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record_row(&self, key: &RecordKey) -> Result<Option<RecordRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT data_source, record_id, entity_id, match_key, errule_code,
                    prev_entity_id, creator_id, modifier_id, adopter_id
             FROM sz_dm_record WHERE data_source = ?1 AND record_id = ?2",
            params![key.data_source, key.record_id],
            |row| {
                Ok(RecordRow {
                    data_source: row.get(0)?,
                    record_id: row.get(1)?,
                    entity_id: row.get(2)?,
                    match_key: row.get(3)?,
                    errule_code: row.get(4)?,
                    prev_entity_id: row.get(5)?,
                    creator_id: row.get(6)?,
                    modifier_id: row.get(7)?,
                    adopter_id: row.get(8)?,
                })
            },
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored relationship incident to an entity.
    pub fn relations_for(&self, entity_id: EntityId) -> Result<Vec<RelationRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity_id, related_id, match_level, match_key, match_type,
                    relation_hash, prev_relation_hash, creator_id, modifier_id
             FROM sz_dm_relation
             WHERE entity_id = ?1 OR related_id = ?1
             ORDER BY entity_id, related_id",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok((
                row.get::<_, EntityId>(0)?,
                row.get::<_, EntityId>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut relations = Vec::new();
        for row in rows {
            let (eid, rid, level, key, match_type, hash, prev, creator, modifier) = row?;
            let match_type =
                MatchType::parse(&match_type).ok_or_else(|| StoreError::CorruptMatchType {
                    entity_id: eid,
                    related_id: rid,
                    value: match_type.clone(),
                })?;
            relations.push(RelationRow {
                entity_id: eid,
                related_id: rid,
                match_level: level,
                match_key: key,
                match_type,
                relation_hash: hash,
                prev_relation_hash: prev,
                creator_id: creator,
                modifier_id: modifier,
            });
        }
        Ok(relations)
    }

    pub fn report_row(&self, report_key: &str) -> Result<Option<ReportRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT report_key, entity_count, record_count, relation_count, summary_json
             FROM sz_dm_report WHERE report_key = ?1",
            params![report_key],
            |row| {
                Ok(ReportRow {
                    report_key: row.get(0)?,
                    entity_count: row.get(1)?,
                    record_count: row.get(2)?,
                    relation_count: row.get(3)?,
                    summary_json: row.get(4)?,
                })
            },
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending rows for one report key, oldest first.
    pub fn pending_for(&self, report_key: &str) -> Result<Vec<PendingRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, report_key, entity_delta, record_delta, relation_delta,
                    entity_id, related_id, modifier_id
             FROM sz_dm_pending_report WHERE report_key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![report_key], |row| {
            Ok(PendingRow {
                id: row.get(0)?,
                report_key: row.get(1)?,
                entity_delta: row.get(2)?,
                record_delta: row.get(3)?,
                relation_delta: row.get(4)?,
                entity_id: row.get(5)?,
                related_id: row.get(6)?,
                modifier_id: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Lock table keys in storage order.
    pub fn lock_keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT resource_key FROM sz_dm_locks ORDER BY resource_key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
        };
        Ok(TableCounts {
            entities: count("sz_dm_entity")?,
            records: count("sz_dm_record")?,
            relations: count("sz_dm_relation")?,
            pending: count("sz_dm_pending_report")?,
            reports: count("sz_dm_report")?,
            locks: count("sz_dm_locks")?,
        })
    }

    /// Distinct entity ids owning at least one record from a source.
    pub fn entity_count_for_source(&self, data_source: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(DISTINCT entity_id) FROM sz_dm_record
             WHERE data_source = ?1 AND entity_id > 0",
            params![data_source],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Liveness probe for `/health`.
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|v| v == 1)
            .unwrap_or_else(|e| {
                warn!("data mart ping failed: {}", e);
                false
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityRecord, EntitySnapshot};

    fn snapshot(entity_id: EntityId, records: &[(&str, &str)]) -> EntitySnapshot {
        let mut snapshot = EntitySnapshot::new(entity_id);
        snapshot.records = records
            .iter()
            .map(|(s, i)| EntityRecord {
                data_source: s.to_string(),
                record_id: i.to_string(),
                match_key: None,
                principle: None,
            })
            .collect();
        snapshot.normalize();
        snapshot
    }

    fn refresh(store: &DataMartStore, op: &str, new: EntitySnapshot) -> RefreshOutcome {
        let old = store
            .get_entity_hash(new.entity_id)
            .unwrap()
            .map(|h| crate::services::hash_codec::parse_entity_hash(&h).unwrap());
        let mut delta = EntityDelta::compute(old, Some(new)).unwrap();
        store.apply_refresh(op, &mut delta).unwrap()
    }

    #[test]
    fn test_first_refresh_creates_rows() {
        let store = DataMartStore::new_in_memory().unwrap();
        let outcome = refresh(&store, "op-1", snapshot(42, &[("A", "1"), ("A", "2")]));
        assert_eq!(outcome.disposition, RefreshDisposition::Stored);

        let entity = store.entity_row(42).unwrap().unwrap();
        assert_eq!(entity.record_count, 2);
        assert_eq!(entity.creator_id, "op-1");
        assert_eq!(entity.prev_entity_hash, None);

        let record = store.record_row(&RecordKey::new("A", "1")).unwrap().unwrap();
        assert_eq!(record.entity_id, 42);
        assert_eq!(record.creator_id, "op-1");
        assert_eq!(record.adopter_id, None);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(42, &[("A", "1")]));
        let hash_before = store.entity_row(42).unwrap().unwrap().entity_hash;

        let outcome = refresh(&store, "op-2", snapshot(42, &[("A", "1")]));
        assert_eq!(outcome.disposition, RefreshDisposition::Unchanged);
        assert!(outcome.report_keys.is_empty());

        let row = store.entity_row(42).unwrap().unwrap();
        assert_eq!(row.entity_hash, hash_before);
        assert_eq!(row.modifier_id, "op-1");
    }

    #[test]
    fn test_update_moves_hash_to_prev() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(42, &[("A", "1")]));
        let first_hash = store.entity_row(42).unwrap().unwrap().entity_hash;

        refresh(&store, "op-2", snapshot(42, &[("A", "1"), ("A", "2")]));
        let row = store.entity_row(42).unwrap().unwrap();
        assert_eq!(row.prev_entity_hash.as_deref(), Some(first_hash.as_str()));
        assert_eq!(row.modifier_id, "op-2");
        assert_eq!(row.record_count, 2);
    }

    #[test]
    fn test_orphan_adoption_sets_adopter() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(42, &[("A", "1")]));
        // 42 loses the record
        refresh(&store, "op-2", snapshot(42, &[]));
        let orphan = store.record_row(&RecordKey::new("A", "1")).unwrap().unwrap();
        assert_eq!(orphan.entity_id, 0);
        assert_eq!(orphan.prev_entity_id, 42);

        // 43 adopts it
        refresh(&store, "op-3", snapshot(43, &[("A", "1")]));
        let adopted = store.record_row(&RecordKey::new("A", "1")).unwrap().unwrap();
        assert_eq!(adopted.entity_id, 43);
        assert_eq!(adopted.adopter_id.as_deref(), Some("op-3"));
        assert_eq!(adopted.creator_id, "op-1");
    }

    #[test]
    fn test_locks_enrolled_for_touched_rows() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(42, &[("A", "1"), ("B", "2")]));
        let keys = store.lock_keys().unwrap();
        assert_eq!(keys, vec!["RECORD|A|1", "RECORD|B|2"]);
    }

    #[test]
    fn test_entity_deletion_removes_row() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(99, &[("A", "1")]));

        let old = store
            .get_entity_hash(99)
            .unwrap()
            .map(|h| crate::services::hash_codec::parse_entity_hash(&h).unwrap());
        let mut delta = EntityDelta::compute(old, None).unwrap();
        let outcome = store.apply_refresh("op-2", &mut delta).unwrap();
        assert_eq!(outcome.disposition, RefreshDisposition::Deleted);

        assert!(store.entity_row(99).unwrap().is_none());
        let orphan = store.record_row(&RecordKey::new("A", "1")).unwrap().unwrap();
        assert_eq!(orphan.entity_id, 0);
    }

    #[test]
    fn test_delete_missing_entity_is_noop() {
        let store = DataMartStore::new_in_memory().unwrap();
        let old = snapshot(7, &[("A", "1")]);
        let mut delta = EntityDelta::compute(Some(old), None).unwrap();
        let outcome = store.apply_refresh("op-1", &mut delta).unwrap();
        assert_eq!(outcome.disposition, RefreshDisposition::Unchanged);
        assert!(outcome.report_keys.is_empty());
    }

    #[test]
    fn test_fold_leased_accumulates() {
        let store = DataMartStore::new_in_memory().unwrap();
        let key = ReportKey::esb(3);
        for delta in [1i64, 1, -1] {
            store
                .insert_pending(&ReportUpdate {
                    key: key.clone(),
                    entity_delta: delta,
                    record_delta: 0,
                    relation_delta: 0,
                    entity_id: 1,
                    related_id: None,
                })
                .unwrap();
        }

        let leased = store.lease_pending("ESB|3", "agg-1").unwrap();
        assert_eq!(leased, 3);
        let row = store.fold_leased("ESB|3", "agg-1", 0).unwrap();
        assert_eq!(row.entity_count, 1);
        assert!(store.pending_for("ESB|3").unwrap().is_empty());

        // A second pass with no pending rows folds nothing more.
        store.lease_pending("ESB|3", "agg-2").unwrap();
        let row = store.fold_leased("ESB|3", "agg-2", 0).unwrap();
        assert_eq!(row.entity_count, 1);
    }

    #[test]
    fn test_readopt_and_delete_orphans() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(42, &[("A", "1"), ("A", "2")]));
        refresh(&store, "op-2", snapshot(42, &[]));

        assert_eq!(store.orphaned_records("A").unwrap(), vec!["1", "2"]);

        assert!(store
            .readopt_record(&RecordKey::new("A", "1"), 42, "agg-1")
            .unwrap());
        let row = store.record_row(&RecordKey::new("A", "1")).unwrap().unwrap();
        assert_eq!(row.entity_id, 42);
        assert_eq!(row.adopter_id.as_deref(), Some("agg-1"));

        assert!(store.delete_orphaned_record(&RecordKey::new("A", "2")).unwrap());
        assert!(store.record_row(&RecordKey::new("A", "2")).unwrap().is_none());

        // Neither op applies twice.
        assert!(!store
            .readopt_record(&RecordKey::new("A", "1"), 42, "agg-1")
            .unwrap());
        assert!(!store.delete_orphaned_record(&RecordKey::new("A", "2")).unwrap());
    }

    #[test]
    fn test_entity_count_for_source() {
        let store = DataMartStore::new_in_memory().unwrap();
        refresh(&store, "op-1", snapshot(1, &[("A", "1")]));
        refresh(&store, "op-2", snapshot(2, &[("A", "2"), ("B", "1")]));
        assert_eq!(store.entity_count_for_source("A").unwrap(), 2);
        assert_eq!(store.entity_count_for_source("B").unwrap(), 1);
        assert_eq!(store.entity_count_for_source("C").unwrap(), 0);
    }
}
