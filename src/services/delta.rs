//! Delta computation between two snapshots of the same entity.
//!
//! `EntityDelta::compute` is a pure function over `(old, new)`; the result is
//! read-only except through the narrow callbacks the persistence layer
//! invokes after it learns which rows it actually wrote. Statistics that
//! depend on winning the row (record creation, relationship storage) are
//! emitted only through those callbacks, so two concurrent refreshes that
//! both observe the same edge cannot double-count it.

use crate::types::{
    EntityId, EntityRecord, EntitySnapshot, RecordKey, RelatedEntity, ReportKey, ReportUpdate,
    ResourceKey, SourceStatistic, StoredRelation,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// The delta inputs or a persistence callback were inconsistent.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("delta requires at least one entity snapshot")]
    EmptySnapshots,
    #[error("entity id mismatch between snapshots: old {old}, new {new}")]
    EntityMismatch { old: EntityId, new: EntityId },
    #[error("record {0} is not part of this delta")]
    UnknownRecord(RecordKey),
    #[error("relationship with entity {0} is not part of this delta")]
    UnknownRelation(EntityId),
}

/// One relationship's contribution to a cross-source relation statistic
/// cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RelationCell {
    entities: i64,
    records: i64,
}

/// Contribution of one relationship to the cross-source relation statistics.
///
/// The row is shared between both endpoints and only the refresh that wins
/// the upsert accounts for it, so the winner emits both orientations: the
/// `(s1, s2)` cell counts records from `s1`'s side, the mirrored `(s2, s1)`
/// cell counts records from `s2`'s side. A source present on both ends sums
/// into a single `(s, s)` cell that still counts the relationship once.
type RelationContribs = BTreeMap<(String, String, SourceStatistic), RelationCell>;

fn relation_contributions(
    my_summary: &BTreeMap<String, i64>,
    related_summary: &BTreeMap<String, i64>,
    statistic: SourceStatistic,
) -> RelationContribs {
    let mut contribs: RelationContribs = BTreeMap::new();
    for (mine, count) in my_summary {
        for theirs in related_summary.keys() {
            let cell = contribs
                .entry((mine.clone(), theirs.clone(), statistic))
                .or_default();
            cell.entities = 1;
            cell.records += count;
        }
    }
    for (theirs, count) in related_summary {
        for mine in my_summary.keys() {
            let cell = contribs
                .entry((theirs.clone(), mine.clone(), statistic))
                .or_default();
            cell.entities = 1;
            cell.records += count;
        }
    }
    contribs
}

/// Everything one refresh has to persist: row-level changes, lock keys, and
/// the signed report updates they imply.
#[derive(Debug)]
pub struct EntityDelta {
    entity_id: EntityId,
    old: Option<EntitySnapshot>,
    new: Option<EntitySnapshot>,
    added_records: Vec<EntityRecord>,
    removed_records: Vec<EntityRecord>,
    added_relations: Vec<RelatedEntity>,
    removed_relations: Vec<RelatedEntity>,
    changed_relations: Vec<(RelatedEntity, RelatedEntity)>,
    data_source_deltas: BTreeMap<String, i64>,
    resource_keys: BTreeSet<ResourceKey>,
    report_updates: Vec<ReportUpdate>,
    created_records: Vec<RecordKey>,
    orphaned_records: Vec<RecordKey>,
}

impl EntityDelta {
    /// Compute the delta between the previously replicated snapshot and the
    /// engine's current one. At least one side must be present; when both
    /// are, their entity ids must agree.
    pub fn compute(
        old: Option<EntitySnapshot>,
        new: Option<EntitySnapshot>,
    ) -> Result<Self, DeltaError> {
        let entity_id = match (&old, &new) {
            (None, None) => return Err(DeltaError::EmptySnapshots),
            (Some(o), Some(n)) if o.entity_id != n.entity_id => {
                return Err(DeltaError::EntityMismatch {
                    old: o.entity_id,
                    new: n.entity_id,
                })
            }
            (Some(o), _) => o.entity_id,
            (_, Some(n)) => n.entity_id,
        };

        let mut delta = Self {
            entity_id,
            old,
            new,
            added_records: Vec::new(),
            removed_records: Vec::new(),
            added_relations: Vec::new(),
            removed_relations: Vec::new(),
            changed_relations: Vec::new(),
            data_source_deltas: BTreeMap::new(),
            resource_keys: BTreeSet::new(),
            report_updates: Vec::new(),
            created_records: Vec::new(),
            orphaned_records: Vec::new(),
        };

        delta.diff_records();
        delta.diff_relations();
        delta.diff_data_sources();
        delta.collect_resource_keys();
        delta.size_breakdown_updates();
        delta.relation_breakdown_updates();
        delta.data_source_updates();
        delta.cross_source_match_updates();

        Ok(delta)
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn old_snapshot(&self) -> Option<&EntitySnapshot> {
        self.old.as_ref()
    }

    pub fn new_snapshot(&self) -> Option<&EntitySnapshot> {
        self.new.as_ref()
    }

    pub fn added_records(&self) -> &[EntityRecord] {
        &self.added_records
    }

    pub fn removed_records(&self) -> &[EntityRecord] {
        &self.removed_records
    }

    pub fn added_relations(&self) -> &[RelatedEntity] {
        &self.added_relations
    }

    pub fn removed_relations(&self) -> &[RelatedEntity] {
        &self.removed_relations
    }

    /// Relations present on both sides with any observable difference,
    /// as `(old, new)` pairs.
    pub fn changed_relations(&self) -> &[(RelatedEntity, RelatedEntity)] {
        &self.changed_relations
    }

    /// Signed record-count change per data source.
    pub fn data_source_deltas(&self) -> &BTreeMap<String, i64> {
        &self.data_source_deltas
    }

    /// Lock rows to enroll, already in canonical acquisition order.
    pub fn resource_keys(&self) -> &BTreeSet<ResourceKey> {
        &self.resource_keys
    }

    pub fn report_updates(&self) -> &[ReportUpdate] {
        &self.report_updates
    }

    /// Distinct report keys touched so far.
    pub fn report_keys(&self) -> BTreeSet<ReportKey> {
        self.report_updates.iter().map(|u| u.key.clone()).collect()
    }

    pub fn created_records(&self) -> &[RecordKey] {
        &self.created_records
    }

    pub fn orphaned_records(&self) -> &[RecordKey] {
        &self.orphaned_records
    }

    // ----- persistence feedback -----

    /// The persistence layer actually inserted this record row.
    pub fn mark_created(&mut self, key: &RecordKey) -> Result<(), DeltaError> {
        let record = self
            .added_records
            .iter()
            .find(|r| r.data_source == key.data_source && r.record_id == key.record_id)
            .ok_or_else(|| DeltaError::UnknownRecord(key.clone()))?;

        let update = ReportUpdate {
            key: ReportKey::dss(record.data_source.clone(), SourceStatistic::RecordCount),
            entity_delta: 0,
            record_delta: 1,
            relation_delta: 0,
            entity_id: self.entity_id,
            related_id: None,
        };
        self.report_updates.push(update);
        self.created_records.push(key.clone());
        Ok(())
    }

    /// The persistence layer actually orphaned this record row. The row
    /// itself outlives the refresh; the aggregator's orphan reconciliation
    /// decides whether it is deleted or re-adopted.
    pub fn mark_orphaned(&mut self, key: &RecordKey) -> Result<(), DeltaError> {
        if !self
            .removed_records
            .iter()
            .any(|r| r.data_source == key.data_source && r.record_id == key.record_id)
        {
            return Err(DeltaError::UnknownRecord(key.clone()));
        }
        self.orphaned_records.push(key.clone());
        Ok(())
    }

    /// The persistence layer inserted or rewrote the relationship row with
    /// `related_id`. `previous` is the stored state recovered from the prior
    /// relation hash, `None` for a fresh insert.
    pub fn track_stored_relationship(
        &mut self,
        related_id: EntityId,
        previous: Option<&StoredRelation>,
    ) -> Result<(), DeltaError> {
        let new_relation = self
            .added_relations
            .iter()
            .find(|r| r.entity_id == related_id)
            .or_else(|| {
                self.changed_relations
                    .iter()
                    .find(|(_, n)| n.entity_id == related_id)
                    .map(|(_, n)| n)
            })
            .ok_or(DeltaError::UnknownRelation(related_id))?;

        let my_summary = self
            .new
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default();
        let new_contribs = relation_contributions(
            &my_summary,
            &new_relation.source_summary,
            SourceStatistic::for_match_type(new_relation.match_type),
        );
        let old_contribs = previous
            .map(|stored| self.stored_contributions(stored, related_id))
            .unwrap_or_default();

        self.push_relation_diff(related_id, &old_contribs, &new_contribs);
        Ok(())
    }

    /// The persistence layer deleted the relationship row with `related_id`;
    /// `stored` is the state recovered from the deleted row's hash.
    pub fn track_deleted_relationship(
        &mut self,
        related_id: EntityId,
        stored: &StoredRelation,
    ) -> Result<(), DeltaError> {
        if !self
            .removed_relations
            .iter()
            .any(|r| r.entity_id == related_id)
        {
            return Err(DeltaError::UnknownRelation(related_id));
        }

        let old_contribs = self.stored_contributions(stored, related_id);
        self.push_relation_diff(related_id, &old_contribs, &BTreeMap::new());
        Ok(())
    }

    fn stored_contributions(
        &self,
        stored: &StoredRelation,
        related_id: EntityId,
    ) -> RelationContribs {
        let empty = BTreeMap::new();
        let my_summary = stored.summary_for(self.entity_id).unwrap_or(&empty);
        let related_summary = stored.summary_for(related_id).unwrap_or(&empty);
        relation_contributions(
            my_summary,
            related_summary,
            SourceStatistic::for_match_type(stored.match_type),
        )
    }

    fn push_relation_diff(
        &mut self,
        related_id: EntityId,
        old: &RelationContribs,
        new: &RelationContribs,
    ) {
        let keys: BTreeSet<&(String, String, SourceStatistic)> =
            old.keys().chain(new.keys()).collect();
        let mut updates = Vec::new();
        for (source, versus, statistic) in keys {
            let key = ReportKey::css(source.clone(), versus.clone(), *statistic);
            let before = old
                .get(&(source.clone(), versus.clone(), *statistic))
                .copied()
                .unwrap_or_default();
            let after = new
                .get(&(source.clone(), versus.clone(), *statistic))
                .copied()
                .unwrap_or_default();
            updates.push(ReportUpdate {
                key,
                entity_delta: after.entities - before.entities,
                record_delta: after.records - before.records,
                relation_delta: after.entities - before.entities,
                entity_id: self.entity_id,
                related_id: Some(related_id),
            });
        }
        self.report_updates
            .extend(updates.into_iter().filter(|u| !u.is_noop()));
    }

    // ----- construction passes -----

    fn diff_records(&mut self) {
        let old_keys: BTreeSet<RecordKey> = self
            .old
            .iter()
            .flat_map(|s| s.records.iter().map(EntityRecord::key))
            .collect();
        let new_keys: BTreeSet<RecordKey> = self
            .new
            .iter()
            .flat_map(|s| s.records.iter().map(EntityRecord::key))
            .collect();

        if let Some(new) = &self.new {
            self.added_records = new
                .records
                .iter()
                .filter(|r| !old_keys.contains(&r.key()))
                .cloned()
                .collect();
        }
        if let Some(old) = &self.old {
            self.removed_records = old
                .records
                .iter()
                .filter(|r| !new_keys.contains(&r.key()))
                .cloned()
                .collect();
        }
    }

    fn diff_relations(&mut self) {
        let empty = BTreeMap::new();
        let old_relations = self.old.as_ref().map(|s| &s.related).unwrap_or(&empty);
        let new_relations = self.new.as_ref().map(|s| &s.related).unwrap_or(&empty);

        // A change to my own breakdown changes every surviving edge, since
        // both endpoints' summaries are part of the stored relationship.
        let my_breakdown_changed = self
            .old
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default()
            != self
                .new
                .as_ref()
                .map(EntitySnapshot::source_breakdown)
                .unwrap_or_default();

        for (id, relation) in new_relations {
            match old_relations.get(id) {
                None => self.added_relations.push(relation.clone()),
                Some(existing) if existing != relation || my_breakdown_changed => self
                    .changed_relations
                    .push((existing.clone(), relation.clone())),
                Some(_) => {}
            }
        }
        for (id, relation) in old_relations {
            if !new_relations.contains_key(id) {
                self.removed_relations.push(relation.clone());
            }
        }
    }

    fn diff_data_sources(&mut self) {
        let old_bd = self
            .old
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default();
        let new_bd = self
            .new
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default();

        let sources: BTreeSet<&String> = old_bd.keys().chain(new_bd.keys()).collect();
        for source in sources {
            let before = old_bd.get(source).copied().unwrap_or(0);
            let after = new_bd.get(source).copied().unwrap_or(0);
            if before != after {
                self.data_source_deltas
                    .insert(source.clone(), after - before);
            }
        }
    }

    fn collect_resource_keys(&mut self) {
        for record in self.added_records.iter().chain(&self.removed_records) {
            self.resource_keys
                .insert(ResourceKey::record(&*record.data_source, &*record.record_id));
        }
        let touched = self
            .added_relations
            .iter()
            .chain(&self.removed_relations)
            .map(|r| r.entity_id)
            .chain(self.changed_relations.iter().map(|(_, n)| n.entity_id));
        for related_id in touched {
            self.resource_keys
                .insert(ResourceKey::relationship(self.entity_id, related_id));
        }
    }

    fn push_update(
        &mut self,
        key: ReportKey,
        entity_delta: i64,
        record_delta: i64,
        relation_delta: i64,
    ) {
        let update = ReportUpdate {
            key,
            entity_delta,
            record_delta,
            relation_delta,
            entity_id: self.entity_id,
            related_id: None,
        };
        if !update.is_noop() {
            self.report_updates.push(update);
        }
    }

    fn size_breakdown_updates(&mut self) {
        let old_bucket = self.old.as_ref().map(EntitySnapshot::record_count);
        let new_bucket = self.new.as_ref().map(EntitySnapshot::record_count);
        if old_bucket == new_bucket {
            return;
        }
        if let Some(bucket) = old_bucket {
            self.push_update(ReportKey::esb(bucket), -1, 0, 0);
        }
        if let Some(bucket) = new_bucket {
            self.push_update(ReportKey::esb(bucket), 1, 0, 0);
        }
    }

    fn relation_breakdown_updates(&mut self) {
        let old_bucket = self.old.as_ref().map(EntitySnapshot::relation_count);
        let new_bucket = self.new.as_ref().map(EntitySnapshot::relation_count);
        if old_bucket == new_bucket {
            return;
        }
        if let Some(bucket) = old_bucket {
            self.push_update(ReportKey::erb(bucket), -1, 0, 0);
        }
        if let Some(bucket) = new_bucket {
            self.push_update(ReportKey::erb(bucket), 1, 0, 0);
        }
    }

    fn data_source_updates(&mut self) {
        let old_bd = self
            .old
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default();
        let new_bd = self
            .new
            .as_ref()
            .map(EntitySnapshot::source_breakdown)
            .unwrap_or_default();

        let sources: BTreeSet<String> = old_bd.keys().chain(new_bd.keys()).cloned().collect();
        for source in sources {
            match (old_bd.get(&source), new_bd.get(&source)) {
                (None, Some(&count)) => {
                    self.push_update(
                        ReportKey::dss(&*source, SourceStatistic::EntityCount),
                        1,
                        0,
                        0,
                    );
                    if count == 1 {
                        self.push_update(
                            ReportKey::dss(&*source, SourceStatistic::UnmatchedCount),
                            1,
                            1,
                            0,
                        );
                    } else {
                        self.push_update(
                            ReportKey::dss(&*source, SourceStatistic::MatchedCount),
                            1,
                            count,
                            0,
                        );
                    }
                }
                (Some(&count), None) => {
                    self.push_update(
                        ReportKey::dss(&*source, SourceStatistic::EntityCount),
                        -1,
                        0,
                        0,
                    );
                    if count == 1 {
                        self.push_update(
                            ReportKey::dss(&*source, SourceStatistic::UnmatchedCount),
                            -1,
                            -1,
                            0,
                        );
                    } else {
                        self.push_update(
                            ReportKey::dss(&*source, SourceStatistic::MatchedCount),
                            -1,
                            -count,
                            0,
                        );
                    }
                }
                (Some(&before), Some(&after)) if before != after => {
                    match (before == 1, after == 1) {
                        (true, false) => {
                            self.push_update(
                                ReportKey::dss(&*source, SourceStatistic::UnmatchedCount),
                                -1,
                                -1,
                                0,
                            );
                            self.push_update(
                                ReportKey::dss(&*source, SourceStatistic::MatchedCount),
                                1,
                                after,
                                0,
                            );
                        }
                        (false, true) => {
                            self.push_update(
                                ReportKey::dss(&*source, SourceStatistic::MatchedCount),
                                -1,
                                -before,
                                0,
                            );
                            self.push_update(
                                ReportKey::dss(&*source, SourceStatistic::UnmatchedCount),
                                1,
                                1,
                                0,
                            );
                        }
                        (false, false) => {
                            self.push_update(
                                ReportKey::dss(&*source, SourceStatistic::MatchedCount),
                                0,
                                after - before,
                                0,
                            );
                        }
                        (true, true) => {}
                    }
                }
                _ => {}
            }
        }
    }

    /// Cross-source matched-record statistics: one cell per ordered pair of
    /// distinct sources present in the record set, counting the first
    /// source's records.
    fn cross_source_match_updates(&mut self) {
        fn pair_map(snapshot: Option<&EntitySnapshot>) -> BTreeMap<(String, String), i64> {
            let mut pairs = BTreeMap::new();
            let Some(snapshot) = snapshot else {
                return pairs;
            };
            let breakdown = snapshot.source_breakdown();
            for (s1, count) in &breakdown {
                for s2 in breakdown.keys() {
                    if s1 != s2 {
                        pairs.insert((s1.clone(), s2.clone()), *count);
                    }
                }
            }
            pairs
        }

        let old_pairs = pair_map(self.old.as_ref());
        let new_pairs = pair_map(self.new.as_ref());
        let keys: BTreeSet<(String, String)> =
            old_pairs.keys().chain(new_pairs.keys()).cloned().collect();

        for (source, versus) in keys {
            let key = ReportKey::css(&*source, &*versus, SourceStatistic::MatchedCount);
            match (
                old_pairs.get(&(source.clone(), versus.clone())),
                new_pairs.get(&(source.clone(), versus.clone())),
            ) {
                (None, Some(&records)) => self.push_update(key, 1, records, 0),
                (Some(&records), None) => self.push_update(key, -1, -records, 0),
                (Some(&before), Some(&after)) if before != after => {
                    self.push_update(key, 0, after - before, 0)
                }
                _ => {}
            }
        }
    }
}
