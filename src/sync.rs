//! One reconciliation run between an extract and the store.
//!
//! A run never reloads the store. It derives id sets from the store and from
//! several independent passes over the extract, then creates, updates and
//! deletes only what those sets call for:
//!
//! | set | definition |
//! |-----|------------|
//! | generation | `max(version) + 1`, or 1 for an empty store |
//! | obsolete | stored ids absent from the extract |
//! | fresh | extract ids absent from the store |
//! | candidates | ids changed since the cutoff, stored below the generation with a different `last_update` |
//! | direct | candidates no consultant uses |
//! | safe | used candidates approved by the registry |
//!
//! Every set is recomputed from live state at the start of each run, so
//! re-running after a failure converges. Runs are not atomic and must not
//! overlap on the same store.

use crate::config::{CHECKPOINT_INTERVAL, CREATE_BATCH_SIZE, DELETE_BATCH_SIZE};
use crate::error::SyncError;
use crate::mapping::{AmenityMapper, TopicRules};
use crate::models::{IdSet, OsmId};
use crate::parser::{collect_ids, collect_timestamps, open_nodes, ExtractSource, NodeFilter};
use crate::registry::UsageRegistry;
use crate::store::Store;
use crate::writer::{BatchWriter, WriteSummary};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Nodes modified at or after this instant count as changed.
    pub cutoff: DateTime<Utc>,
    pub delete_obsolete: bool,
    pub create_batch_size: usize,
    pub delete_batch_size: usize,
    pub checkpoint_every: u64,
}

impl SyncOptions {
    pub fn new(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            delete_obsolete: false,
            create_batch_size: CREATE_BATCH_SIZE,
            delete_batch_size: DELETE_BATCH_SIZE,
            checkpoint_every: CHECKPOINT_INTERVAL,
        }
    }

    pub fn delete_obsolete(mut self, enabled: bool) -> Self {
        self.delete_obsolete = enabled;
        self
    }
}

/// Counters of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub generation: u32,
    pub existing: usize,
    pub current: usize,
    pub changed: usize,
    pub obsolete: usize,
    pub deleted: u64,
    /// Obsolete ids kept because a consultant still uses them.
    pub kept: usize,
    pub created: u64,
    pub updated: u64,
    /// Changed nodes whose modification is already stored.
    pub applied: usize,
    /// Used update candidates the registry did not approve.
    pub vetoed: usize,
    /// Updates whose target disappeared from the store mid-run.
    pub missing: u64,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

pub struct SyncEngine<'a, X: ExtractSource + ?Sized> {
    source: &'a X,
    store: &'a mut dyn Store,
    registry: &'a UsageRegistry,
    mapper: AmenityMapper,
    options: SyncOptions,
    progress: ProgressBar,
}

impl<'a, X: ExtractSource + ?Sized> SyncEngine<'a, X> {
    pub fn new(
        source: &'a X,
        store: &'a mut dyn Store,
        registry: &'a UsageRegistry,
        mapper: AmenityMapper,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            mapper,
            options,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn reconcile(&mut self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        let generation = self
            .store
            .max_version()
            .map_err(SyncError::StoreRead)?
            .map_or(1, |v| v + 1);
        report.generation = generation;

        let existing = self.store.all_ids().map_err(SyncError::StoreRead)?;
        let existing_outdated = self
            .store
            .ids_with_version_below(generation)
            .map_err(SyncError::StoreRead)?;

        self.progress.set_message("reading extract ids");
        let current = collect_ids(self.source, NodeFilter::ids_only(), &self.progress)?;
        self.progress.set_message("reading changed extract ids");
        let changed = collect_timestamps(
            self.source,
            NodeFilter::ids_only().since(self.options.cutoff),
            &self.progress,
        )?;

        report.existing = existing.len();
        report.current = current.len();
        report.changed = changed.len();
        info!(
            generation,
            existing = existing.len(),
            outdated = existing_outdated.len(),
            current = current.len(),
            changed = changed.len(),
            cutoff = %self.options.cutoff,
            "Starting reconciliation"
        );

        let obsolete = &existing - &current;
        let used = self.registry.used_ids()?;
        report.obsolete = obsolete.len();

        let writer = BatchWriter::new(self.progress.clone());

        if self.options.delete_obsolete {
            let mut remove: Vec<OsmId> = obsolete.difference(&used).copied().collect();
            remove.sort_unstable();
            report.kept = obsolete.len() - remove.len();
            info!(remove = remove.len(), kept = report.kept, "Removing obsolete amenities");

            let summary =
                writer.delete_batched(self.store, &remove, self.options.delete_batch_size)?;
            report.deleted = summary.written;
        } else {
            debug!(obsolete = obsolete.len(), "Deletion disabled, keeping obsolete amenities");
        }

        let fresh = &current - &existing;
        info!(fresh = fresh.len(), "Creating new amenities");
        report.created = self.create(&writer, fresh, generation)?.written;

        let mut candidates = IdSet::default();
        for (&osm_id, timestamp) in &changed {
            if !existing_outdated.contains(&osm_id) {
                continue;
            }
            let stored = self.store.get(osm_id).map_err(SyncError::StoreRead)?;
            if stored.is_some_and(|amenity| amenity.last_update == *timestamp) {
                report.applied += 1;
            } else {
                candidates.insert(osm_id);
            }
        }
        debug!(
            candidates = candidates.len(),
            applied = report.applied,
            "Selected update candidates"
        );

        let direct = &candidates - &used;
        let used_candidates = &candidates & &used;

        info!(direct = direct.len(), "Updating existing unused amenities");
        let summary = self.update(&writer, direct, generation)?;
        report.updated += summary.written;
        report.missing += summary.missing;

        info!(used = used_candidates.len(), "Checking existing used amenities");
        let safe = self.registry.safe_update_ids(&used_candidates)?;
        report.vetoed = used_candidates.len() - safe.len();

        info!(safe = safe.len(), vetoed = report.vetoed, "Updating existing used safe amenities");
        let summary = self.update(&writer, safe, generation)?;
        report.updated += summary.written;
        report.missing += summary.missing;

        self.progress.finish_and_clear();
        info!(
            generation,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            vetoed = report.vetoed,
            "Reconciliation complete"
        );
        Ok(report)
    }

    fn create(
        &mut self,
        writer: &BatchWriter,
        ids: IdSet,
        generation: u32,
    ) -> Result<WriteSummary, SyncError> {
        if ids.is_empty() {
            return Ok(WriteSummary::default());
        }
        let mapper = &self.mapper;
        let nodes = open_nodes(self.source, NodeFilter::all().with_ids(ids))?;
        let records = nodes.map(|node| node.map(|n| mapper.map(n, generation)));
        writer.create_batched(self.store, records, self.options.create_batch_size)
    }

    fn update(
        &mut self,
        writer: &BatchWriter,
        ids: IdSet,
        generation: u32,
    ) -> Result<WriteSummary, SyncError> {
        if ids.is_empty() {
            return Ok(WriteSummary::default());
        }
        let mapper = &self.mapper;
        let nodes = open_nodes(self.source, NodeFilter::all().with_ids(ids))?;
        let records = nodes.map(|node| node.map(|n| mapper.map(n, generation)));
        writer.update_streamed(self.store, records, self.options.checkpoint_every)
    }
}

/// Recomputes topics of every stored record from its stored tags and writes back
/// the ones that changed. Versions are left alone.
pub fn reapply_topics(store: &mut dyn Store, rules: &TopicRules) -> Result<u64, SyncError> {
    let changed: Vec<_> = store
        .records()
        .map_err(SyncError::StoreRead)?
        .filter_map(|amenity| {
            let topics = rules.topics_for(&amenity.tags);
            (topics != amenity.topics).then(|| (amenity.osm_id, topics))
        })
        .collect();

    let mut updated = 0;
    for (osm_id, topics) in changed {
        if store
            .set_topics(osm_id, topics)
            .map_err(SyncError::write("updating topics"))?
        {
            updated += 1;
        }
    }
    store.flush().map_err(SyncError::write("updating topics"))?;

    info!(updated, "Topics reapplied");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::WILDCARD;
    use crate::models::{Amenity, GeoPoint, Tags};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn stored(osm_id: OsmId, tags: &[(&str, &str)], topics: &[&str]) -> Amenity {
        Amenity {
            osm_id,
            name: String::new(),
            geo: GeoPoint { lon: 0.0, lat: 0.0 },
            country: String::new(),
            street: String::new(),
            housenumber: String::new(),
            postcode: String::new(),
            city: String::new(),
            amenity: String::new(),
            category: String::new(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Tags>(),
            version: 4,
            last_update: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn options_default_to_fixed_batch_sizes() {
        let options = SyncOptions::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(!options.delete_obsolete);
        assert_eq!(options.create_batch_size, 1000);
        assert_eq!(options.delete_batch_size, 100);
        assert_eq!(options.checkpoint_every, 1000);
        assert!(options.delete_obsolete(true).delete_obsolete);
    }

    #[test]
    fn reapply_topics_touches_only_changed_records() {
        let mut store: MemoryStore = vec![
            stored(1, &[("shop", "bakery")], &[]),
            stored(2, &[("amenity", "cafe")], &["food"]),
            stored(3, &[("amenity", "bench")], &["stale"]),
        ]
        .into_iter()
        .collect();

        let rules = TopicRules::new()
            .with_topic("food", [("amenity", "cafe")])
            .with_topic("shopping", [("shop", WILDCARD)]);

        assert_eq!(reapply_topics(&mut store, &rules).unwrap(), 2);

        let topics = |id| store.get(id).unwrap().unwrap().topics;
        let expected = |names: &[&str]| names.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(topics(1), expected(&["shopping"]));
        assert_eq!(topics(2), expected(&["food"]));
        assert_eq!(topics(3), expected(&[]));
        assert_eq!(store.get(1).unwrap().unwrap().version, 4);
    }

    #[test]
    fn noop_report() {
        assert!(SyncReport::default().is_noop());
        let report = SyncReport {
            updated: 1,
            ..SyncReport::default()
        };
        assert!(!report.is_noop());
    }
}
