use crate::config::STORE_FORMAT_VERSION;
use crate::error::{io_err, StoreError};
use crate::models::{Amenity, IdSet, OsmId};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persistence for amenity records, keyed by OSM id.
///
/// Writes may be buffered until [`Store::flush`]; callers treat a successful
/// flush as the commit point of everything written before it.
pub trait Store {
    /// Highest version of any record, `None` for an empty store.
    fn max_version(&self) -> Result<Option<u32>, StoreError>;

    fn all_ids(&self) -> Result<IdSet, StoreError>;

    fn ids_with_version_below(&self, version: u32) -> Result<IdSet, StoreError>;

    fn contains(&self, osm_id: OsmId) -> Result<bool, StoreError>;

    fn get(&self, osm_id: OsmId) -> Result<Option<Amenity>, StoreError>;

    /// All-or-nothing: fails with [`StoreError::Duplicate`] if any id is already stored
    /// or repeated within the batch.
    fn insert_many(&mut self, amenities: Vec<Amenity>) -> Result<(), StoreError>;

    /// Replaces the record with the same id. Returns `false` if there is none.
    fn update(&mut self, amenity: Amenity) -> Result<bool, StoreError>;

    /// Returns how many of `ids` were actually removed.
    fn delete_ids(&mut self, ids: &[OsmId]) -> Result<usize, StoreError>;

    /// Every record in ascending id order.
    fn records(&self) -> Result<Box<dyn Iterator<Item = &Amenity> + '_>, StoreError>;

    fn set_topics(&mut self, osm_id: OsmId, topics: BTreeSet<String>) -> Result<bool, StoreError>;

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: BTreeMap<OsmId, Amenity>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<Amenity> for MemoryStore {
    fn from_iter<I: IntoIterator<Item = Amenity>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(|a| (a.osm_id, a)).collect(),
        }
    }
}

impl Store for MemoryStore {
    fn max_version(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.records.values().map(|a| a.version).max())
    }

    fn all_ids(&self) -> Result<IdSet, StoreError> {
        Ok(self.records.keys().copied().collect())
    }

    fn ids_with_version_below(&self, version: u32) -> Result<IdSet, StoreError> {
        Ok(self
            .records
            .values()
            .filter(|a| a.version < version)
            .map(|a| a.osm_id)
            .collect())
    }

    fn contains(&self, osm_id: OsmId) -> Result<bool, StoreError> {
        Ok(self.records.contains_key(&osm_id))
    }

    fn get(&self, osm_id: OsmId) -> Result<Option<Amenity>, StoreError> {
        Ok(self.records.get(&osm_id).cloned())
    }

    fn insert_many(&mut self, amenities: Vec<Amenity>) -> Result<(), StoreError> {
        let mut batch_ids = IdSet::default();
        for amenity in &amenities {
            if self.records.contains_key(&amenity.osm_id) || !batch_ids.insert(amenity.osm_id) {
                return Err(StoreError::Duplicate(amenity.osm_id));
            }
        }
        self.records
            .extend(amenities.into_iter().map(|a| (a.osm_id, a)));
        Ok(())
    }

    fn update(&mut self, amenity: Amenity) -> Result<bool, StoreError> {
        match self.records.get_mut(&amenity.osm_id) {
            Some(existing) => {
                *existing = amenity;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_ids(&mut self, ids: &[OsmId]) -> Result<usize, StoreError> {
        Ok(ids
            .iter()
            .filter(|id| self.records.remove(*id).is_some())
            .count())
    }

    fn records(&self) -> Result<Box<dyn Iterator<Item = &Amenity> + '_>, StoreError> {
        Ok(Box::new(self.records.values()))
    }

    fn set_topics(&mut self, osm_id: OsmId, topics: BTreeSet<String>) -> Result<bool, StoreError> {
        match self.records.get_mut(&osm_id) {
            Some(existing) => {
                existing.topics = topics;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Deserialize)]
struct StoreFileDe {
    format: u32,
    records: Vec<Amenity>,
}

/// Borrows the records to avoid cloning the whole store on every flush.
#[derive(Serialize)]
struct StoreFileSer<'a> {
    format: u32,
    records: Vec<&'a Amenity>,
}

/// A [`MemoryStore`] persisted to a single bincode file on every flush.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    dirty: bool,
}

impl FileStore {
    /// Opens `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = match fs::metadata(&path) {
            Ok(meta) => load(&path, meta.len())?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = ?path, "Store file not found, starting empty");
                MemoryStore::new()
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Self {
            path,
            inner,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn mark<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if result.is_ok() {
            self.dirty = true;
        }
        result
    }
}

fn load(path: &Path, file_size: u64) -> Result<MemoryStore, StoreError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let reader = BufReader::with_capacity(256 * 1024, file);

    let options = bincode::options().with_limit(file_size.saturating_add(1024));
    let stored: StoreFileDe =
        options
            .deserialize_from(reader)
            .map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

    if stored.format != STORE_FORMAT_VERSION {
        return Err(StoreError::FormatVersion {
            path: path.to_path_buf(),
            found: stored.format,
            expected: STORE_FORMAT_VERSION,
        });
    }

    info!(records = stored.records.len(), path = ?path, "Store loaded");
    Ok(stored.records.into_iter().collect())
}

impl Store for FileStore {
    fn max_version(&self) -> Result<Option<u32>, StoreError> {
        self.inner.max_version()
    }

    fn all_ids(&self) -> Result<IdSet, StoreError> {
        self.inner.all_ids()
    }

    fn ids_with_version_below(&self, version: u32) -> Result<IdSet, StoreError> {
        self.inner.ids_with_version_below(version)
    }

    fn contains(&self, osm_id: OsmId) -> Result<bool, StoreError> {
        self.inner.contains(osm_id)
    }

    fn get(&self, osm_id: OsmId) -> Result<Option<Amenity>, StoreError> {
        self.inner.get(osm_id)
    }

    fn insert_many(&mut self, amenities: Vec<Amenity>) -> Result<(), StoreError> {
        let result = self.inner.insert_many(amenities);
        self.mark(result)
    }

    fn update(&mut self, amenity: Amenity) -> Result<bool, StoreError> {
        let result = self.inner.update(amenity);
        self.mark(result)
    }

    fn delete_ids(&mut self, ids: &[OsmId]) -> Result<usize, StoreError> {
        let result = self.inner.delete_ids(ids);
        self.mark(result)
    }

    fn records(&self) -> Result<Box<dyn Iterator<Item = &Amenity> + '_>, StoreError> {
        self.inner.records()
    }

    fn set_topics(&mut self, osm_id: OsmId, topics: BTreeSet<String>) -> Result<bool, StoreError> {
        let result = self.inner.set_topics(osm_id, topics);
        self.mark(result)
    }

    /// Writes atomically via a temp file and rename; a no-op when nothing changed.
    fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }

        let stored = StoreFileSer {
            format: STORE_FORMAT_VERSION,
            records: self.inner.records.values().collect(),
        };

        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);

        bincode::DefaultOptions::new()
            .serialize_into(&mut writer, &stored)
            .map_err(StoreError::Encode)?;
        let file = writer
            .into_inner()
            .map_err(|e| io_err(&tmp_path, e.into_error()))?;
        file.sync_all().map_err(|e| io_err(&tmp_path, e))?;

        fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        self.dirty = false;

        debug!(records = stored.records.len(), path = ?self.path, "Store flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeoPoint, Tags};
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use tempfile::TempDir;

    fn amenity(osm_id: OsmId, version: u32) -> Amenity {
        Amenity {
            osm_id,
            name: format!("Place {osm_id}"),
            geo: GeoPoint { lon: 13.4, lat: 52.5 },
            country: "DE".to_string(),
            street: String::new(),
            housenumber: String::new(),
            postcode: String::new(),
            city: "Berlin".to_string(),
            amenity: "cafe".to_string(),
            category: "cafe".to_string(),
            topics: BTreeSet::new(),
            tags: Tags::new(),
            version,
            last_update: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn ids(ids: &[OsmId]) -> IdSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn empty_store_has_no_max_version() {
        assert_eq!(MemoryStore::new().max_version().unwrap(), None);
    }

    #[test]
    fn version_queries() {
        let store: MemoryStore = vec![amenity(1, 1), amenity(2, 3), amenity(3, 2)]
            .into_iter()
            .collect();
        assert_eq!(store.max_version().unwrap(), Some(3));
        assert_eq!(store.all_ids().unwrap(), ids(&[1, 2, 3]));
        assert_eq!(store.ids_with_version_below(3).unwrap(), ids(&[1, 3]));
        assert!(store.ids_with_version_below(1).unwrap().is_empty());
    }

    #[test]
    fn duplicate_insert_rejects_whole_batch() {
        let mut store = MemoryStore::new();
        store.insert_many(vec![amenity(1, 1)]).unwrap();

        let err = store
            .insert_many(vec![amenity(2, 1), amenity(1, 1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(1)));
        assert!(!store.contains(2).unwrap());

        let err = store
            .insert_many(vec![amenity(3, 1), amenity(3, 1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(3)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_replaces_existing_only() {
        let mut store: MemoryStore = vec![amenity(1, 1)].into_iter().collect();
        let mut changed = amenity(1, 2);
        changed.name = "Renamed".to_string();

        assert!(store.update(changed).unwrap());
        assert_eq!(store.get(1).unwrap().unwrap().name, "Renamed");
        assert!(!store.update(amenity(9, 2)).unwrap());
        assert!(!store.contains(9).unwrap());
    }

    #[test]
    fn delete_counts_removed_records() {
        let mut store: MemoryStore = vec![amenity(1, 1), amenity(2, 1)].into_iter().collect();
        assert_eq!(store.delete_ids(&[2, 3]).unwrap(), 1);
        assert_eq!(store.all_ids().unwrap(), ids(&[1]));
    }

    #[test]
    fn records_are_ordered_by_id() {
        let store: MemoryStore = vec![amenity(3, 1), amenity(1, 1), amenity(2, 1)]
            .into_iter()
            .collect();
        let order: Vec<OsmId> = store.records().unwrap().map(|a| a.osm_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("amenities.bin");

        let mut store = FileStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.insert_many(vec![amenity(1, 1), amenity(2, 2)]).unwrap();
        store
            .set_topics(2, ["food".to_string()].into_iter().collect())
            .unwrap();
        store.flush().unwrap();
        assert!(path.exists());

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.max_version().unwrap(), Some(2));
        assert_eq!(reopened.get(2).unwrap(), store.get(2).unwrap());
        assert!(reopened.get(2).unwrap().unwrap().topics.contains("food"));
    }

    #[test]
    fn unflushed_writes_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("amenities.bin");

        let mut store = FileStore::open(&path).unwrap();
        store.insert_many(vec![amenity(1, 1)]).unwrap();
        store.flush().unwrap();
        store.insert_many(vec![amenity(2, 1)]).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.all_ids().unwrap(), ids(&[1]));
    }

    #[test]
    fn clean_flush_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("amenities.bin");
        let mut store = FileStore::open(&path).unwrap();
        store.flush().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_store_location_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        File::create(&blocker).unwrap();

        assert!(matches!(
            FileStore::open(blocker.join("amenities.bin")),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn flush_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("amenities.bin");
        let mut store = FileStore::open(&path).unwrap();
        store.insert_many(vec![amenity(1, 1)]).unwrap();
        store.flush().unwrap();

        assert!(!path.with_extension("tmp").exists());
        let size = fs::metadata(&path).unwrap().len();
        assert!(size > 0);
        assert_eq!(FileStore::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_store_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("amenities.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"not valid bincode").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn format_version_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("amenities.bin");
        let stale = StoreFileSer {
            format: STORE_FORMAT_VERSION + 1,
            records: Vec::new(),
        };
        let file = File::create(&path).unwrap();
        bincode::DefaultOptions::new()
            .serialize_into(BufWriter::new(file), &stale)
            .unwrap();

        match FileStore::open(&path) {
            Err(StoreError::FormatVersion { found, expected, .. }) => {
                assert_eq!(found, STORE_FORMAT_VERSION + 1);
                assert_eq!(expected, STORE_FORMAT_VERSION);
            }
            other => panic!("expected format version error, got {:?}", other.err()),
        }
    }
}
