use super::ResultsStore;
use crate::archive::{self, ResultsPayload};
use crate::errors::{AppError, AppResult};
use crate::table::ResultTable;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_CACHE_CAPACITY: usize = 20;

#[derive(Debug)]
struct Entry {
    payload: ResultsPayload,
    dirty: bool,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PathBuf, Entry>,
    recency: BTreeMap<u64, PathBuf>,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self, key: &Path) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_path_buf());
        }
    }

    fn insert(&mut self, key: &Path, payload: ResultsPayload, dirty: bool) {
        if let Some(previous) = self.entries.remove(key) {
            self.recency.remove(&previous.tick);
        }
        self.tick += 1;
        self.recency.insert(self.tick, key.to_path_buf());
        self.entries.insert(
            key.to_path_buf(),
            Entry {
                payload,
                dirty,
                tick: self.tick,
            },
        );
    }

    fn remove(&mut self, key: &Path) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

/// Bounded write-back cache of run results keyed by backing file path.
///
/// At most `capacity` payloads stay in memory. Evicting the least recently
/// used entry writes it to its backing file first if it changed since it was
/// last read or written, so every key resolves to current data either here or
/// on disk.
#[derive(Debug)]
pub struct ResultsCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for ResultsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ResultsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("results cache mutex poisoned".to_string()))
    }

    /// Inserts or replaces `key`, evicting as needed.
    pub fn put(&self, key: &Path, payload: ResultsPayload) -> AppResult<()> {
        let mut state = self.lock()?;
        state.insert(key, payload, true);
        self.evict_over_capacity(&mut state, key)
    }

    /// Returns a copy of the payload for `key`, reading it from disk on a miss.
    pub fn get(&self, key: &Path) -> AppResult<ResultsPayload> {
        self.with_entry(key, false, |payload| Ok(payload.clone()))
    }

    /// Runs `f` against the resident payload for `key`, loading it first if
    /// needed, and marks the entry modified.
    pub fn update<T>(&self, key: &Path, f: impl FnOnce(&mut ResultsPayload) -> AppResult<T>) -> AppResult<T> {
        self.with_entry(key, true, f)
    }

    fn with_entry<T>(
        &self,
        key: &Path,
        modifies: bool,
        f: impl FnOnce(&mut ResultsPayload) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut state = self.lock()?;
        if state.entries.contains_key(key) {
            state.touch(key);
        } else {
            let payload = archive::read(key)?;
            tracing::debug!(path = %key.display(), "results cache miss loaded from disk");
            state.insert(key, payload, false);
        }

        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| AppError::Internal("results cache entry vanished".to_string()))?;
        let output = f(&mut entry.payload)?;
        if modifies {
            entry.dirty = true;
        }
        self.evict_over_capacity(&mut state, key)?;
        Ok(output)
    }

    /// Drops the resident copy of `key` and reads it back from disk.
    ///
    /// Keys that were never written to disk keep their resident copy.
    pub fn reload(&self, key: &Path) -> AppResult<ResultsPayload> {
        if !key.exists() {
            return self.get(key);
        }
        let payload = archive::read(key)?;
        let mut state = self.lock()?;
        state.insert(key, payload.clone(), false);
        self.evict_over_capacity(&mut state, key)?;
        Ok(payload)
    }

    /// Forgets `key` without writing it out.
    pub fn remove(&self, key: &Path) -> AppResult<Option<ResultsPayload>> {
        Ok(self.lock()?.remove(key).map(|entry| entry.payload))
    }

    /// Forgets `key` and deletes its backing file.
    pub fn purge(&self, key: &Path) -> AppResult<Option<ResultsPayload>> {
        let mut state = self.lock()?;
        let removed = state.remove(key).map(|entry| entry.payload);
        remove_backing(key)?;
        Ok(removed)
    }

    /// Deletes the backing file of a resident `key`, leaving memory as the
    /// only copy. A later eviction writes it again. Returns false when `key`
    /// is not resident, since the file is then its only copy.
    pub fn release_backing(&self, key: &Path) -> AppResult<bool> {
        let mut state = self.lock()?;
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.dirty = true;
        remove_backing(key)?;
        Ok(true)
    }

    pub fn is_resident(&self, key: &Path) -> AppResult<bool> {
        Ok(self.lock()?.entries.contains_key(key))
    }

    pub fn resident_len(&self) -> AppResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Resident keys, least recently used first.
    pub fn resident_keys(&self) -> AppResult<Vec<PathBuf>> {
        Ok(self.lock()?.recency.values().cloned().collect())
    }

    /// Writes `key` to disk if it has unsaved changes.
    pub fn flush(&self, key: &Path) -> AppResult<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.dirty {
                archive::write(key, &entry.payload)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> AppResult<()> {
        let mut state = self.lock()?;
        for (key, entry) in state.entries.iter_mut().filter(|(_, entry)| entry.dirty) {
            archive::write(key, &entry.payload)?;
            entry.dirty = false;
        }
        Ok(())
    }

    fn evict_over_capacity(&self, state: &mut CacheState, keep: &Path) -> AppResult<()> {
        let mut failures = Vec::new();
        while state.entries.len() > self.capacity {
            let Some(victim) = state
                .recency
                .values()
                .find(|key| key.as_path() != keep && !failures.contains(*key))
                .cloned()
            else {
                break;
            };
            let Some(entry) = state.entries.get(&victim) else {
                break;
            };
            if entry.dirty {
                if let Err(err) = archive::write(&victim, &entry.payload) {
                    tracing::error!(path = %victim.display(), error = %err, "failed to spill evicted results");
                    failures.push(victim);
                    continue;
                }
            }
            tracing::debug!(path = %victim.display(), "evicted results from cache");
            state.remove(&victim);
        }
        match failures.first() {
            Some(path) => Err(AppError::Io(format!("could not spill {} to disk", path.display()))),
            None => Ok(()),
        }
    }
}

fn remove_backing(key: &Path) -> AppResult<()> {
    match std::fs::remove_file(key) {
        Ok(()) => {
            tracing::debug!(path = %key.display(), "deleted spilled results");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Results store kept in a [`ResultsCache`] and spilled to a binary archive.
#[derive(Debug)]
pub struct CachedStore {
    key: PathBuf,
    columns: Vec<String>,
    cache: Arc<ResultsCache>,
}

impl CachedStore {
    /// Registers `payload` under `key` and returns a store over it.
    pub fn create(cache: Arc<ResultsCache>, key: &Path, payload: ResultsPayload) -> AppResult<Self> {
        let columns = payload.table.columns().to_vec();
        cache.put(key, payload)?;
        Ok(Self {
            key: key.to_path_buf(),
            columns,
            cache,
        })
    }

    /// A store over an archive that already exists at `key`.
    pub fn open(cache: Arc<ResultsCache>, key: &Path) -> AppResult<Self> {
        let columns = cache.get(key)?.table.columns().to_vec();
        Ok(Self {
            key: key.to_path_buf(),
            columns,
            cache,
        })
    }

    pub fn payload(&self) -> AppResult<ResultsPayload> {
        self.cache.get(&self.key)
    }
}

impl ResultsStore for CachedStore {
    fn path(&self) -> &Path {
        &self.key
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn append(&self, rows: &[Vec<f64>]) -> AppResult<()> {
        self.cache.update(&self.key, |payload| payload.table.append_rows(rows))
    }

    fn clear(&self) -> AppResult<()> {
        self.cache.update(&self.key, |payload| {
            payload.table.clear();
            Ok(())
        })
    }

    fn data(&self) -> AppResult<ResultTable> {
        Ok(self.cache.get(&self.key)?.table)
    }

    fn replace(&self, build: &mut dyn FnMut(&ResultTable) -> AppResult<Vec<Vec<f64>>>) -> AppResult<usize> {
        self.cache.update(&self.key, |payload| {
            let rows = build(&payload.table)?;
            payload.table.clear();
            payload.table.append_rows(&rows)?;
            Ok(rows.len())
        })
    }

    fn reload(&self) -> AppResult<ResultTable> {
        Ok(self.cache.reload(&self.key)?.table)
    }

    fn flush(&self) -> AppResult<()> {
        self.cache.flush(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::{CachedStore, ResultsCache};
    use crate::archive::{self, ResultsPayload};
    use crate::errors::AppError;
    use crate::procedure::ProcedureSnapshot;
    use crate::results::ResultsStore;
    use crate::table::ResultTable;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn payload(marker: f64) -> ResultsPayload {
        let mut table = ResultTable::new(&["x".to_string()]);
        table.append_rows(&[vec![marker]]).expect("append");
        ResultsPayload::new(
            ProcedureSnapshot {
                class: "Sweep".to_string(),
                parameters: BTreeMap::new(),
            },
            table,
        )
    }

    #[test]
    fn eviction_spills_least_recent_and_misses_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let capacity = 3;
        let cache = ResultsCache::new(capacity);
        let keys: Vec<PathBuf> = (0..capacity + 5).map(|i| dir.path().join(format!("run{i}.swq"))).collect();
        for (index, key) in keys.iter().enumerate() {
            cache.put(key, payload(index as f64)).expect("put");
        }

        assert_eq!(cache.resident_len().expect("len"), capacity);
        assert_eq!(cache.resident_keys().expect("keys"), keys[5..].to_vec());
        for (index, key) in keys[..5].iter().enumerate() {
            assert!(!cache.is_resident(key).expect("resident"));
            assert_eq!(archive::read(key).expect("spilled").table, payload(index as f64).table);
        }

        let reloaded = cache.get(&keys[0]).expect("miss loads");
        assert_eq!(reloaded.table.row(0), Some(vec![0.0]));
        assert!(cache.is_resident(&keys[0]).expect("resident"));
        assert_eq!(cache.resident_len().expect("len"), capacity);
    }

    #[test]
    fn get_refreshes_recency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResultsCache::new(2);
        let a = dir.path().join("a.swq");
        let b = dir.path().join("b.swq");
        let c = dir.path().join("c.swq");
        cache.put(&a, payload(1.0)).expect("put a");
        cache.put(&b, payload(2.0)).expect("put b");
        cache.get(&a).expect("touch a");
        cache.put(&c, payload(3.0)).expect("put c");
        assert!(cache.is_resident(&a).expect("a"));
        assert!(!cache.is_resident(&b).expect("b"));
    }

    #[test]
    fn absent_everywhere_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResultsCache::new(2);
        let err = cache.get(&dir.path().join("nothing.swq")).expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn cached_store_survives_eviction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(ResultsCache::new(1));
        let first = CachedStore::create(cache.clone(), &dir.path().join("first.swq"), payload(1.0)).expect("first");
        first.append(&[vec![2.0]]).expect("append");
        let _second = CachedStore::create(cache.clone(), &dir.path().join("second.swq"), payload(9.0)).expect("second");
        assert!(!cache.is_resident(first.path()).expect("evicted"));
        assert_eq!(first.data().expect("data").column("x").expect("x"), &[1.0, 2.0]);
    }

    #[test]
    fn nothing_is_written_until_eviction_or_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(ResultsCache::new(2));
        let key = dir.path().join("run.swq");
        let store = CachedStore::create(cache.clone(), &key, payload(1.0)).expect("create");
        store.append(&[vec![2.0]]).expect("append");
        store.finish().expect("finish");
        assert!(!key.exists());

        cache.flush_all().expect("flush all");
        assert!(key.exists());
        assert!(cache.release_backing(&key).expect("release"));
        assert!(!key.exists());
        assert_eq!(store.data().expect("data").len(), 2);

        cache.put(&dir.path().join("b.swq"), payload(2.0)).expect("put b");
        cache.put(&dir.path().join("c.swq"), payload(3.0)).expect("put c");
        assert!(key.exists(), "eviction writes released entries again");
        assert!(!cache.release_backing(&key).expect("not resident"));
        assert!(key.exists());

        cache.purge(&key).expect("purge");
        assert!(!key.exists());
    }

    #[test]
    fn reload_discards_unsaved_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(ResultsCache::new(4));
        let store = CachedStore::create(cache.clone(), &dir.path().join("run.swq"), payload(1.0)).expect("create");
        store.flush().expect("flush");
        store.append(&[vec![5.0]]).expect("append");
        assert_eq!(store.data().expect("data").len(), 2);
        assert_eq!(store.reload().expect("reload").len(), 1);
    }
}
