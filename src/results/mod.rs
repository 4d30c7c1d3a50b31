pub mod cache;
pub mod datalog;
pub mod line_buffer;

use crate::archive::{self, ResultsPayload};
use crate::errors::{AppError, AppResult};
use crate::procedure::{Procedure, ProcedureRegistry, ProcedureSnapshot};
use crate::table::{normalize, retain_unlisted, Record, ResultTable};
use cache::{CachedStore, ResultsCache};
use datalog::DataLog;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backing storage for one run's rows.
pub trait ResultsStore: Send + Sync + fmt::Debug {
    fn path(&self) -> &Path;
    fn columns(&self) -> &[String];
    fn append(&self, rows: &[Vec<f64>]) -> AppResult<()>;
    fn clear(&self) -> AppResult<()>;
    /// Current rows, including everything appended since the previous call.
    fn data(&self) -> AppResult<ResultTable>;
    /// Discards any in-memory state and re-reads from the backing file.
    fn reload(&self) -> AppResult<ResultTable>;
    /// Swaps every row for the output of `build`, which receives the current
    /// rows. Readers see either the old or the new rows.
    fn replace(&self, build: &mut dyn FnMut(&ResultTable) -> AppResult<Vec<Vec<f64>>>) -> AppResult<usize>;
    fn flush(&self) -> AppResult<()>;
    /// Called once the run writing to this store has ended.
    fn finish(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Shared handle to a run's results. Clones refer to the same store; identity
/// is the backing path.
#[derive(Debug, Clone)]
pub struct Results {
    snapshot: Arc<ProcedureSnapshot>,
    store: Arc<dyn ResultsStore>,
}

impl PartialEq for Results {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl Results {
    pub fn new(snapshot: ProcedureSnapshot, store: Arc<dyn ResultsStore>) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            store,
        }
    }

    /// Results held in `cache` under `key`, starting empty.
    pub fn cached(cache: Arc<ResultsCache>, key: &Path, procedure: &Procedure) -> AppResult<Self> {
        let snapshot = procedure.snapshot();
        let payload = ResultsPayload::new(snapshot.clone(), ResultTable::new(procedure.data_columns()));
        let store = CachedStore::create(cache, key, payload)?;
        Ok(Self::new(snapshot, Arc::new(store)))
    }

    /// Results streamed to a new text data log at `path`.
    pub fn logged(path: &Path, procedure: &Procedure) -> AppResult<Self> {
        let snapshot = procedure.snapshot();
        let store = DataLog::create(path, snapshot.clone(), procedure.data_columns())?;
        Ok(Self::new(snapshot, Arc::new(store)))
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn snapshot(&self) -> &ProcedureSnapshot {
        &self.snapshot
    }

    pub fn columns(&self) -> &[String] {
        self.store.columns()
    }

    pub fn data(&self) -> AppResult<ResultTable> {
        self.store.data()
    }

    pub fn reload(&self) -> AppResult<ResultTable> {
        self.store.reload()
    }

    pub fn flush(&self) -> AppResult<()> {
        self.store.flush()
    }

    pub fn finish(&self) -> AppResult<()> {
        self.store.finish()
    }

    /// Normalizes `record` and appends the resulting rows; returns how many
    /// rows were added.
    pub fn append(&self, record: &Record) -> AppResult<usize> {
        let rows = normalize(self.store.columns(), record)?;
        self.store.append(&rows)?;
        Ok(rows.len())
    }

    /// Replaces the stored rows with `record`. Columns the record does not
    /// name keep their previous samples.
    pub fn replace(&self, record: &Record) -> AppResult<usize> {
        let columns = self.store.columns();
        self.store
            .replace(&mut |current: &ResultTable| normalize(columns, &retain_unlisted(current, record)))
    }

    pub fn to_payload(&self) -> AppResult<ResultsPayload> {
        Ok(ResultsPayload::new((*self.snapshot).clone(), self.store.data()?))
    }
}

/// Opens a saved run from an archive or data log and rebuilds its procedure.
///
/// Archives are served through `cache`; data logs are read directly.
pub fn load(path: &Path, registry: &ProcedureRegistry, cache: Arc<ResultsCache>) -> AppResult<(Procedure, Results)> {
    if !path.exists() {
        return Err(AppError::NotFound(path.display().to_string()));
    }
    if archive::is_archive(path) {
        let store = CachedStore::open(cache, path)?;
        let payload = store.payload()?;
        let procedure = registry.restore(&payload.snapshot)?;
        check_columns(&procedure, payload.table.columns(), path)?;
        return Ok((procedure, Results::new(payload.snapshot, Arc::new(store))));
    }
    if DataLog::is_data_log(path) {
        let log = DataLog::open(path)?;
        let snapshot = log.snapshot().clone();
        let procedure = registry.restore(&snapshot)?;
        check_columns(&procedure, log.columns(), path)?;
        return Ok((procedure, Results::new(snapshot, Arc::new(log))));
    }
    Err(AppError::Format(format!("{} is not a results file", path.display())))
}

fn check_columns(procedure: &Procedure, stored: &[String], path: &Path) -> AppResult<()> {
    if procedure.data_columns() != stored {
        return Err(AppError::Format(format!(
            "{} columns do not match the {} procedure",
            path.display(),
            procedure.class()
        )));
    }
    Ok(())
}

/// Path for a run's working results under `spill_dir`.
pub fn spill_path(spill_dir: &Path, run_id: &str, extension: &str) -> PathBuf {
    spill_dir.join(format!("{run_id}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::{load, Results};
    use crate::archive;
    use crate::context::ExecutionContext;
    use crate::procedure::{Procedure, ProcedureRegistry, ProcedureSchema, Routine};
    use crate::results::cache::ResultsCache;
    use crate::table::Record;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    const STREAMED: usize = 400;

    struct Noop;

    impl Routine for Noop {
        fn execute(&mut self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> ProcedureRegistry {
        let mut registry = ProcedureRegistry::new();
        registry.register("Pulse", || {
            let schema = ProcedureSchema::builder("Pulse")
                .columns(["t", "phase", "frequency"])
                .build()?;
            Procedure::new(schema, Noop)
        });
        registry
    }

    #[test]
    fn replace_keeps_columns_not_named() {
        let dir = tempfile::tempdir().expect("tempdir");
        let procedure = registry().create("Pulse").expect("procedure");
        let results = Results::logged(&dir.path().join("pulse.csv"), &procedure).expect("results");
        results
            .append(&Record::new().with("t", vec![0.0, 1.0]).with("frequency", vec![5.0, 6.0]))
            .expect("append");
        let rows = results.replace(&Record::new().with("phase", vec![0.1, 0.2])).expect("replace");
        assert_eq!(rows, 2);
        let table = results.data().expect("data");
        assert_eq!(table.column("t").expect("t"), &[0.0, 1.0]);
        assert_eq!(table.column("phase").expect("phase"), &[0.1, 0.2]);
    }

    #[test]
    fn load_rebuilds_procedure_from_either_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let cache = Arc::new(ResultsCache::new(4));
        let procedure = registry.create("Pulse").expect("procedure");

        let log_path = dir.path().join("pulse.csv");
        let logged = Results::logged(&log_path, &procedure).expect("logged");
        logged.append(&Record::new().with("t", 1.0)).expect("append");
        let (restored, results) = load(&log_path, &registry, cache.clone()).expect("load log");
        assert_eq!(restored.class(), "Pulse");
        assert_eq!(results.data().expect("data").len(), 1);

        let archive_path = dir.path().join("pulse.swq");
        archive::write(&archive_path, &logged.to_payload().expect("payload")).expect("write");
        let (_, results) = load(&archive_path, &registry, cache).expect("load archive");
        assert_eq!(results.data().expect("data"), logged.data().expect("data"));

        assert!(load(&dir.path().join("missing.swq"), &registry, Arc::new(ResultsCache::new(1))).is_err());
    }

    fn backings(dir: &std::path::Path) -> Vec<Results> {
        let procedure = registry().create("Pulse").expect("procedure");
        vec![
            Results::cached(Arc::new(ResultsCache::new(2)), &dir.join("pulse.swq"), &procedure).expect("cached"),
            Results::logged(&dir.join("pulse.csv"), &procedure).expect("logged"),
        ]
    }

    #[test]
    fn reader_sees_growing_prefixes_while_writer_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        for results in backings(dir.path()) {
            let done = Arc::new(AtomicBool::new(false));
            let writer = {
                let results = results.clone();
                let done = done.clone();
                thread::spawn(move || {
                    for i in 0..STREAMED {
                        results.append(&Record::new().with("t", i as f64)).expect("append");
                    }
                    done.store(true, Ordering::SeqCst);
                })
            };

            let mut observed = 0;
            while !done.load(Ordering::SeqCst) {
                let table = results.data().expect("data");
                let t = table.column("t").expect("t");
                assert!(t.len() >= observed, "{} shrank", results.path().display());
                assert!(t.iter().enumerate().all(|(i, v)| *v == i as f64), "not a prefix");
                observed = t.len();
            }
            writer.join().expect("writer thread");

            let table = results.data().expect("final data");
            assert_eq!(table.len(), STREAMED, "{}", results.path().display());
            assert!(table.column("t").expect("t").iter().enumerate().all(|(i, v)| *v == i as f64));
        }
    }

    #[test]
    fn readers_never_see_a_half_finished_replace() {
        let dir = tempfile::tempdir().expect("tempdir");
        for results in backings(dir.path()) {
            results.append(&Record::new().with("t", vec![0.0, 1.0])).expect("seed");
            let done = Arc::new(AtomicBool::new(false));
            let writer = {
                let results = results.clone();
                let done = done.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let phase = i as f64;
                        results.replace(&Record::new().with("phase", vec![phase, phase])).expect("replace");
                    }
                    done.store(true, Ordering::SeqCst);
                })
            };

            while !done.load(Ordering::SeqCst) {
                let table = results.data().expect("data");
                assert_eq!(table.len(), 2, "{}", results.path().display());
                assert_eq!(table.column("t").expect("t"), &[0.0, 1.0]);
            }
            writer.join().expect("writer thread");
            assert_eq!(results.data().expect("data").column("phase").expect("phase"), &[99.0, 99.0]);
        }
    }
}
