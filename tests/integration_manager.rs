use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sweep_queue::archive;
use sweep_queue::demo::{self, SimulatedDaq, SWEEP_COLUMNS};
use sweep_queue::sweep::{queue_sweep_at, FrequencyChannel, SweepAxis, SweepConfig, SweepPlan};
use sweep_queue::{
    Daq, Manager, ParameterValue, Procedure, ResultsBacking, RunStatus, RunnerSettings, StreamEnvelope,
    DIRECTORY_PARAMETER,
};
use tokio::sync::broadcast;

const IDLE: Duration = Duration::from_secs(30);

fn settings(root: &Path) -> RunnerSettings {
    RunnerSettings::for_state_dir(&root.join("state"))
}

fn sweep(directory: &Path, n_points: i64, wait_ms: i64) -> Procedure {
    let mut procedure = demo::sweep_procedure().expect("sweep procedure");
    let mut values = BTreeMap::new();
    values.insert(DIRECTORY_PARAMETER.to_string(), ParameterValue::Path(directory.to_path_buf()));
    values.insert("n_points".to_string(), ParameterValue::Integer(n_points));
    values.insert("wait_ms".to_string(), ParameterValue::Integer(wait_ms));
    values.insert("take_noise".to_string(), ParameterValue::Boolean(false));
    procedure.set_parameters(&values).expect("set parameters");
    procedure
}

fn attenuation_plan(directory: &Path) -> SweepPlan {
    let mut base = BTreeMap::new();
    base.insert("n_points".to_string(), ParameterValue::Integer(20));
    base.insert("wait_ms".to_string(), ParameterValue::Integer(0));
    base.insert("take_noise".to_string(), ParameterValue::Boolean(false));
    SweepPlan {
        directory: directory.to_path_buf(),
        channels: vec![
            FrequencyChannel::new("frequency1", vec![4.0]),
            FrequencyChannel::new("span1", vec![2.0]),
            FrequencyChannel::new("frequency2", vec![6.0]),
            FrequencyChannel::new("span2", vec![2.0]),
        ],
        axes: vec![
            SweepAxis::new("attenuation", 70.0, 60.0, 2),
            SweepAxis::new("field", 0.0, 0.0, 1),
            SweepAxis::new("temperature", 100.0, 100.0, 1),
        ],
        base,
    }
}

fn archives_in(directory: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(directory)
        .expect("read dir")
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == archive::ARCHIVE_EXTENSION))
        .collect();
    paths.sort();
    paths
}

async fn wait_for_event(events: &mut broadcast::Receiver<StreamEnvelope>, run_id: &str, event_type: &str) {
    let found = tokio::time::timeout(IDLE, async {
        loop {
            match events.recv().await {
                Ok(envelope) if envelope.run_id == run_id && envelope.r#type == event_type => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    assert!(found.is_ok(), "timed out waiting for {event_type} on {run_id}");
}

#[tokio::test]
async fn attenuation_sweep_saves_one_archive_per_point() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    let manager = Manager::new(settings(root.path()), demo::registry(), None).expect("manager");
    let plan = attenuation_plan(&data);

    let queued = queue_sweep_at(&manager, &plan, demo::sweep_procedure, "240101_120000")
        .await
        .expect("queue sweep");
    assert_eq!(queued.run_ids.len(), 2);
    assert!(queued.skipped.is_empty());
    manager.wait_until_idle(IDLE).await.expect("idle");

    let archives = archives_in(&data);
    assert_eq!(
        archives.iter().map(|p| p.file_name().expect("name").to_string_lossy().into_owned()).collect::<Vec<_>>(),
        vec!["sweep_0_0_0_0_240101_120000.swq", "sweep_0_0_1_0_240101_120000.swq"]
    );
    for path in &archives {
        let payload = archive::read(path).expect("read archive");
        let columns: Vec<&str> = payload.table.columns().iter().map(String::as_str).collect();
        assert_eq!(columns, SWEEP_COLUMNS.to_vec());
        assert_eq!(payload.table.len(), 20);
        assert!(payload.table.column("I1").expect("I1").iter().all(|v| v.is_finite()));
        assert!(payload.table.column("bias I1").expect("bias I1").iter().all(|v| v.is_nan()));
        assert!(payload.table.column("frequency").expect("frequency").iter().all(|v| v.is_nan()));
    }
    let attenuations: Vec<f64> = archives
        .iter()
        .map(|path| {
            archive::read(path).expect("read").snapshot.parameters["attenuation"]
                .as_f64()
                .expect("attenuation")
        })
        .collect();
    assert_eq!(attenuations, vec![70.0, 60.0]);

    let config = SweepConfig::load(&queued.config_path).expect("sweep config");
    assert_eq!(config.parameters.len(), 2);

    let again = queue_sweep_at(&manager, &plan, demo::sweep_procedure, "240101_120000")
        .await
        .expect("queue again");
    assert!(again.run_ids.is_empty());
    assert_eq!(again.skipped.len(), 2);
}

#[tokio::test]
async fn abort_then_resume_runs_the_next_experiment_without_duplicating_rows() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let manager = Manager::new(settings(root.path()), demo::registry(), None).expect("manager");
    let mut events = manager.subscribe();

    let long = sweep(&data, 10_000, 2);
    long.file_name("sweep", &[0], Some("long"));
    let short = sweep(&data, 15, 0);
    short.file_name("sweep", &[1], Some("short"));
    let first = manager.queue(long).await.expect("queue long");
    let second = manager.queue(short).await.expect("queue short");

    wait_for_event(&mut events, &first, "results").await;
    manager.abort().await.expect("abort");
    manager.wait_until_idle(IDLE).await.expect("idle after abort");

    let aborted = manager.experiment(&first).await.expect("first");
    assert_eq!(aborted.status, RunStatus::Aborted);
    assert!(aborted.stop_requested);
    assert_eq!(manager.experiment(&second).await.expect("second").status, RunStatus::Queued);
    let first_rows = manager.results(&first).await.expect("results").data().expect("data").len();
    assert!(first_rows > 0 && first_rows < 10_000);

    assert_eq!(manager.resume().await.expect("resume"), Some(second.clone()));
    manager.wait_until_idle(IDLE).await.expect("idle after resume");
    assert_eq!(manager.experiment(&second).await.expect("second").status, RunStatus::Finished);
    assert_eq!(manager.results(&second).await.expect("results").data().expect("data").len(), 15);
    assert_eq!(
        manager.results(&first).await.expect("results").data().expect("data").len(),
        first_rows
    );
}

#[tokio::test]
async fn runs_complete_in_queue_order() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let manager = Manager::new(settings(root.path()), demo::registry(), None).expect("manager");
    let mut events = manager.subscribe();

    let mut queued = Vec::new();
    for index in 0..3 {
        let procedure = sweep(&data, 5, 1);
        procedure.file_name("sweep", &[index], Some("fifo"));
        queued.push(manager.queue(procedure).await.expect("queue"));
    }
    manager.wait_until_idle(IDLE).await.expect("idle");

    let mut finished = Vec::new();
    let mut running_at_once = 0_i32;
    let mut max_running = 0_i32;
    while let Ok(envelope) = events.try_recv() {
        match envelope.r#type.as_str() {
            "running" => {
                running_at_once += 1;
                max_running = max_running.max(running_at_once);
            }
            "finished" => {
                running_at_once -= 1;
                finished.push(envelope.run_id);
            }
            _ => {}
        }
    }
    assert_eq!(finished, queued);
    assert_eq!(max_running, 1);
}

#[tokio::test]
async fn evicted_results_stay_readable_through_the_manager() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let mut settings = settings(root.path());
    settings.cache_capacity = 2;
    let manager = Manager::new(settings, demo::registry(), None).expect("manager");

    let mut run_ids = Vec::new();
    for index in 0..5 {
        let procedure = sweep(&data, 7, 0);
        procedure.file_name("sweep", &[index], Some("evict"));
        run_ids.push(manager.queue(procedure).await.expect("queue"));
    }
    manager.wait_until_idle(IDLE).await.expect("idle");

    assert!(manager.cache().resident_len().expect("resident") <= 2);
    for run_id in &run_ids {
        let results = manager.results(run_id).await.expect("results");
        let table = results.data().expect("data");
        assert_eq!(table.len(), 7, "run {run_id}");
        assert_eq!(table.columns().len(), SWEEP_COLUMNS.len());
    }
}

#[tokio::test]
async fn saved_archives_load_back_as_finished_runs() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let manager = Manager::new(settings(root.path()), demo::registry(), None).expect("manager");
    let procedure = sweep(&data, 9, 0);
    procedure.file_name("sweep", &[0], Some("load"));
    let run_id = manager.queue(procedure).await.expect("queue");
    manager.wait_until_idle(IDLE).await.expect("idle");
    let path = manager
        .experiment(&run_id)
        .await
        .and_then(|e| e.output_path)
        .expect("output path");

    let other = Manager::new(settings(root.path()), demo::registry(), None).expect("second manager");
    let loaded = other.load(&path).await.expect("load").expect("new run");
    let summary = other.experiment(&loaded).await.expect("loaded run");
    assert_eq!(summary.status, RunStatus::Finished);
    assert_eq!(summary.class, demo::SWEEP_CLASS);
    let table = other.results(&loaded).await.expect("results").data().expect("data");
    assert_eq!(table, archive::read(&path).expect("archive").table);
    assert_eq!(other.load(&path).await.expect("duplicate load"), None);
}

#[tokio::test]
async fn data_log_backing_streams_rows_to_csv() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let mut settings = settings(root.path());
    settings.results_backing = ResultsBacking::DataLog;
    let manager = Manager::new(settings, demo::registry(), None).expect("manager");
    let procedure = sweep(&data, 6, 0);
    procedure.file_name("sweep", &[0], Some("log"));
    let run_id = manager.queue(procedure).await.expect("queue");
    manager.wait_until_idle(IDLE).await.expect("idle");

    let results = manager.results(&run_id).await.expect("results");
    assert_eq!(results.path().extension().and_then(|e| e.to_str()), Some("csv"));
    assert_eq!(results.data().expect("data").len(), 6);
    assert_eq!(results.reload().expect("reload").len(), 6);
}

#[tokio::test]
async fn ledger_records_status_and_ordered_events() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("data");
    let daq = Arc::new(SimulatedDaq::default());
    let manager =
        Manager::new(settings(root.path()), demo::registry(), Some(daq.clone() as Arc<dyn Daq>)).expect("manager");
    let procedure = sweep(&data, 4, 0);
    procedure.file_name("sweep", &[0], Some("ledger"));
    let run_id = manager.queue(procedure).await.expect("queue");
    manager.wait_until_idle(IDLE).await.expect("idle");

    let ledger = manager.ledger().expect("ledger enabled");
    let run = ledger.get_run(&run_id).expect("get run").expect("run recorded");
    assert_eq!(run.status, RunStatus::Finished);
    let events = ledger.list_events(&run_id).expect("events");
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"queued"));
    assert_eq!(types.last(), Some(&"finished"));
    assert!(types.contains(&"saved"));
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));

    let saved = archive::read(&data.join("sweep_0_ledger.swq")).expect("archive");
    assert_eq!(saved.metadata["daq"], "simulated");

    manager.shutdown(IDLE).await.expect("shutdown");
    assert!(daq.is_closed());
}
