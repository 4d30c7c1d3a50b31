use crate::config::{ResultsBacking, RunnerSettings};
use crate::context::Daq;
use crate::db::{Database, NewRun};
use crate::errors::{AppError, AppResult};
use crate::models::{ExperimentSummary, RunStatus, StreamEnvelope};
use crate::procedure::{Procedure, ProcedureRegistry};
use crate::results::cache::ResultsCache;
use crate::results::{self, spill_path, Results};
use crate::worker::{StopHandle, Worker, WorkerEvent};
use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

type MonitorFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Experiment {
    summary: ExperimentSummary,
    procedure: Option<Procedure>,
    results: Results,
    source: Option<PathBuf>,
}

struct ActiveRun {
    run_id: String,
    stop: StopHandle,
}

struct QueueState {
    experiments: Vec<Experiment>,
    queue: VecDeque<String>,
    running: Option<ActiveRun>,
    continuous: bool,
    start_on_add: bool,
    /// Set while a `next()` is owed: between a finished run and the follow-up
    /// dequeue, or between a queue and its auto-start.
    advancing: bool,
}

impl QueueState {
    fn experiment_mut(&mut self, run_id: &str) -> Option<&mut Experiment> {
        self.experiments.iter_mut().find(|e| e.summary.run_id == run_id)
    }
}

/// Owns the experiment queue and runs at most one procedure at a time.
#[derive(Clone)]
pub struct Manager {
    state: Arc<Mutex<QueueState>>,
    running_tx: Arc<watch::Sender<Option<String>>>,
    events: broadcast::Sender<StreamEnvelope>,
    cache: Arc<ResultsCache>,
    registry: Arc<ProcedureRegistry>,
    daq: Option<Arc<dyn Daq>>,
    ledger: Option<Arc<Database>>,
    settings: Arc<RunnerSettings>,
    local_seq: Arc<AtomicI64>,
}

impl Manager {
    pub fn new(settings: RunnerSettings, registry: ProcedureRegistry, daq: Option<Arc<dyn Daq>>) -> AppResult<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.spill_dir)?;
        let ledger = if settings.ledger {
            let db = Database::new(&settings.ledger_path())?;
            let orphaned = db.mark_orphan_runs_failed()?;
            if orphaned > 0 {
                tracing::warn!(count = orphaned, "marked runs from a previous session as failed");
            }
            Some(Arc::new(db))
        } else {
            None
        };
        let (events, _) = broadcast::channel(settings.event_capacity);
        let (running_tx, _) = watch::channel(None);

        Ok(Self {
            state: Arc::new(Mutex::new(QueueState {
                experiments: Vec::new(),
                queue: VecDeque::new(),
                running: None,
                continuous: settings.continuous,
                start_on_add: true,
                advancing: false,
            })),
            running_tx: Arc::new(running_tx),
            events,
            cache: Arc::new(ResultsCache::new(settings.cache_capacity)),
            registry: Arc::new(registry),
            daq,
            ledger,
            settings: Arc::new(settings),
            local_seq: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEnvelope> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<ResultsCache> {
        &self.cache
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Option<&Arc<Database>> {
        self.ledger.as_ref()
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Adds `procedure` to the end of the queue and returns its run id.
    ///
    /// Starts it straight away when nothing is running and the queue is not
    /// paused.
    pub async fn queue(&self, procedure: Procedure) -> AppResult<String> {
        procedure.parameters().validate()?;
        if procedure.cached_file_name().is_none() {
            procedure.file_name(&procedure.class().to_lowercase(), &[], None);
        }

        let run_id = Uuid::new_v4().to_string();
        let results = self.create_results(&run_id, &procedure)?;
        let summary = ExperimentSummary {
            run_id: run_id.clone(),
            class: procedure.class().to_string(),
            status: RunStatus::Queued,
            file_name: procedure.cached_file_name().map(ToString::to_string),
            results_path: results.path().to_path_buf(),
            output_path: procedure.output_path(),
            parameters: procedure.parameter_values(),
            progress: 0.0,
            status_message: None,
            error_summary: None,
            stop_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.record_run(&summary)?;

        let (position, should_start) = {
            let mut state = self.state.lock().await;
            state.experiments.push(Experiment {
                summary: summary.clone(),
                procedure: Some(procedure),
                results,
                source: None,
            });
            state.queue.push_back(run_id.clone());
            let should_start = state.start_on_add && state.running.is_none() && !state.advancing;
            if should_start {
                state.advancing = true;
            }
            (state.queue.len(), should_start)
        };

        tracing::info!(run_id = %run_id, class = %summary.class, position, "queued experiment");
        self.emit_event(
            &run_id,
            "queued",
            json!({
                "class": summary.class,
                "fileName": summary.file_name,
                "outputPath": summary.output_path,
                "position": position,
            }),
        );

        if should_start {
            self.advance().await;
        }
        Ok(run_id)
    }

    fn create_results(&self, run_id: &str, procedure: &Procedure) -> AppResult<Results> {
        match self.settings.results_backing {
            ResultsBacking::Cache => Results::cached(
                self.cache.clone(),
                &spill_path(&self.settings.spill_dir, run_id, crate::archive::ARCHIVE_EXTENSION),
                procedure,
            ),
            ResultsBacking::DataLog => Results::logged(
                &spill_path(&self.settings.spill_dir, run_id, results::datalog::DATA_LOG_EXTENSION),
                procedure,
            ),
        }
    }

    /// Starts the run at the head of the queue.
    ///
    /// Fails when a run is already running; returns `Ok(None)` when the queue
    /// is empty.
    pub async fn next(&self) -> AppResult<Option<String>> {
        let mut state = self.state.lock().await;
        state.advancing = false;
        // Wake idle waiters even if nothing ends up starting.
        self.running_tx.send_modify(|_| {});
        if let Some(active) = &state.running {
            return Err(AppError::Scheduler(format!("run {} is already running", active.run_id)));
        }

        let Some(run_id) = state.queue.pop_front() else {
            return Ok(None);
        };
        let experiment = state
            .experiment_mut(&run_id)
            .ok_or_else(|| AppError::Internal(format!("queued run {run_id} has no experiment")))?;
        let procedure = experiment
            .procedure
            .take()
            .ok_or_else(|| AppError::Internal(format!("queued run {run_id} has no procedure")))?;
        experiment.summary.status = RunStatus::Running;
        experiment.summary.started_at = Some(Utc::now());
        experiment.summary.progress = 0.0;

        let (worker, events) = Worker::new(&run_id, procedure, experiment.results.clone(), self.daq.clone());
        state.running = Some(ActiveRun {
            run_id: run_id.clone(),
            stop: worker.stop_handle(),
        });
        self.running_tx.send_replace(Some(run_id.clone()));
        drop(state);

        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.update_run_status(&run_id, RunStatus::Running, None) {
                tracing::warn!(run_id = %run_id, error = %err, "failed to record running status");
            }
        }
        tracing::info!(run_id = %run_id, "starting worker");
        let handle = worker.start();
        tokio::spawn(self.clone().monitor(run_id.clone(), events, handle));
        Ok(Some(run_id))
    }

    async fn advance(&self) {
        match self.next().await {
            Ok(Some(run_id)) => tracing::debug!(run_id = %run_id, "advanced queue"),
            Ok(None) => tracing::debug!("queue is empty"),
            Err(AppError::Scheduler(message)) => tracing::debug!(reason = %message, "skipped advance"),
            Err(err) => tracing::error!(error = %err, "failed to start next run"),
        }
    }

    fn monitor(self, run_id: String, mut events: UnboundedReceiver<WorkerEvent>, handle: JoinHandle<Procedure>) -> MonitorFuture {
        Box::pin(async move {
            let mut terminal = None;
            while let Some(event) = events.recv().await {
                if event.is_terminal() {
                    terminal = Some(event);
                } else {
                    self.forward(&run_id, event).await;
                }
            }

            let procedure = match handle.await {
                Ok(procedure) => Some(procedure),
                Err(err) => {
                    tracing::error!(run_id = %run_id, error = %err, "worker thread did not return");
                    None
                }
            };
            let outcome = terminal.unwrap_or_else(|| WorkerEvent::Failed {
                message: "worker exited without reporting an outcome".to_string(),
            });
            self.complete(&run_id, outcome, procedure).await;
        })
    }

    async fn forward(&self, run_id: &str, event: WorkerEvent) {
        let (event_type, payload) = match event {
            WorkerEvent::Running => ("running", json!({})),
            WorkerEvent::Progress(progress) => {
                if let Some(experiment) = self.state.lock().await.experiment_mut(run_id) {
                    experiment.summary.progress = progress;
                }
                ("progress", json!({ "progress": progress }))
            }
            WorkerEvent::Status(message) => {
                if let Some(experiment) = self.state.lock().await.experiment_mut(run_id) {
                    experiment.summary.status_message = Some(message.clone());
                }
                ("status", json!({ "message": message }))
            }
            WorkerEvent::Log { level, message } => ("log", json!({ "level": level, "message": message })),
            WorkerEvent::Indicator { name, value, display } => (
                "indicator",
                json!({ "name": name, "value": value, "display": display }),
            ),
            WorkerEvent::Results { appended, cleared } => {
                ("results", json!({ "appended": appended, "cleared": cleared }))
            }
            WorkerEvent::Saved { path } => ("saved", json!({ "path": path })),
            WorkerEvent::Message { topic, payload } => ("message", json!({ "topic": topic, "payload": payload })),
            WorkerEvent::Finished | WorkerEvent::AbortReturned | WorkerEvent::Failed { .. } => return,
        };
        self.emit_event(run_id, event_type, payload);
    }

    async fn complete(&self, run_id: &str, outcome: WorkerEvent, procedure: Option<Procedure>) {
        let (status, event_type, error) = match outcome {
            WorkerEvent::Finished => (RunStatus::Finished, "finished", None),
            WorkerEvent::AbortReturned => (RunStatus::Aborted, "abort_returned", None),
            WorkerEvent::Failed { message } => (RunStatus::Failed, "failed", Some(message)),
            other => (RunStatus::Failed, "failed", Some(format!("unexpected final event {other:?}"))),
        };

        let advance = {
            let mut state = self.state.lock().await;
            let mut output_path = None;
            let mut working = None;
            if let Some(experiment) = state.experiment_mut(run_id) {
                experiment.summary.status = status;
                experiment.summary.ended_at = Some(Utc::now());
                experiment.summary.error_summary = error.clone();
                if status == RunStatus::Finished {
                    experiment.summary.progress = 100.0;
                }
                if procedure.is_some() {
                    experiment.procedure = procedure;
                }
                output_path = experiment.summary.output_path.clone();
                working = Some(experiment.results.path().to_path_buf());
            }
            if let (Some(working), Some(output)) = (&working, &output_path) {
                if status == RunStatus::Finished && output.exists() {
                    self.release_spill(run_id, working);
                }
            }

            // Terminal event goes out before the slot frees so idle waiters see it.
            if let Some(ledger) = &self.ledger {
                if let Err(err) = ledger.update_run_status(run_id, status, error.as_deref()) {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to record final status");
                }
            }
            match &error {
                Some(message) => tracing::error!(run_id = %run_id, error = %message, "run failed"),
                None => tracing::info!(run_id = %run_id, status = status.as_str(), "run completed"),
            }
            self.emit_event(
                run_id,
                event_type,
                json!({ "status": status, "outputPath": output_path, "error": error }),
            );

            state.running = None;
            let advance = status == RunStatus::Finished && state.continuous && !state.queue.is_empty();
            state.advancing = advance;
            self.running_tx.send_replace(None);
            advance
        };

        if advance {
            self.advance().await;
        }
    }

    /// Requests the running procedure to stop and pauses the queue.
    pub async fn abort(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.continuous = false;
        state.start_on_add = false;
        state.advancing = false;
        self.running_tx.send_modify(|_| {});
        let Some(active) = &state.running else {
            tracing::info!("abort requested with nothing running; queue paused");
            return Ok(());
        };
        let run_id = active.run_id.clone();
        active.stop.stop();
        if let Some(experiment) = state.experiment_mut(&run_id) {
            experiment.summary.stop_requested = true;
        }
        tracing::warn!(run_id = %run_id, "abort requested");
        Ok(())
    }

    /// Marks every queued run aborted, then aborts the running one.
    pub async fn abort_all(&self) -> AppResult<Vec<String>> {
        let aborted: Vec<String> = {
            let mut state = self.state.lock().await;
            let drained: Vec<String> = state.queue.drain(..).collect();
            let now = Utc::now();
            for run_id in &drained {
                if let Some(experiment) = state.experiment_mut(run_id) {
                    experiment.summary.status = RunStatus::Aborted;
                    experiment.summary.ended_at = Some(now);
                }
            }
            drained
        };

        for run_id in &aborted {
            if let Some(ledger) = &self.ledger {
                if let Err(err) = ledger.update_run_status(run_id, RunStatus::Aborted, None) {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to record aborted status");
                }
            }
            self.emit_event(run_id, "abort_returned", json!({ "status": RunStatus::Aborted, "queued": true }));
        }
        self.abort().await?;
        Ok(aborted)
    }

    /// Re-arms continuous mode and starts the next run if idle.
    pub async fn resume(&self) -> AppResult<Option<String>> {
        let should_start = {
            let mut state = self.state.lock().await;
            state.continuous = true;
            state.start_on_add = true;
            state.running.is_none() && !state.queue.is_empty()
        };
        if should_start {
            self.next().await
        } else {
            Ok(None)
        }
    }

    /// Drops a queued or completed experiment, its working results file and
    /// its ledger entry. Running experiments cannot be removed.
    pub async fn remove(&self, run_id: &str) -> AppResult<()> {
        let experiment = {
            let mut state = self.state.lock().await;
            if state.running.as_ref().is_some_and(|active| active.run_id == run_id) {
                return Err(AppError::Scheduler(format!("run {run_id} is running and cannot be removed")));
            }
            let index = state
                .experiments
                .iter()
                .position(|e| e.summary.run_id == run_id)
                .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))?;
            state.queue.retain(|queued| queued != run_id);
            state.experiments.remove(index)
        };

        let working = experiment.results.path();
        let dropped = if experiment.source.is_some() {
            // Loaded runs are backed by the user's file; only forget it.
            self.cache.remove(working).map(|_| ())
        } else {
            match self.settings.results_backing {
                ResultsBacking::Cache => self.cache.purge(working).map(|_| ()),
                ResultsBacking::DataLog => remove_file_if_present(working),
            }
        };
        if let Err(err) = dropped {
            tracing::warn!(run_id = %run_id, path = %working.display(), error = %err, "failed to drop working results");
        }

        tracing::info!(run_id = %run_id, "removed experiment");
        self.emit_event(run_id, "removed", json!({ "status": experiment.summary.status }));
        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.delete_run(run_id) {
                tracing::warn!(run_id = %run_id, error = %err, "failed to delete run from ledger");
            }
        }
        Ok(())
    }

    /// The output archive now holds a finished run's rows, so its spilled
    /// copy is redundant while the entry stays resident.
    fn release_spill(&self, run_id: &str, working: &Path) {
        if self.settings.results_backing != ResultsBacking::Cache {
            return;
        }
        match self.cache.release_backing(working) {
            Ok(true) => tracing::debug!(run_id = %run_id, "released spilled results"),
            Ok(false) => {}
            Err(err) => tracing::warn!(run_id = %run_id, error = %err, "failed to release spilled results"),
        }
    }

    /// Registers a previously saved run as a finished experiment.
    ///
    /// Returns `Ok(None)` when the file is already loaded.
    pub async fn load(&self, path: &Path) -> AppResult<Option<String>> {
        {
            let state = self.state.lock().await;
            if state
                .experiments
                .iter()
                .any(|e| e.source.as_deref() == Some(path) || e.results.path() == path)
            {
                tracing::warn!(path = %path.display(), "results already loaded, skipping");
                return Ok(None);
            }
        }

        let (procedure, results) = results::load(path, &self.registry, self.cache.clone())?;
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let summary = ExperimentSummary {
            run_id: run_id.clone(),
            class: procedure.class().to_string(),
            status: RunStatus::Finished,
            file_name: path.file_name().map(|name| name.to_string_lossy().into_owned()),
            results_path: results.path().to_path_buf(),
            output_path: Some(path.to_path_buf()),
            parameters: procedure.parameter_values(),
            progress: 100.0,
            status_message: None,
            error_summary: None,
            stop_requested: false,
            queued_at: now,
            started_at: None,
            ended_at: Some(now),
        };
        self.record_run(&summary)?;
        self.state.lock().await.experiments.push(Experiment {
            summary,
            procedure: Some(procedure),
            results,
            source: Some(path.to_path_buf()),
        });

        tracing::info!(run_id = %run_id, path = %path.display(), "loaded results");
        self.emit_event(&run_id, "loaded", json!({ "path": path }));
        Ok(Some(run_id))
    }

    pub async fn experiments(&self) -> Vec<ExperimentSummary> {
        let state = self.state.lock().await;
        state.experiments.iter().map(|e| e.summary.clone()).collect()
    }

    pub async fn experiment(&self, run_id: &str) -> Option<ExperimentSummary> {
        let state = self.state.lock().await;
        state
            .experiments
            .iter()
            .find(|e| e.summary.run_id == run_id)
            .map(|e| e.summary.clone())
    }

    pub async fn results(&self, run_id: &str) -> Option<Results> {
        let state = self.state.lock().await;
        state
            .experiments
            .iter()
            .find(|e| e.summary.run_id == run_id)
            .map(|e| e.results.clone())
    }

    pub async fn queued_run_ids(&self) -> Vec<String> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn running_run_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.running.as_ref().map(|active| active.run_id.clone())
    }

    pub async fn is_continuous(&self) -> bool {
        self.state.lock().await.continuous
    }

    /// True when an experiment with `path` as its output is already known.
    pub async fn is_output_known(&self, path: &Path) -> bool {
        let state = self.state.lock().await;
        state
            .experiments
            .iter()
            .any(|e| e.summary.output_path.as_deref() == Some(path))
    }

    /// Waits until nothing is running and no follow-up run is about to start.
    pub async fn wait_until_idle(&self, timeout: Duration) -> AppResult<()> {
        let mut running = self.running_tx.subscribe();
        let settle = async {
            loop {
                running
                    .wait_for(Option::is_none)
                    .await
                    .map_err(|_| AppError::Internal("run watch closed".to_string()))?;
                {
                    let state = self.state.lock().await;
                    if state.running.is_none() && !state.advancing {
                        return Ok(());
                    }
                    if state.running.is_some() {
                        continue;
                    }
                }
                running
                    .changed()
                    .await
                    .map_err(|_| AppError::Internal("run watch closed".to_string()))?;
            }
        };
        tokio::time::timeout(timeout, settle)
            .await
            .map_err(|_| AppError::Scheduler(format!("queue still busy after {timeout:?}")))?
    }

    /// Aborts everything, waits for the running procedure, writes cached
    /// results to disk and releases the DAQ.
    pub async fn shutdown(&self, timeout: Duration) -> AppResult<()> {
        self.abort_all().await?;
        let settled = self.wait_until_idle(timeout).await;
        if let Err(err) = self.cache.flush_all() {
            tracing::error!(error = %err, "failed to flush cached results");
        }
        if let Some(daq) = &self.daq {
            daq.close().map_err(AppError::from)?;
            tracing::info!("closed DAQ");
        }
        settled
    }

    /// Stores `procedure`'s current parameter values as its class defaults.
    pub fn save_defaults(&self, procedure: &Procedure) -> AppResult<()> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| AppError::InvalidInput("defaults need the run ledger enabled".to_string()))?;
        ledger.save_defaults(procedure.class(), &procedure.parameter_values())
    }

    /// Applies saved defaults for `procedure`'s class; returns how many were applied.
    pub fn apply_defaults(&self, procedure: &mut Procedure) -> AppResult<usize> {
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };
        match ledger.load_defaults(procedure.class())? {
            Some(values) => procedure.parameters_mut().apply_known(&values),
            None => Ok(0),
        }
    }

    fn record_run(&self, summary: &ExperimentSummary) -> AppResult<()> {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        ledger.insert_run(&NewRun {
            run_id: &summary.run_id,
            class: &summary.class,
            file_name: summary.file_name.as_deref(),
            results_path: &summary.results_path,
            output_path: summary.output_path.as_deref(),
            parameters: &summary.parameters,
            status: summary.status,
        })?;
        Ok(())
    }

    fn emit_event(&self, run_id: &str, event_type: &str, payload: serde_json::Value) {
        let recorded = self.ledger.as_ref().and_then(|ledger| {
            ledger
                .insert_event(run_id, event_type, &payload)
                .map_err(|err| {
                    tracing::warn!(run_id = %run_id, event_type, error = %err, "failed to record event");
                })
                .ok()
        });
        let envelope = match recorded {
            Some(event) => StreamEnvelope {
                run_id: run_id.to_string(),
                r#type: event_type.to_string(),
                payload,
                timestamp: event.created_at,
                event_id: event.id,
                seq: event.seq,
            },
            None => StreamEnvelope {
                run_id: run_id.to_string(),
                r#type: event_type.to_string(),
                payload,
                timestamp: Utc::now(),
                event_id: Uuid::new_v4().to_string(),
                seq: self.local_seq.fetch_add(1, Ordering::SeqCst) + 1,
            },
        };
        let _ = self.events.send(envelope);
    }
}

fn remove_file_if_present(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::Manager;
    use crate::config::RunnerSettings;
    use crate::context::ExecutionContext;
    use crate::errors::AppError;
    use crate::models::RunStatus;
    use crate::parameters::Parameter;
    use crate::procedure::{Procedure, ProcedureRegistry, ProcedureSchema, Routine};
    use crate::table::Record;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    struct Held {
        release: Arc<AtomicBool>,
        fail: bool,
    }

    impl Routine for Held {
        fn execute(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            ctx.emit_results(&Record::new().with("x", 1.0))?;
            while !self.release.load(Ordering::SeqCst) && !ctx.should_stop() {
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
            if self.fail {
                anyhow::bail!("amplifier tripped");
            }
            Ok(())
        }
    }

    fn held_with(release: &Arc<AtomicBool>, fail: bool) -> Procedure {
        let schema = ProcedureSchema::builder("Held")
            .column("x")
            .parameter(Parameter::integer("n", "N").default_value(1_i64))
            .build()
            .expect("schema");
        Procedure::new(
            schema,
            Held {
                release: release.clone(),
                fail,
            },
        )
        .expect("procedure")
    }

    fn held(release: &Arc<AtomicBool>) -> Procedure {
        held_with(release, false)
    }

    fn manager(dir: &std::path::Path) -> Manager {
        Manager::new(RunnerSettings::for_state_dir(dir), ProcedureRegistry::new(), None).expect("manager")
    }

    fn spilled_files(manager: &Manager) -> usize {
        std::fs::read_dir(&manager.settings().spill_dir)
            .expect("spill dir")
            .filter_map(Result::ok)
            .count()
    }

    #[tokio::test]
    async fn next_while_running_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let release = Arc::new(AtomicBool::new(false));
        let first = manager.queue(held(&release)).await.expect("queue first");
        manager.queue(held(&release)).await.expect("queue second");

        assert_eq!(manager.running_run_id().await, Some(first.clone()));
        let err = manager.next().await.expect_err("already running");
        assert!(matches!(err, AppError::Scheduler(_)));
        let err = manager.remove(&first).await.expect_err("running");
        assert!(matches!(err, AppError::Scheduler(_)));

        release.store(true, Ordering::SeqCst);
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        let statuses: Vec<RunStatus> = manager.experiments().await.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![RunStatus::Finished, RunStatus::Finished]);
    }

    #[tokio::test]
    async fn abort_with_nothing_running_only_pauses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        manager.abort().await.expect("abort");
        assert!(!manager.is_continuous().await);

        let release = Arc::new(AtomicBool::new(true));
        let run_id = manager.queue(held(&release)).await.expect("queue");
        assert_eq!(manager.running_run_id().await, None);
        assert_eq!(manager.queued_run_ids().await, vec![run_id.clone()]);

        assert_eq!(manager.resume().await.expect("resume"), Some(run_id.clone()));
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        assert_eq!(manager.experiment(&run_id).await.expect("exists").status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn remove_unknown_run_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        assert!(matches!(manager.remove("nope").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn defaults_are_applied_to_new_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let release = Arc::new(AtomicBool::new(true));
        let mut procedure = held(&release);
        procedure.parameters_mut().set("n", 7_i64).expect("set");
        manager.save_defaults(&procedure).expect("save");

        let mut fresh = held(&release);
        assert_eq!(manager.apply_defaults(&mut fresh).expect("apply"), 1);
        assert_eq!(fresh.parameters().integer("n").expect("n"), 7);
    }

    #[tokio::test]
    async fn failed_run_does_not_advance_the_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let release = Arc::new(AtomicBool::new(false));
        let failing = manager.queue(held_with(&release, true)).await.expect("queue failing");
        let healthy = manager.queue(held(&release)).await.expect("queue healthy");
        assert_eq!(manager.running_run_id().await, Some(failing.clone()));

        release.store(true, Ordering::SeqCst);
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        let failed = manager.experiment(&failing).await.expect("failing");
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error_summary.expect("error").contains("amplifier tripped"));
        assert_eq!(manager.experiment(&healthy).await.expect("healthy").status, RunStatus::Queued);
        assert_eq!(manager.running_run_id().await, None);
        assert_eq!(manager.queued_run_ids().await, vec![healthy.clone()]);

        assert_eq!(manager.resume().await.expect("resume"), Some(healthy.clone()));
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        assert_eq!(manager.experiment(&healthy).await.expect("healthy").status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn resident_results_leave_no_spill_file_and_remove_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = RunnerSettings::for_state_dir(dir.path());
        settings.cache_capacity = 1;
        let manager = Manager::new(settings, ProcedureRegistry::new(), None).expect("manager");
        let release = Arc::new(AtomicBool::new(true));

        let first = manager.queue(held(&release)).await.expect("queue first");
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        let first_path = manager.results(&first).await.expect("results").path().to_path_buf();
        assert!(manager.cache().is_resident(&first_path).expect("resident"));
        assert!(!first_path.exists());
        assert_eq!(spilled_files(&manager), 0);

        let second = manager.queue(held(&release)).await.expect("queue second");
        manager.wait_until_idle(Duration::from_secs(10)).await.expect("idle");
        assert!(first_path.exists(), "evicted results are spilled");
        assert_eq!(spilled_files(&manager), 1);

        manager.remove(&first).await.expect("remove evicted");
        manager.remove(&second).await.expect("remove resident");
        assert_eq!(spilled_files(&manager), 0);
        assert_eq!(manager.cache().resident_len().expect("len"), 0);
    }

    #[tokio::test]
    async fn removed_run_leaves_the_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        manager.abort().await.expect("pause");
        let release = Arc::new(AtomicBool::new(true));
        let run_id = manager.queue(held(&release)).await.expect("queue");
        let ledger = manager.ledger().expect("ledger").clone();
        assert_eq!(ledger.get_run(&run_id).expect("get").map(|run| run.status), Some(RunStatus::Queued));

        manager.remove(&run_id).await.expect("remove");
        assert!(manager.queued_run_ids().await.is_empty());
        assert!(ledger.get_run(&run_id).expect("get").is_none());
        assert!(ledger.list_events(&run_id).expect("events").is_empty());

        drop(manager);
        let restarted = Manager::new(RunnerSettings::for_state_dir(dir.path()), ProcedureRegistry::new(), None)
            .expect("restart");
        let ledger = restarted.ledger().expect("ledger");
        assert!(ledger.get_run(&run_id).expect("get").is_none());
    }
}
