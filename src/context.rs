use crate::archive::{self, ResultsPayload};
use crate::errors::{AppError, AppResult};
use crate::indicators::{IndicatorValue, Indicators};
use crate::parameters::ParameterSet;
use crate::results::Results;
use crate::table::{Record, ResultTable};
use crate::worker::WorkerEvent;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Shared acquisition hardware. Bound once per manager and handed to every run.
pub trait Daq: Send + Sync {
    /// Snapshot of instrument state stored alongside saved results.
    fn system_state(&self) -> serde_json::Map<String, serde_json::Value>;

    fn close(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// What a routine sees while it runs.
///
/// Results go straight to the run's store; everything else is forwarded to
/// the manager's monitor channel.
pub struct ExecutionContext {
    run_id: String,
    parameters: ParameterSet,
    indicators: Indicators,
    results: Results,
    output_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    monitor: UnboundedSender<WorkerEvent>,
    daq: Option<Arc<dyn Daq>>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        parameters: ParameterSet,
        indicators: Indicators,
        results: Results,
        output_path: Option<PathBuf>,
        stop: Arc<AtomicBool>,
        monitor: UnboundedSender<WorkerEvent>,
        daq: Option<Arc<dyn Daq>>,
    ) -> Self {
        Self {
            run_id,
            parameters,
            indicators,
            results,
            output_path,
            stop,
            monitor,
            daq,
        }
    }

    pub(crate) fn into_indicators(self) -> Indicators {
        self.indicators
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn indicators(&self) -> &Indicators {
        &self.indicators
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn daq(&self) -> Option<&Arc<dyn Daq>> {
        self.daq.as_ref()
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn send(&self, event: WorkerEvent) {
        let _ = self.monitor.send(event);
    }

    /// Appends `record` to the run's results.
    pub fn emit_results(&mut self, record: &Record) -> AppResult<()> {
        let appended = self.results.append(record)?;
        self.send(WorkerEvent::Results { appended, cleared: false });
        Ok(())
    }

    /// Replaces the run's results with `record`; unnamed columns keep their data.
    pub fn replace_results(&mut self, record: &Record) -> AppResult<()> {
        let appended = self.results.replace(record)?;
        self.send(WorkerEvent::Results { appended, cleared: true });
        Ok(())
    }

    /// Forwards an arbitrary non-results message to the monitor.
    pub fn emit(&mut self, topic: &str, payload: serde_json::Value) {
        self.send(WorkerEvent::Message {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Percent complete, clamped to `[0, 100]`.
    pub fn progress(&mut self, percent: f64) {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        self.send(WorkerEvent::Progress(percent));
    }

    pub fn status(&mut self, message: &str) {
        self.send(WorkerEvent::Status(message.to_string()));
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(run_id = %self.run_id, "{message}"),
            LogLevel::Info => tracing::info!(run_id = %self.run_id, "{message}"),
            LogLevel::Warning => tracing::warn!(run_id = %self.run_id, "{message}"),
            LogLevel::Error => tracing::error!(run_id = %self.run_id, "{message}"),
        }
        self.send(WorkerEvent::Log {
            level,
            message: message.to_string(),
        });
    }

    pub fn set_indicator(&mut self, name: &str, value: impl Into<IndicatorValue>) -> AppResult<()> {
        let value = self.indicators.set(name, value.into())?;
        let display = self
            .indicators
            .get(name)
            .map(ToString::to_string)
            .unwrap_or_default();
        self.send(WorkerEvent::Indicator {
            name: name.to_string(),
            value,
            display,
        });
        Ok(())
    }

    pub fn system_state(&self) -> serde_json::Map<String, serde_json::Value> {
        self.daq.as_ref().map(|daq| daq.system_state()).unwrap_or_default()
    }

    /// Writes `table` with this run's parameters and the DAQ state to the
    /// run's output path.
    ///
    /// Returns `Ok(None)` without touching the file when something already
    /// exists at that path.
    pub fn save(&mut self, table: &ResultTable) -> AppResult<Option<PathBuf>> {
        let path = self
            .output_path
            .clone()
            .ok_or_else(|| AppError::InvalidInput("run has no output path to save to".to_string()))?;
        let mut payload = ResultsPayload::new(self.results.snapshot().clone(), table.clone());
        payload.metadata = serde_json::Value::Object(self.system_state());

        match archive::write_new(&path, &payload) {
            Ok(()) => {
                tracing::info!(run_id = %self.run_id, path = %path.display(), "saved results");
                self.send(WorkerEvent::Saved { path: path.clone() });
                Ok(Some(path))
            }
            Err(AppError::Collision(existing)) => {
                let message = format!("{existing} already exists, results not saved");
                self.log(LogLevel::Error, &message);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Saves the rows streamed so far.
    pub fn save_results(&mut self) -> AppResult<Option<PathBuf>> {
        let table = self.results.data()?;
        self.save(&table)
    }
}
