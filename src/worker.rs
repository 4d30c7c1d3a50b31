use crate::context::{Daq, ExecutionContext, LogLevel};
use crate::indicators::IndicatorValue;
use crate::procedure::Procedure;
use crate::results::Results;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Everything a worker reports while and after running a procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Running,
    Progress(f64),
    Status(String),
    Log { level: LogLevel, message: String },
    Indicator { name: String, value: IndicatorValue, display: String },
    Results { appended: usize, cleared: bool },
    Saved { path: PathBuf },
    Message { topic: String, payload: serde_json::Value },
    Finished,
    AbortReturned,
    Failed { message: String },
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::AbortReturned | Self::Failed { .. })
    }
}

/// Requests cooperative cancellation of a running worker.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one procedure to completion off the async runtime.
pub struct Worker {
    run_id: String,
    procedure: Procedure,
    results: Results,
    stop: StopHandle,
    monitor: UnboundedSender<WorkerEvent>,
    daq: Option<Arc<dyn Daq>>,
}

impl Worker {
    pub fn new(
        run_id: &str,
        procedure: Procedure,
        results: Results,
        daq: Option<Arc<dyn Daq>>,
    ) -> (Self, UnboundedReceiver<WorkerEvent>) {
        let (monitor, events) = unbounded_channel();
        let worker = Self {
            run_id: run_id.to_string(),
            procedure,
            results,
            stop: StopHandle::default(),
            monitor,
            daq,
        };
        (worker, events)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs on the blocking pool; the handle yields the procedure back.
    pub fn start(self) -> JoinHandle<Procedure> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Executes startup, execute and shutdown, then reports exactly one
    /// terminal event. Shutdown runs whenever startup was attempted.
    pub fn run(mut self) -> Procedure {
        let span = tracing::info_span!("worker", run_id = %self.run_id, class = %self.procedure.class());
        let _entered = span.enter();
        let _ = self.monitor.send(WorkerEvent::Running);

        let indicators = match self.procedure.take_indicators() {
            Ok(indicators) => indicators,
            Err(err) => {
                tracing::error!(error = %err, "could not prepare indicators");
                let _ = self.monitor.send(WorkerEvent::Failed {
                    message: err.to_string(),
                });
                return self.procedure;
            }
        };
        let mut ctx = ExecutionContext::new(
            self.run_id.clone(),
            self.procedure.parameters().clone(),
            indicators,
            self.results.clone(),
            self.procedure.output_path(),
            self.stop.0.clone(),
            self.monitor.clone(),
            self.daq.clone(),
        );

        let routine = self.procedure.routine_mut();
        let body = invoke("execute", || {
            invoke("startup", || routine.startup(&mut ctx))?;
            routine.execute(&mut ctx)
        });
        let shutdown = invoke("shutdown", || routine.shutdown(&mut ctx));

        if let Err(err) = self.results.finish() {
            tracing::warn!(error = %err, "could not finish results");
        }

        let terminal = match (body, shutdown) {
            (Err(err), _) | (Ok(()), Err(err)) => {
                let message = format!("{err:#}");
                tracing::error!(error = %message, "procedure failed");
                ctx.log(LogLevel::Error, &message);
                WorkerEvent::Failed { message }
            }
            (Ok(()), Ok(())) if ctx.should_stop() => {
                tracing::warn!("procedure returned after abort request");
                WorkerEvent::AbortReturned
            }
            (Ok(()), Ok(())) => {
                tracing::info!("procedure finished");
                WorkerEvent::Finished
            }
        };

        let indicators = ctx.into_indicators();
        self.procedure.restore_indicators(indicators);
        let _ = self.monitor.send(terminal);
        self.procedure
    }
}

/// Calls one routine hook, turning a panic into an error.
fn invoke(hook: &str, f: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("{hook} panicked: {detail}"))
        }
    }
}
