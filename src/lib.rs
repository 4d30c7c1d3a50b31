//! Queue of measurement procedures run one at a time on a worker thread, with
//! live result streaming and a disk-backed cache of finished results.

pub mod archive;
pub mod config;
pub mod context;
pub mod db;
pub mod demo;
pub mod errors;
pub mod indicators;
pub mod logging;
pub mod manager;
pub mod models;
pub mod parameters;
pub mod procedure;
pub mod results;
pub mod sweep;
pub mod table;
pub mod worker;

pub use crate::config::{ResultsBacking, RunnerSettings};
pub use crate::context::{Daq, ExecutionContext, LogLevel};
pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult};
pub use crate::indicators::{Indicator, IndicatorValue, Indicators};
pub use crate::logging::init_tracing;
pub use crate::manager::Manager;
pub use crate::models::{ExperimentSummary, ListRunsFilters, RunStatus, StreamEnvelope};
pub use crate::parameters::{Parameter, ParameterSet, ParameterValue};
pub use crate::procedure::{Procedure, ProcedureRegistry, ProcedureSchema, ProcedureSnapshot, Routine, DIRECTORY_PARAMETER};
pub use crate::results::cache::ResultsCache;
pub use crate::results::{Results, ResultsStore};
pub use crate::table::{Record, ResultTable, Value};
pub use crate::worker::{StopHandle, Worker, WorkerEvent};
