use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sweep_queue::demo::{self, SimulatedDaq};
use sweep_queue::sweep::{queue_sweep, FrequencyChannel, SweepAxis, SweepPlan};
use sweep_queue::{
    init_tracing, Database, ListRunsFilters, Manager, ParameterValue, RunStatus, RunnerSettings, StreamEnvelope,
    DIRECTORY_PARAMETER,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Parser)]
#[command(name = "sweep-queue", version, about = "Run simulated measurement procedures headless")]
struct Cli {
    /// YAML runner settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Queued,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl From<StatusArg> for RunStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Queued => RunStatus::Queued,
            StatusArg::Running => RunStatus::Running,
            StatusArg::Finished => RunStatus::Finished,
            StatusArg::Aborted => RunStatus::Aborted,
            StatusArg::Failed => RunStatus::Failed,
        }
    }
}

#[derive(Args)]
struct AxisArgs {
    /// Attenuation sweep as `start,stop,points`.
    #[arg(long, value_parser = parse_axis, default_value = "70,70,1")]
    atten: (f64, f64, usize),
    /// Field sweep as `start,stop,points`.
    #[arg(long, value_parser = parse_axis, default_value = "0,0,1")]
    field: (f64, f64, usize),
    /// Temperature sweep as `start,stop,points`.
    #[arg(long, value_parser = parse_axis, default_value = "100,100,1")]
    temp: (f64, f64, usize),
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a grid of demo sweeps and stream their events.
    Sweep {
        #[arg(long)]
        directory: PathBuf,
        #[arg(long, default_value = "4.0,5.0")]
        frequencies1: String,
        #[arg(long, default_value = "2.0")]
        spans1: String,
        #[arg(long, default_value = "6.0")]
        frequencies2: String,
        #[arg(long, default_value = "2.0")]
        spans2: String,
        #[command(flatten)]
        axes: AxisArgs,
        #[arg(long, default_value_t = 500)]
        n_points: i64,
        #[arg(long)]
        no_noise: bool,
        #[arg(long, default_value_t = 10)]
        wait_ms: i64,
    },
    /// Queue demo pulse runs and stream their events.
    Pulse {
        #[arg(long)]
        directory: PathBuf,
        #[arg(long, default_value_t = 1)]
        runs: usize,
        #[arg(long, default_value_t = 100)]
        n_pulses: i64,
        #[arg(long, default_value_t = 500)]
        n_points: i64,
        #[arg(long, default_value_t = 100)]
        wait_ms: i64,
    },
    /// Load saved archives or data logs and print their summaries.
    Load { paths: Vec<PathBuf> },
    /// List runs recorded in the ledger.
    Runs {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        class: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

fn parse_axis(raw: &str) -> Result<(f64, f64, usize), String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [start, stop, points] = parts.as_slice() else {
        return Err(format!("expected start,stop,points but got '{raw}'"));
    };
    let start = start.parse::<f64>().map_err(|err| format!("start: {err}"))?;
    let stop = stop.parse::<f64>().map_err(|err| format!("stop: {err}"))?;
    let points = points.parse::<usize>().map_err(|err| format!("points: {err}"))?;
    Ok((start, stop, points))
}

fn print_events(mut events: broadcast::Receiver<StreamEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Waits for the queue to drain, aborting everything on ctrl-c.
async fn drain(manager: Manager) -> Result<()> {
    tokio::select! {
        settled = manager.wait_until_idle(RUN_TIMEOUT) => settled?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, aborting all runs");
            let aborted = manager.abort_all().await?;
            eprintln!("aborting {} queued run(s)", aborted.len());
        }
    }
    manager.shutdown(SHUTDOWN_TIMEOUT).await?;
    Ok(())
}

fn values(pairs: &[(&str, ParameterValue)]) -> BTreeMap<String, ParameterValue> {
    pairs.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = RunnerSettings::load_or_default(cli.config.as_deref())?;
    init_tracing(&settings.log_dir)?;

    match cli.command {
        Commands::Runs { status, class, limit } => {
            let ledger = Database::new(&settings.ledger_path())?;
            let runs = ledger.list_runs(&ListRunsFilters {
                status: status.map(Into::into),
                class,
                limit: Some(limit),
                offset: None,
            })?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            return Ok(());
        }
        Commands::Load { paths } => {
            let manager = Manager::new(settings, demo::registry(), None)?;
            for path in &paths {
                if let Some(run_id) = manager.load(path).await.with_context(|| format!("loading {}", path.display()))? {
                    if let Some(results) = manager.results(&run_id).await {
                        let table = results.data()?;
                        eprintln!("{}: {} rows x {} columns", path.display(), table.len(), table.columns().len());
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&manager.experiments().await)?);
            return Ok(());
        }
        Commands::Sweep {
            directory,
            frequencies1,
            spans1,
            frequencies2,
            spans2,
            axes,
            n_points,
            no_noise,
            wait_ms,
        } => {
            let daq = Arc::new(SimulatedDaq::default());
            let manager = Manager::new(settings, demo::registry(), Some(daq))?;
            let printer = print_events(manager.subscribe());
            let plan = SweepPlan {
                directory,
                channels: vec![
                    FrequencyChannel::parse("frequency1", &frequencies1)?,
                    FrequencyChannel::parse("span1", &spans1)?,
                    FrequencyChannel::parse("frequency2", &frequencies2)?,
                    FrequencyChannel::parse("span2", &spans2)?,
                ],
                axes: vec![
                    SweepAxis::new("attenuation", axes.atten.0, axes.atten.1, axes.atten.2),
                    SweepAxis::new("field", axes.field.0, axes.field.1, axes.field.2),
                    SweepAxis::new("temperature", axes.temp.0, axes.temp.1, axes.temp.2),
                ],
                base: values(&[
                    ("n_points", ParameterValue::Integer(n_points)),
                    ("take_noise", ParameterValue::Boolean(!no_noise)),
                    ("wait_ms", ParameterValue::Integer(wait_ms)),
                ]),
            };
            let registry = manager.registry().clone();
            let queued = queue_sweep(&manager, &plan, || registry.create(demo::SWEEP_CLASS)).await?;
            eprintln!(
                "queued {} sweep run(s), skipped {}, config {}",
                queued.run_ids.len(),
                queued.skipped.len(),
                queued.config_path.display()
            );
            drain(manager).await?;
            printer.await?;
        }
        Commands::Pulse {
            directory,
            runs,
            n_pulses,
            n_points,
            wait_ms,
        } => {
            let daq = Arc::new(SimulatedDaq::default());
            let manager = Manager::new(settings, demo::registry(), Some(daq))?;
            let printer = print_events(manager.subscribe());
            for index in 0..runs {
                let mut procedure = manager.registry().create(demo::PULSE_CLASS)?;
                manager.apply_defaults(&mut procedure)?;
                procedure.set_parameters(&values(&[
                    (DIRECTORY_PARAMETER, ParameterValue::Path(directory.clone())),
                    ("n_pulses", ParameterValue::Integer(n_pulses)),
                    ("n_points", ParameterValue::Integer(n_points)),
                    ("wait_ms", ParameterValue::Integer(wait_ms)),
                ]))?;
                procedure.file_name("pulse", &[index], None);
                manager.queue(procedure).await?;
            }
            drain(manager).await?;
            printer.await?;
        }
    }
    Ok(())
}
