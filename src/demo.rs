//! Simulated procedures used by the CLI and the integration tests.

use crate::context::{Daq, ExecutionContext, LogLevel};
use crate::errors::AppResult;
use crate::indicators::Indicator;
use crate::parameters::Parameter;
use crate::procedure::{Procedure, ProcedureRegistry, ProcedureSchema, Routine, DIRECTORY_PARAMETER};
use crate::sweep::linspace;
use crate::table::{Record, ResultTable};
use rand::Rng;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

pub const SWEEP_CLASS: &str = "Sweep";
pub const PULSE_CLASS: &str = "Pulse";

pub const SWEEP_COLUMNS: [&str; 13] = [
    "I1",
    "Q1",
    "bias I1",
    "bias Q1",
    "Amplitude PSD1",
    "Phase PSD1",
    "I2",
    "Q2",
    "bias I2",
    "bias Q2",
    "Amplitude PSD2",
    "Phase PSD2",
    "frequency",
];

pub const PULSE_COLUMNS: [&str; 10] = [
    "t",
    "phase 1",
    "amplitude 1",
    "phase 2",
    "amplitude 2",
    "frequency",
    "phase PSD1",
    "amplitude PSD1",
    "phase PSD2",
    "amplitude PSD2",
];

const NOISE_POINTS: usize = 100;

/// A registry with the demo `Sweep` and `Pulse` classes.
pub fn registry() -> ProcedureRegistry {
    let mut registry = ProcedureRegistry::new();
    registry.register(SWEEP_CLASS, sweep_procedure);
    registry.register(PULSE_CLASS, pulse_procedure);
    registry
}

fn directory_parameter() -> Parameter {
    Parameter::directory(DIRECTORY_PARAMETER, "Data Directory").default_value(std::env::temp_dir())
}

pub fn sweep_schema() -> AppResult<Arc<ProcedureSchema>> {
    ProcedureSchema::builder(SWEEP_CLASS)
        .columns(SWEEP_COLUMNS)
        .parameter(directory_parameter())
        .parameter(Parameter::float("frequency1", "Channel 1 Center Frequency").units("GHz").default_value(4.0))
        .parameter(Parameter::float("span1", "Channel 1 Span").units("MHz").default_value(2.0))
        .parameter(Parameter::float("frequency2", "Channel 2 Center Frequency").units("GHz").default_value(4.0))
        .parameter(Parameter::float("span2", "Channel 2 Span").units("MHz").default_value(2.0))
        .parameter(Parameter::float("attenuation", "DAC Attenuation").units("dB").default_value(70.0))
        .parameter(Parameter::float("field", "Magnetic Field").units("V").default_value(0.0))
        .parameter(Parameter::float("temperature", "Temperature").units("mK").default_value(100.0))
        .parameter(Parameter::integer("n_points", "Number of Points").range(2.0, 100_000.0).default_value(500_i64))
        .parameter(Parameter::boolean("take_noise", "Take Noise Data").default_value(true))
        .parameter(Parameter::integer("wait_ms", "Wait Per Point").units("ms").range(0.0, 10_000.0).default_value(10_i64))
        .indicator(Indicator::float("radius", "Loop Radius", 3))
        .build()
}

pub fn sweep_procedure() -> AppResult<Procedure> {
    Procedure::new(sweep_schema()?, SweepRoutine)
}

pub fn pulse_schema() -> AppResult<Arc<ProcedureSchema>> {
    ProcedureSchema::builder(PULSE_CLASS)
        .columns(PULSE_COLUMNS)
        .parameter(directory_parameter())
        .parameter(Parameter::float("frequency1", "Ch 1 Center Frequency").units("GHz").default_value(4.0))
        .parameter(Parameter::float("frequency2", "Ch 2 Center Frequency").units("GHz").default_value(4.0))
        .parameter(Parameter::float("attenuation", "DAC Attenuation").units("dB").default_value(0.0))
        .parameter(Parameter::integer("n_points", "Number of Points").range(1.0, 100_000.0).default_value(500_i64))
        .parameter(Parameter::integer("n_pulses", "Number of Pulses").range(1.0, 100_000.0).default_value(100_i64))
        .parameter(Parameter::boolean("take_noise", "Take Noise Data").default_value(true))
        .parameter(Parameter::integer("wait_ms", "Max Wait Per Pulse").units("ms").range(0.0, 10_000.0).default_value(100_i64))
        .indicator(Indicator::integer("pulses", "Pulses Taken"))
        .build()
}

pub fn pulse_procedure() -> AppResult<Procedure> {
    Procedure::new(pulse_schema()?, PulseRoutine)
}

fn noise_spectrum() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let frequency = linspace(1e3, 1e5, NOISE_POINTS);
    let phase: Vec<f64> = frequency.iter().map(|f| 1.0 / f).collect();
    let amplitude = vec![1.0 / 1e5; NOISE_POINTS];
    (frequency, phase, amplitude)
}

fn scaled(values: &[f64], factor: f64) -> Vec<f64> {
    values.iter().map(|v| v * factor).collect()
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Two resonator loops followed by an optional noise measurement.
pub struct SweepRoutine;

impl Routine for SweepRoutine {
    fn startup(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        ctx.log(LogLevel::Info, "Starting procedure");
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        let n_points = ctx.parameters().integer("n_points")?.max(2) as usize;
        let attenuation = ctx.parameters().float("attenuation")?;
        let take_noise = ctx.parameters().boolean("take_noise")?;
        let wait = Duration::from_millis(ctx.parameters().integer("wait_ms")?.max(0) as u64);
        let radius = 70.0 / attenuation;
        ctx.set_indicator("radius", radius)?;
        ctx.log(LogLevel::Info, &format!("Measuring the loop with {n_points} points"));

        let mut loop_x = Vec::with_capacity(n_points);
        let mut loop_y = Vec::with_capacity(n_points);
        for i in 0..n_points {
            ctx.progress(i as f64 / n_points as f64 * 100.0);
            let angle = 2.0 * PI * i as f64 / (n_points - 1) as f64;
            let (x, y) = (radius * angle.cos(), radius * angle.sin());
            loop_x.push(x);
            loop_y.push(y);
            ctx.emit_results(&Record::new().with("I1", x).with("Q1", y).with("I2", x * 2.0).with("Q2", y))?;
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            if ctx.should_stop() {
                ctx.log(LogLevel::Warning, "Caught the stop flag in the procedure");
                break;
            }
        }

        let mut saved = Record::new()
            .with("I1", loop_x.clone())
            .with("Q1", loop_y.clone())
            .with("I2", scaled(&loop_x, 2.0))
            .with("Q2", loop_y);
        if take_noise && !ctx.should_stop() {
            ctx.emit_results(&Record::new().with("bias I1", radius).with("bias Q1", 0.0))?;
            ctx.emit_results(&Record::new().with("bias I2", 0.0).with("bias Q2", radius))?;
            let (frequency, phase, amplitude) = noise_spectrum();
            let noise = Record::new()
                .with("frequency", frequency)
                .with("Phase PSD1", phase.clone())
                .with("Amplitude PSD1", amplitude.clone())
                .with("Phase PSD2", scaled(&phase, 0.5))
                .with("Amplitude PSD2", scaled(&amplitude, 2.0));
            ctx.emit_results(&noise)?;
            for (column, value) in [("bias I1", radius), ("bias Q1", 0.0), ("bias I2", 0.0), ("bias Q2", radius)] {
                saved.insert(column, value);
            }
            for column in noise.columns() {
                if let Some(value) = noise.get(column) {
                    saved.insert(column, value.clone());
                }
            }
        }

        let mut table = ResultTable::new(&columns(&SWEEP_COLUMNS));
        table.append_record(&saved)?;
        ctx.save(&table)?;
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        ctx.log(LogLevel::Info, "Finished procedure");
        Ok(())
    }
}

/// Random pulses; the live view only keeps the latest pulse.
pub struct PulseRoutine;

impl Routine for PulseRoutine {
    fn execute(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        let n_points = ctx.parameters().integer("n_points")?.max(1) as usize;
        let n_pulses = ctx.parameters().integer("n_pulses")?.max(1) as usize;
        let take_noise = ctx.parameters().boolean("take_noise")?;
        let max_wait = ctx.parameters().integer("wait_ms")?.max(0) as f64;
        let t: Vec<f64> = (0..n_points).map(|i| i as f64).collect();
        let mut rng = rand::rng();
        let mut history = ResultTable::new(&columns(&PULSE_COLUMNS));

        for i in 0..n_pulses {
            let mut sample = |offset: f64| -> Vec<f64> { (0..n_points).map(|_| rng.random::<f64>() + offset).collect() };
            let pulse = Record::new()
                .with("t", t.clone())
                .with("phase 1", sample(0.0))
                .with("amplitude 1", sample(10.0))
                .with("phase 2", sample(0.0))
                .with("amplitude 2", sample(10.0));
            history.append_record(&pulse)?;
            if i % 10 == 0 {
                ctx.replace_results(&pulse)?;
            }
            ctx.set_indicator("pulses", (i + 1) as i64)?;
            ctx.progress(i as f64 / n_pulses as f64 * 100.0);
            if ctx.should_stop() {
                ctx.log(LogLevel::Warning, "Caught the stop flag in the procedure");
                return Ok(());
            }
            let wait = rng.random::<f64>() * max_wait;
            if wait > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(wait / 1000.0));
            }
        }

        if take_noise {
            let (frequency, phase, amplitude) = noise_spectrum();
            let noise = Record::new()
                .with("frequency", frequency)
                .with("phase PSD1", phase.clone())
                .with("amplitude PSD1", amplitude.clone())
                .with("phase PSD2", scaled(&phase, 0.5))
                .with("amplitude PSD2", scaled(&amplitude, 2.0));
            ctx.emit_results(&noise)?;
            history.append_record(&noise)?;
        }
        ctx.save(&history)?;
        Ok(())
    }
}

/// Stand-in acquisition hardware reporting a fixed state.
#[derive(Debug, Default)]
pub struct SimulatedDaq {
    closed: std::sync::atomic::AtomicBool,
}

impl SimulatedDaq {
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Daq for SimulatedDaq {
    fn system_state(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut state = serde_json::Map::new();
        state.insert("daq".to_string(), serde_json::json!("simulated"));
        state.insert("sample_rate".to_string(), serde_json::json!(2e6));
        state
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::info!("simulated daq closed");
        Ok(())
    }
}
