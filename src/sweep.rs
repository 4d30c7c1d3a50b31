//! Queueing a grid of runs over swept parameters.
//!
//! The last declared axis varies slowest and the first declared axis fastest;
//! the frequency index is innermost. Run numbers in file names follow the same
//! order: `[idx_last_axis, …, idx_first_axis, f]`.

use crate::errors::{AppError, AppResult};
use crate::manager::Manager;
use crate::parameters::{float_list_repr, float_repr, parse_float_list, ParameterValue};
use crate::procedure::{current_file_time, Procedure, DIRECTORY_PARAMETER};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_AXIS_POINTS: usize = 1000;
const FILE_PREFIX: &str = "sweep";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepAxis {
    pub parameter: String,
    #[serde(with = "float_repr")]
    pub start: f64,
    #[serde(with = "float_repr")]
    pub stop: f64,
    pub points: usize,
}

impl SweepAxis {
    pub fn new(parameter: &str, start: f64, stop: f64, points: usize) -> Self {
        Self {
            parameter: parameter.to_string(),
            start,
            stop,
            points,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        linspace(self.start, self.stop, self.points)
    }
}

/// One frequency-like parameter and the values it steps through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyChannel {
    pub parameter: String,
    #[serde(with = "float_list_repr")]
    pub values: Vec<f64>,
}

impl FrequencyChannel {
    pub fn new(parameter: &str, values: Vec<f64>) -> Self {
        Self {
            parameter: parameter.to_string(),
            values,
        }
    }

    /// Parses `"4.0\n5.0"` style text.
    pub fn parse(parameter: &str, text: &str) -> AppResult<Self> {
        let values = parse_float_list(text)
            .map_err(|err| AppError::InvalidInput(format!("invalid list for '{parameter}': {err}")))?;
        Ok(Self::new(parameter, values))
    }

    /// Value at index `f`: the last entry once the list runs out, NaN if empty.
    fn value_at(&self, f: usize) -> f64 {
        self.values
            .get(f)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepPlan {
    pub directory: PathBuf,
    pub channels: Vec<FrequencyChannel>,
    pub axes: Vec<SweepAxis>,
    /// Values applied to every run before the swept ones.
    #[serde(default)]
    pub base: BTreeMap<String, ParameterValue>,
}

/// Parameter values and file-name numbers for one run of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub numbers: Vec<usize>,
    pub values: BTreeMap<String, ParameterValue>,
}

impl SweepPlan {
    pub fn n_frequencies(&self) -> usize {
        self.channels.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.n_frequencies() == 0 {
            return Err(AppError::InvalidInput("Invalid frequency and span lists".to_string()));
        }
        let mut names = HashSet::new();
        for name in self
            .axes
            .iter()
            .map(|a| a.parameter.as_str())
            .chain(self.channels.iter().map(|c| c.parameter.as_str()))
        {
            if !names.insert(name) {
                return Err(AppError::InvalidInput(format!("parameter '{name}' is swept twice")));
            }
        }
        for axis in &self.axes {
            if axis.points == 0 || axis.points > MAX_AXIS_POINTS {
                return Err(AppError::InvalidInput(format!(
                    "axis '{}' needs between 1 and {MAX_AXIS_POINTS} points, got {}",
                    axis.parameter, axis.points
                )));
            }
        }
        Ok(())
    }

    /// Every run of the sweep in queue order.
    pub fn points(&self) -> AppResult<Vec<SweepPoint>> {
        self.validate()?;
        let grids: Vec<Vec<f64>> = self.axes.iter().map(SweepAxis::values).collect();
        let n_freq = self.n_frequencies();
        let mut points = Vec::new();
        // Odometer over axis indices; index 0 (first axis) turns fastest.
        let mut indices = vec![0usize; grids.len()];
        loop {
            for f in 0..n_freq {
                let mut values = BTreeMap::new();
                for (axis, (grid, index)) in self.axes.iter().zip(grids.iter().zip(&indices)) {
                    values.insert(axis.parameter.clone(), ParameterValue::Float(grid[*index]));
                }
                for channel in &self.channels {
                    values.insert(channel.parameter.clone(), ParameterValue::Float(channel.value_at(f)));
                }
                let mut numbers: Vec<usize> = indices.iter().rev().copied().collect();
                numbers.push(f);
                points.push(SweepPoint { numbers, values });
            }

            let mut carry = true;
            for (index, grid) in indices.iter_mut().zip(&grids) {
                *index += 1;
                if *index < grid.len() {
                    carry = false;
                    break;
                }
                *index = 0;
            }
            if carry {
                break;
            }
        }
        Ok(points)
    }
}

pub fn linspace(start: f64, stop: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Sweep definition plus the exact parameters of every queued file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    pub start_time: String,
    pub plan: SweepPlan,
    pub parameters: BTreeMap<String, BTreeMap<String, ParameterValue>>,
}

impl SweepConfig {
    pub fn file_name(start_time: &str) -> String {
        format!("config_sweep_{start_time}.json")
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound(path.display().to_string()),
            _ => AppError::from(err),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedSweep {
    pub start_time: String,
    pub run_ids: Vec<String>,
    pub skipped: Vec<PathBuf>,
    pub config_path: PathBuf,
}

pub async fn queue_sweep<F>(manager: &Manager, plan: &SweepPlan, make: F) -> AppResult<QueuedSweep>
where
    F: Fn() -> AppResult<Procedure>,
{
    queue_sweep_at(manager, plan, make, &current_file_time()).await
}

/// Queues one run per sweep point, stamping file names with `start_time`.
///
/// Points whose output file is already queued or already on disk are logged
/// and skipped. The sweep config is written to the plan's directory last.
pub async fn queue_sweep_at<F>(manager: &Manager, plan: &SweepPlan, make: F, start_time: &str) -> AppResult<QueuedSweep>
where
    F: Fn() -> AppResult<Procedure>,
{
    let points = plan.points()?;
    let mut run_ids = Vec::new();
    let mut skipped = Vec::new();
    let mut queued_paths = HashSet::new();
    let mut parameters = BTreeMap::new();

    for point in points {
        let mut procedure = make()?;
        procedure.set_parameters(&plan.base)?;
        procedure
            .parameters_mut()
            .set(DIRECTORY_PARAMETER, plan.directory.clone())?;
        procedure.set_parameters(&point.values)?;

        let file_name = procedure.file_name(FILE_PREFIX, &point.numbers, Some(start_time));
        let path = plan.directory.join(&file_name);
        if queued_paths.contains(&path) || manager.is_output_known(&path).await {
            tracing::error!(path = %path.display(), "already in the queue, skipping");
            skipped.push(path);
            continue;
        }
        if path.exists() {
            tracing::error!(path = %path.display(), "already exists, skipping");
            skipped.push(path);
            continue;
        }

        let values = procedure.parameter_values();
        match manager.queue(procedure).await {
            Ok(run_id) => {
                parameters.insert(file_name, values);
                queued_paths.insert(path);
                run_ids.push(run_id);
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to queue sweep point");
                skipped.push(path);
            }
        }
    }

    let config = SweepConfig {
        start_time: start_time.to_string(),
        plan: plan.clone(),
        parameters,
    };
    let config_path = plan.directory.join(SweepConfig::file_name(start_time));
    config.save(&config_path)?;
    tracing::info!(queued = run_ids.len(), skipped = skipped.len(), config = %config_path.display(), "queued sweep");

    Ok(QueuedSweep {
        start_time: start_time.to_string(),
        run_ids,
        skipped,
        config_path,
    })
}

#[cfg(test)]
mod tests {
    use super::{linspace, FrequencyChannel, SweepAxis, SweepConfig, SweepPlan};
    use crate::parameters::ParameterValue;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn plan() -> SweepPlan {
        SweepPlan {
            directory: PathBuf::from("/data"),
            channels: vec![
                FrequencyChannel::new("frequency1", vec![4.0, 5.0]),
                FrequencyChannel::new("span1", vec![2.0]),
                FrequencyChannel::new("frequency2", Vec::new()),
            ],
            axes: vec![
                SweepAxis::new("attenuation", 70.0, 60.0, 2),
                SweepAxis::new("field", 0.0, 0.0, 1),
                SweepAxis::new("temperature", 100.0, 200.0, 2),
            ],
            base: BTreeMap::new(),
        }
    }

    fn float(point: &super::SweepPoint, name: &str) -> f64 {
        point.values[name].as_f64().expect("float")
    }

    #[test]
    fn first_axis_fastest_frequency_innermost() {
        let points = plan().points().expect("points");
        assert_eq!(points.len(), 8);
        let numbers: Vec<Vec<usize>> = points.iter().map(|p| p.numbers.clone()).collect();
        assert_eq!(
            numbers,
            vec![
                vec![0, 0, 0, 0],
                vec![0, 0, 0, 1],
                vec![0, 0, 1, 0],
                vec![0, 0, 1, 1],
                vec![1, 0, 0, 0],
                vec![1, 0, 0, 1],
                vec![1, 0, 1, 0],
                vec![1, 0, 1, 1],
            ]
        );
        assert_eq!(float(&points[2], "attenuation"), 60.0);
        assert_eq!(float(&points[4], "temperature"), 200.0);
    }

    #[test]
    fn short_lists_repeat_last_and_empty_lists_are_nan() {
        let points = plan().points().expect("points");
        assert_eq!(float(&points[1], "frequency1"), 5.0);
        assert_eq!(float(&points[1], "span1"), 2.0);
        assert!(float(&points[1], "frequency2").is_nan());
    }

    #[test]
    fn empty_frequency_lists_are_rejected() {
        let mut plan = plan();
        plan.channels.iter_mut().for_each(|c| c.values.clear());
        assert!(plan.points().is_err());
        let mut plan = self::plan();
        plan.axes[0].points = 0;
        assert!(plan.points().is_err());
    }

    #[test]
    fn linspace_hits_both_ends() {
        assert_eq!(linspace(70.0, 60.0, 3), vec![70.0, 65.0, 60.0]);
        assert_eq!(linspace(1.0, 9.0, 1), vec![1.0]);
    }

    #[test]
    fn config_round_trips_with_nan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut parameters = BTreeMap::new();
        let mut values = BTreeMap::new();
        values.insert("frequency2".to_string(), ParameterValue::Float(4.5));
        parameters.insert("sweep_0_0_0_0_240101_000000.swq".to_string(), values);
        let config = SweepConfig {
            start_time: "240101_000000".to_string(),
            plan: plan(),
            parameters,
        };
        let path = dir.path().join(SweepConfig::file_name(&config.start_time));
        config.save(&path).expect("save");
        assert_eq!(SweepConfig::load(&path).expect("load"), config);
    }
}
