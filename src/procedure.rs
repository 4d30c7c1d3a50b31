use crate::context::ExecutionContext;
use crate::errors::{AppError, AppResult};
use crate::indicators::{Indicator, Indicators};
use crate::parameters::{Parameter, ParameterSet, ParameterValue};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

pub const DIRECTORY_PARAMETER: &str = "directory";
const FILE_TIME_FORMAT: &str = "%y%m%d_%H%M%S";

/// Static description of a procedure class: its parameters, indicators and
/// result columns, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureSchema {
    class: String,
    data_columns: Vec<String>,
    parameters: Vec<Parameter>,
    indicators: Vec<Indicator>,
}

impl ProcedureSchema {
    pub fn builder(class: &str) -> ProcedureSchemaBuilder {
        ProcedureSchemaBuilder {
            class: class.to_string(),
            data_columns: Vec::new(),
            parameters: Vec::new(),
            indicators: Vec::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn data_columns(&self) -> &[String] {
        &self.data_columns
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn indicators(&self) -> &[Indicator] {
        &self.indicators
    }
}

#[derive(Debug, Clone)]
pub struct ProcedureSchemaBuilder {
    class: String,
    data_columns: Vec<String>,
    parameters: Vec<Parameter>,
    indicators: Vec<Indicator>,
}

impl ProcedureSchemaBuilder {
    pub fn column(mut self, name: &str) -> Self {
        self.data_columns.push(name.to_string());
        self
    }

    pub fn columns<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.data_columns.extend(names.into_iter().map(ToString::to_string));
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn indicator(mut self, indicator: Indicator) -> Self {
        self.indicators.push(indicator);
        self
    }

    pub fn build(self) -> AppResult<Arc<ProcedureSchema>> {
        if self.class.trim().is_empty() {
            return Err(AppError::InvalidInput("procedure class name is empty".to_string()));
        }
        if self.data_columns.is_empty() {
            return Err(AppError::InvalidInput(format!("{} declares no data columns", self.class)));
        }
        for (index, column) in self.data_columns.iter().enumerate() {
            if column.is_empty() || column.contains([',', '\n', '\r']) {
                return Err(AppError::InvalidInput(format!("invalid data column name '{column}'")));
            }
            if self.data_columns[..index].contains(column) {
                return Err(AppError::InvalidInput(format!("duplicate data column '{column}'")));
            }
        }
        for (index, parameter) in self.parameters.iter().enumerate() {
            if self.parameters[..index].iter().any(|p| p.name() == parameter.name()) {
                return Err(AppError::InvalidInput(format!("duplicate parameter '{}'", parameter.name())));
            }
        }
        for (index, indicator) in self.indicators.iter().enumerate() {
            if self.indicators[..index].iter().any(|i| i.name() == indicator.name()) {
                return Err(AppError::InvalidInput(format!("duplicate indicator '{}'", indicator.name())));
            }
        }
        // Surface bad defaults at declaration time rather than at queue time.
        ParameterSet::from_declared(&self.parameters)?;
        Indicators::from_declared(&self.indicators)?;

        Ok(Arc::new(ProcedureSchema {
            class: self.class,
            data_columns: self.data_columns,
            parameters: self.parameters,
            indicators: self.indicators,
        }))
    }
}

/// The measurement logic of a procedure.
///
/// `execute` must poll [`ExecutionContext::should_stop`] and return `Ok(())`
/// promptly once it is true; a stop request is not an error.
pub trait Routine: Send {
    fn startup(&mut self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()>;

    fn shutdown(&mut self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Parameter values of one procedure instance together with its class name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSnapshot {
    pub class: String,
    pub parameters: BTreeMap<String, ParameterValue>,
}

/// One configured instance of a procedure class.
pub struct Procedure {
    schema: Arc<ProcedureSchema>,
    parameters: ParameterSet,
    indicators: Indicators,
    file_name: OnceLock<String>,
    routine: Box<dyn Routine>,
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("class", &self.schema.class)
            .field("parameters", &self.parameters.values())
            .field("file_name", &self.file_name.get())
            .finish_non_exhaustive()
    }
}

impl Procedure {
    pub fn new(schema: Arc<ProcedureSchema>, routine: impl Routine + 'static) -> AppResult<Self> {
        let parameters = ParameterSet::from_declared(schema.parameters())?;
        let indicators = Indicators::from_declared(schema.indicators())?;
        Ok(Self {
            schema,
            parameters,
            indicators,
            file_name: OnceLock::new(),
            routine: Box::new(routine),
        })
    }

    pub fn class(&self) -> &str {
        self.schema.class()
    }

    pub fn schema(&self) -> &Arc<ProcedureSchema> {
        &self.schema
    }

    pub fn data_columns(&self) -> &[String] {
        self.schema.data_columns()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.names()
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    pub fn indicators(&self) -> &Indicators {
        &self.indicators
    }

    pub fn parameter_values(&self) -> BTreeMap<String, ParameterValue> {
        self.parameters.values()
    }

    pub fn set_parameters(&mut self, values: &BTreeMap<String, ParameterValue>) -> AppResult<()> {
        self.parameters.apply(values)
    }

    pub fn snapshot(&self) -> ProcedureSnapshot {
        ProcedureSnapshot {
            class: self.schema.class().to_string(),
            parameters: self.parameters.values(),
        }
    }

    /// Name of this instance's output file, `{prefix}_{n0}_…_{time}.swq`.
    ///
    /// The first call fixes the name; later calls return it unchanged whatever
    /// their arguments. `time` defaults to the current local time.
    pub fn file_name(&self, prefix: &str, numbers: &[usize], time: Option<&str>) -> String {
        self.file_name
            .get_or_init(|| {
                let time = time
                    .map(ToString::to_string)
                    .unwrap_or_else(|| Local::now().format(FILE_TIME_FORMAT).to_string());
                let mut parts = vec![sanitize_component(prefix)];
                parts.extend(numbers.iter().map(ToString::to_string));
                parts.push(sanitize_component(&time));
                format!("{}.{}", parts.join("_"), crate::archive::ARCHIVE_EXTENSION)
            })
            .clone()
    }

    pub fn cached_file_name(&self) -> Option<&str> {
        self.file_name.get().map(String::as_str)
    }

    /// `directory/file_name` when the procedure declares a directory parameter.
    pub fn output_path(&self) -> Option<PathBuf> {
        let name = self.file_name.get()?;
        let directory = self.parameters.path(DIRECTORY_PARAMETER).ok()?;
        Some(directory.join(name))
    }

    pub(crate) fn routine_mut(&mut self) -> &mut dyn Routine {
        self.routine.as_mut()
    }

    /// Resets indicators to their defaults and hands them to a run.
    pub(crate) fn take_indicators(&mut self) -> AppResult<Indicators> {
        self.indicators.reset()?;
        Ok(std::mem::take(&mut self.indicators))
    }

    pub(crate) fn restore_indicators(&mut self, indicators: Indicators) {
        self.indicators = indicators;
    }
}

pub fn current_file_time() -> String {
    Local::now().format(FILE_TIME_FORMAT).to_string()
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "run".to_string()
    } else {
        trimmed.to_string()
    }
}

type Factory = Arc<dyn Fn() -> AppResult<Procedure> + Send + Sync>;

/// Maps procedure class names to constructors so saved runs can be rebuilt.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    factories: HashMap<String, Factory>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn() -> AppResult<Procedure> + Send + Sync + 'static,
    {
        self.factories.insert(class.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn create(&self, class: &str) -> AppResult<Procedure> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| AppError::NotFound(format!("procedure class '{class}' is not registered")))?;
        let procedure = factory()?;
        if procedure.class() != class {
            return Err(AppError::Internal(format!(
                "factory for '{class}' built a '{}' procedure",
                procedure.class()
            )));
        }
        Ok(procedure)
    }

    /// Builds a fresh instance of the snapshot's class with its parameters applied.
    pub fn restore(&self, snapshot: &ProcedureSnapshot) -> AppResult<Procedure> {
        let mut procedure = self.create(&snapshot.class)?;
        procedure.set_parameters(&snapshot.parameters)?;
        Ok(procedure)
    }
}
