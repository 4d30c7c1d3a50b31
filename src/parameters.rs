use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The accepted shape of a parameter value, along with any bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ParameterKind {
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Float {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Boolean,
    Text,
    Directory,
    File,
    /// Free-form list of floats typed as text, one entry per line or comma.
    FloatList,
    Vector {
        length: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ParameterValue {
    Integer(i64),
    Float(#[serde(with = "float_repr")] f64),
    Boolean(bool),
    Text(String),
    Path(PathBuf),
    List(#[serde(with = "float_list_repr")] Vec<f64>),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Path(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[f64]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Path(value) => write!(f, "{}", value.display()),
            Self::List(values) => {
                let joined = values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                write!(f, "[{joined}]")
            }
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<PathBuf> for ParameterValue {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        Self::List(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    name: String,
    label: String,
    #[serde(flatten)]
    kind: ParameterKind,
    units: Option<String>,
    default: Option<ParameterValue>,
    value: Option<ParameterValue>,
}

impl Parameter {
    fn new(name: &str, label: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            units: None,
            default: None,
            value: None,
        }
    }

    pub fn integer(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::Integer { minimum: None, maximum: None })
    }

    pub fn float(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::Float { minimum: None, maximum: None })
    }

    pub fn boolean(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::Boolean)
    }

    pub fn text(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::Text)
    }

    pub fn directory(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::Directory)
    }

    pub fn file(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::File)
    }

    pub fn float_list(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::FloatList)
    }

    pub fn vector(name: &str, label: &str, length: Option<usize>) -> Self {
        Self::new(name, label, ParameterKind::Vector { length })
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn default_value(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Inclusive bounds; ignored for non-numeric kinds.
    pub fn range(mut self, minimum: f64, maximum: f64) -> Self {
        match &mut self.kind {
            ParameterKind::Integer { minimum: lo, maximum: hi } => {
                *lo = Some(minimum as i64);
                *hi = Some(maximum as i64);
            }
            ParameterKind::Float { minimum: lo, maximum: hi } => {
                *lo = Some(minimum);
                *hi = Some(maximum);
            }
            _ => {}
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    pub fn units_str(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn default(&self) -> Option<&ParameterValue> {
        self.default.as_ref()
    }

    pub fn value(&self) -> Option<&ParameterValue> {
        self.value.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn set_value(&mut self, value: ParameterValue) -> AppResult<()> {
        self.value = Some(coerce(&self.name, &self.kind, value)?);
        Ok(())
    }

    /// Resets the value to the declared default, validating the default on the way.
    pub(crate) fn reset(&mut self) -> AppResult<()> {
        self.value = match self.default.clone() {
            Some(default) => Some(coerce(&self.name, &self.kind, default)?),
            None => None,
        };
        Ok(())
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(value) = &self.value else {
            return Ok(());
        };
        match &self.units {
            Some(units) => write!(f, "{value} {units}"),
            None => write!(f, "{value}"),
        }
    }
}

fn coerce(name: &str, kind: &ParameterKind, value: ParameterValue) -> AppResult<ParameterValue> {
    let mismatch = |value: &ParameterValue| {
        AppError::InvalidInput(format!("parameter '{name}' cannot accept value '{value}' for {kind:?}"))
    };
    match kind {
        ParameterKind::Integer { minimum, maximum } => {
            let number = match &value {
                ParameterValue::Integer(number) => *number,
                ParameterValue::Float(number) if number.is_finite() && number.fract() == 0.0 => *number as i64,
                ParameterValue::Text(text) => text.trim().parse::<i64>().map_err(|_| mismatch(&value))?,
                _ => return Err(mismatch(&value)),
            };
            if minimum.is_some_and(|lo| number < lo) || maximum.is_some_and(|hi| number > hi) {
                return Err(AppError::InvalidInput(format!(
                    "parameter '{name}' value {number} is outside [{}, {}]",
                    minimum.map(|v| v.to_string()).unwrap_or_else(|| "-inf".to_string()),
                    maximum.map(|v| v.to_string()).unwrap_or_else(|| "inf".to_string()),
                )));
            }
            Ok(ParameterValue::Integer(number))
        }
        ParameterKind::Float { minimum, maximum } => {
            let number = match &value {
                ParameterValue::Float(number) => *number,
                ParameterValue::Integer(number) => *number as f64,
                ParameterValue::Text(text) => text.trim().parse::<f64>().map_err(|_| mismatch(&value))?,
                _ => return Err(mismatch(&value)),
            };
            if minimum.is_some_and(|lo| number < lo) || maximum.is_some_and(|hi| number > hi) {
                return Err(AppError::InvalidInput(format!(
                    "parameter '{name}' value {number} is outside the allowed range"
                )));
            }
            Ok(ParameterValue::Float(number))
        }
        ParameterKind::Boolean => match &value {
            ParameterValue::Boolean(_) => Ok(value),
            ParameterValue::Integer(0) => Ok(ParameterValue::Boolean(false)),
            ParameterValue::Integer(1) => Ok(ParameterValue::Boolean(true)),
            ParameterValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(ParameterValue::Boolean(true)),
                "false" | "no" | "0" => Ok(ParameterValue::Boolean(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        ParameterKind::Text => match value {
            ParameterValue::Text(_) => Ok(value),
            other => Ok(ParameterValue::Text(other.to_string())),
        },
        ParameterKind::Directory | ParameterKind::File => match value {
            ParameterValue::Path(_) => Ok(value),
            ParameterValue::Text(text) => Ok(ParameterValue::Path(PathBuf::from(text))),
            other => Err(mismatch(&other)),
        },
        ParameterKind::FloatList => match &value {
            ParameterValue::List(_) => Ok(value),
            ParameterValue::Float(number) => Ok(ParameterValue::List(vec![*number])),
            ParameterValue::Integer(number) => Ok(ParameterValue::List(vec![*number as f64])),
            ParameterValue::Text(text) => parse_float_list(text)
                .map(ParameterValue::List)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        ParameterKind::Vector { length } => {
            let values = match &value {
                ParameterValue::List(values) => values.clone(),
                ParameterValue::Text(text) => parse_float_list(text).map_err(|_| mismatch(&value))?,
                _ => return Err(mismatch(&value)),
            };
            if let Some(expected) = length {
                if values.len() != *expected {
                    return Err(AppError::InvalidInput(format!(
                        "parameter '{name}' expects {expected} entries, got {}",
                        values.len()
                    )));
                }
            }
            Ok(ParameterValue::List(values))
        }
    }
}

/// Parses `"4.0\n5.0"`, `"4.0, 5.0"` or `"[4.0, 5.0]"` into a list.
pub fn parse_float_list(text: &str) -> Result<Vec<f64>, std::num::ParseFloatError> {
    text.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::parse::<f64>)
        .collect()
}

/// Ordered collection of a procedure's parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    pub(crate) fn from_declared(declared: &[Parameter]) -> AppResult<Self> {
        let mut parameters = declared.to_vec();
        for parameter in &mut parameters {
            parameter.reset()?;
        }
        Ok(Self { parameters })
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        let parameter = self
            .parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown parameter '{name}'")))?;
        parameter.set_value(value.into())
    }

    /// Applies every entry; unknown names are rejected.
    pub fn apply(&mut self, values: &BTreeMap<String, ParameterValue>) -> AppResult<()> {
        for (name, value) in values {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Applies only the entries whose names this set declares.
    pub fn apply_known(&mut self, values: &BTreeMap<String, ParameterValue>) -> AppResult<usize> {
        let mut applied = 0;
        for (name, value) in values {
            if self.get(name).is_some() {
                self.set(name, value.clone())?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub fn values(&self) -> BTreeMap<String, ParameterValue> {
        self.parameters
            .iter()
            .filter_map(|p| p.value.clone().map(|value| (p.name.clone(), value)))
            .collect()
    }

    pub fn validate(&self) -> AppResult<()> {
        let missing = self
            .parameters
            .iter()
            .filter(|p| !p.is_set())
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::InvalidInput(format!("missing required parameters: {}", missing.join(", "))))
        }
    }

    fn required(&self, name: &str) -> AppResult<&ParameterValue> {
        self.get(name)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown parameter '{name}'")))?
            .value()
            .ok_or_else(|| AppError::InvalidInput(format!("parameter '{name}' is not set")))
    }

    pub fn float(&self, name: &str) -> AppResult<f64> {
        let value = self.required(name)?;
        value
            .as_f64()
            .ok_or_else(|| AppError::InvalidInput(format!("parameter '{name}' is not numeric")))
    }

    pub fn integer(&self, name: &str) -> AppResult<i64> {
        let value = self.required(name)?;
        value
            .as_i64()
            .ok_or_else(|| AppError::InvalidInput(format!("parameter '{name}' is not an integer")))
    }

    pub fn boolean(&self, name: &str) -> AppResult<bool> {
        let value = self.required(name)?;
        value
            .as_bool()
            .ok_or_else(|| AppError::InvalidInput(format!("parameter '{name}' is not a boolean")))
    }

    pub fn text(&self, name: &str) -> AppResult<String> {
        Ok(self.required(name)?.to_string())
    }

    pub fn path(&self, name: &str) -> AppResult<PathBuf> {
        match self.required(name)? {
            ParameterValue::Path(path) => Ok(path.clone()),
            ParameterValue::Text(text) => Ok(PathBuf::from(text)),
            _ => Err(AppError::InvalidInput(format!("parameter '{name}' is not a path"))),
        }
    }

    pub fn list(&self, name: &str) -> AppResult<Vec<f64>> {
        let value = self.required(name)?;
        value
            .as_list()
            .map(<[f64]>::to_vec)
            .ok_or_else(|| AppError::InvalidInput(format!("parameter '{name}' is not a list")))
    }
}

/// JSON has no NaN/inf; encode non-finite floats as strings.
pub(crate) mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
        Null(()),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&encode(*value))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => decode(&text).map_err(serde::de::Error::custom),
            Repr::Null(()) => Ok(f64::NAN),
        }
    }

    pub(crate) fn encode(value: f64) -> String {
        if value.is_nan() {
            "NaN".to_string()
        } else if value > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        }
    }

    pub(crate) fn decode(text: &str) -> Result<f64, String> {
        match text {
            "NaN" | "nan" => Ok(f64::NAN),
            "inf" => Ok(f64::INFINITY),
            "-inf" => Ok(f64::NEG_INFINITY),
            other => other.parse::<f64>().map_err(|err| err.to_string()),
        }
    }
}

pub(crate) mod float_list_repr {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Item(#[serde(with = "super::float_repr")] f64);

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(values: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            if value.is_finite() {
                seq.serialize_element(value)?;
            } else {
                seq.serialize_element(&super::float_repr::encode(*value))?;
            }
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let items = Vec::<Item>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|item| item.0).collect())
    }
}
