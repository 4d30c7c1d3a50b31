use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IndicatorKind {
    Integer,
    Float { precision: usize },
    Boolean,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum IndicatorValue {
    Integer(i64),
    Float(#[serde(with = "crate::parameters::float_repr")] f64),
    Boolean(bool),
    Text(String),
}

impl From<i64> for IndicatorValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for IndicatorValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for IndicatorValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for IndicatorValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndicatorValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A value reported by a running procedure and shown read-only to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    name: String,
    label: String,
    kind: IndicatorKind,
    units: Option<String>,
    default: Option<IndicatorValue>,
    value: Option<IndicatorValue>,
}

impl Indicator {
    fn new(name: &str, label: &str, kind: IndicatorKind) -> Self {
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
        Self::new(name, label, IndicatorKind::Integer)
    }

    pub fn float(name: &str, label: &str, precision: usize) -> Self {
        Self::new(name, label, IndicatorKind::Float { precision: precision.max(1) })
    }

    pub fn boolean(name: &str, label: &str) -> Self {
        Self::new(name, label, IndicatorKind::Boolean)
    }

    pub fn text(name: &str, label: &str) -> Self {
        Self::new(name, label, IndicatorKind::Text)
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn default_value(mut self, value: impl Into<IndicatorValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> AppResult<&IndicatorValue> {
        self.value
            .as_ref()
            .ok_or_else(|| AppError::InvalidInput(format!("indicator '{}' value is not set", self.name)))
    }

    /// Stores `value` converted to this indicator's type and returns the stored value.
    pub fn set(&mut self, value: IndicatorValue) -> AppResult<IndicatorValue> {
        let coerced = self.coerce(value)?;
        self.value = Some(coerced.clone());
        Ok(coerced)
    }

    fn reset(&mut self) -> AppResult<()> {
        self.value = match self.default.clone() {
            Some(default) => Some(self.coerce(default)?),
            None => None,
        };
        Ok(())
    }

    fn coerce(&self, value: IndicatorValue) -> AppResult<IndicatorValue> {
        let invalid = |value: &IndicatorValue| {
            AppError::InvalidInput(format!(
                "indicator '{}' of kind {:?} given incompatible value {:?}",
                self.name, self.kind, value
            ))
        };
        match (self.kind, value) {
            (IndicatorKind::Integer, IndicatorValue::Integer(v)) => Ok(IndicatorValue::Integer(v)),
            (IndicatorKind::Integer, IndicatorValue::Float(v)) if v.is_finite() => {
                Ok(IndicatorValue::Integer(v.trunc() as i64))
            }
            (IndicatorKind::Integer, IndicatorValue::Boolean(v)) => Ok(IndicatorValue::Integer(i64::from(v))),
            (IndicatorKind::Integer, IndicatorValue::Text(text)) => text
                .trim()
                .parse::<i64>()
                .map(IndicatorValue::Integer)
                .map_err(|_| invalid(&IndicatorValue::Text(text))),
            (IndicatorKind::Float { .. }, IndicatorValue::Float(v)) => Ok(IndicatorValue::Float(v)),
            (IndicatorKind::Float { .. }, IndicatorValue::Integer(v)) => Ok(IndicatorValue::Float(v as f64)),
            (IndicatorKind::Float { .. }, IndicatorValue::Text(text)) => text
                .trim()
                .parse::<f64>()
                .map(IndicatorValue::Float)
                .map_err(|_| invalid(&IndicatorValue::Text(text))),
            (IndicatorKind::Boolean, IndicatorValue::Boolean(v)) => Ok(IndicatorValue::Boolean(v)),
            (IndicatorKind::Boolean, IndicatorValue::Integer(v)) => Ok(IndicatorValue::Boolean(v != 0)),
            (IndicatorKind::Boolean, IndicatorValue::Float(v)) => Ok(IndicatorValue::Boolean(v != 0.0)),
            (IndicatorKind::Text, IndicatorValue::Text(v)) => Ok(IndicatorValue::Text(v)),
            (IndicatorKind::Text, other) => Ok(IndicatorValue::Text(display_raw(&other))),
            (_, other) => Err(invalid(&other)),
        }
    }
}

fn display_raw(value: &IndicatorValue) -> String {
    match value {
        IndicatorValue::Integer(v) => v.to_string(),
        IndicatorValue::Float(v) => v.to_string(),
        IndicatorValue::Boolean(v) => v.to_string(),
        IndicatorValue::Text(v) => v.clone(),
    }
}

fn format_float(value: f64, precision: usize) -> String {
    let rendered = value.to_string();
    let n_before = rendered.split('.').next().map(str::len).unwrap_or(0);
    if n_before < precision {
        format!("{:.*}", precision - n_before, value)
    } else {
        format!("{:.*E}", precision - 1, value)
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(value) = &self.value else {
            return Ok(());
        };
        let rendered = match (self.kind, value) {
            (IndicatorKind::Float { precision }, IndicatorValue::Float(v)) => format_float(*v, precision),
            (_, other) => display_raw(other),
        };
        match (&self.units, self.kind) {
            (Some(units), IndicatorKind::Integer | IndicatorKind::Float { .. }) => {
                write!(f, "{rendered} {units}")
            }
            _ => f.write_str(&rendered),
        }
    }
}

/// The indicators of one procedure instance, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    indicators: Vec<Indicator>,
}

impl Indicators {
    pub(crate) fn from_declared(declared: &[Indicator]) -> AppResult<Self> {
        let mut indicators = declared.to_vec();
        for indicator in &mut indicators {
            indicator.reset()?;
        }
        Ok(Self { indicators })
    }

    pub fn get(&self, name: &str) -> Option<&Indicator> {
        self.indicators.iter().find(|i| i.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter()
    }

    pub fn set(&mut self, name: &str, value: IndicatorValue) -> AppResult<IndicatorValue> {
        self.indicators
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown indicator '{name}'")))?
            .set(value)
    }

    pub fn reset(&mut self) -> AppResult<()> {
        for indicator in &mut self.indicators {
            indicator.reset()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Indicator, IndicatorValue, Indicators};

    #[test]
    fn float_display_switches_to_scientific() {
        let mut indicator = Indicator::float("temp", "Temperature", 3).units("mK");
        indicator.set(IndicatorValue::Float(1.5)).expect("set");
        assert_eq!(indicator.to_string(), "1.50 mK");
        indicator.set(IndicatorValue::Float(12345.0)).expect("set");
        assert_eq!(indicator.to_string(), "1.23E4 mK");
    }

    #[test]
    fn integer_indicator_coerces_and_rejects() {
        let mut indicator = Indicator::integer("count", "Pulses").units("#");
        indicator.set(IndicatorValue::Float(4.7)).expect("truncates");
        assert_eq!(indicator.to_string(), "4 #");
        assert!(indicator.set(IndicatorValue::Text("many".to_string())).is_err());
    }

    #[test]
    fn unset_indicator_is_blank_and_errors_on_read() {
        let indicator = Indicator::boolean("locked", "Locked");
        assert_eq!(indicator.to_string(), "");
        assert!(indicator.value().is_err());
    }

    #[test]
    fn collection_resets_to_defaults() {
        let declared = vec![
            Indicator::integer("count", "Count").default_value(0_i64),
            Indicator::text("stage", "Stage"),
        ];
        let mut indicators = Indicators::from_declared(&declared).expect("indicators");
        indicators.set("count", IndicatorValue::Integer(9)).expect("set");
        indicators.reset().expect("reset");
        assert_eq!(indicators.get("count").and_then(|i| i.value().ok()), Some(&IndicatorValue::Integer(0)));
        assert!(!indicators.get("stage").expect("stage").is_set());
        assert!(indicators.set("missing", IndicatorValue::Boolean(true)).is_err());
    }
}
