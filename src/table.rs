use crate::errors::{AppError, AppResult};
use std::collections::BTreeMap;

/// Marker for a column that was not part of an emitted record.
pub const MISSING: f64 = f64::NAN;

/// One field of an emitted record: a single sample or a whole vector of samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Value {
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Array(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_slice(&self) -> &[f64] {
        match self {
            Self::Scalar(value) => std::slice::from_ref(value),
            Self::Array(values) => values,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Self::Array(values)
    }
}

impl From<&[f64]> for Value {
    fn from(values: &[f64]) -> Self {
        Self::Array(values.to_vec())
    }
}

/// A partial result keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<Value>) {
        self.fields.insert(column.to_string(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Row count this record expands to: the longest value, scalars counting as one.
    pub fn size(&self) -> usize {
        self.fields.values().map(Value::len).max().unwrap_or(0)
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Record {
    fn from(entries: [(&str, Value); N]) -> Self {
        let mut record = Record::new();
        for (column, value) in entries {
            record.insert(column, value);
        }
        record
    }
}

/// Expands `record` into fixed-width rows over `columns`.
///
/// Each present column fills rows from index 0 and is padded with [`MISSING`]
/// past its own length; absent columns are entirely [`MISSING`]. Keys outside
/// `columns` are rejected.
pub fn normalize(columns: &[String], record: &Record) -> AppResult<Vec<Vec<f64>>> {
    if let Some(unknown) = record.columns().find(|name| !columns.iter().any(|c| c == name)) {
        return Err(AppError::InvalidInput(format!(
            "emitted column '{unknown}' is not one of the data columns"
        )));
    }
    let size = record.size();
    let mut rows = vec![vec![MISSING; columns.len()]; size];
    for (index, column) in columns.iter().enumerate() {
        let Some(value) = record.get(column) else {
            continue;
        };
        for (row, sample) in rows.iter_mut().zip(value.as_slice()) {
            row[index] = *sample;
        }
    }
    Ok(rows)
}

/// Carries forward the existing samples of every column `record` does not name,
/// so that a clearing emit only replaces the columns it mentions.
pub fn retain_unlisted(current: &ResultTable, record: &Record) -> Record {
    let mut merged = record.clone();
    if current.is_empty() {
        return merged;
    }
    for (column, values) in current.columns.iter().zip(&current.data) {
        if !record.contains(column) {
            merged.insert(column, values.clone());
        }
    }
    merged
}

/// Column-aligned numeric results; every column always has `len()` samples.
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    columns: Vec<String>,
    data: Vec<Vec<f64>>,
}

impl ResultTable {
    pub fn new(columns: &[String]) -> Self {
        Self {
            columns: columns.to_vec(),
            data: vec![Vec::new(); columns.len()],
        }
    }

    pub fn from_columns(columns: Vec<String>, data: Vec<Vec<f64>>) -> AppResult<Self> {
        if columns.len() != data.len() {
            return Err(AppError::Format(format!(
                "{} column names for {} columns",
                columns.len(),
                data.len()
            )));
        }
        let rows = data.first().map(Vec::len).unwrap_or(0);
        if data.iter().any(|column| column.len() != rows) {
            return Err(AppError::Format("columns have unequal lengths".to_string()));
        }
        Ok(Self { columns, data })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|index| self.data[index].as_slice())
    }

    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.len() {
            return None;
        }
        Some(self.data.iter().map(|column| column[index]).collect())
    }

    pub fn append_rows(&mut self, rows: &[Vec<f64>]) -> AppResult<()> {
        if let Some(bad) = rows.iter().find(|row| row.len() != self.columns.len()) {
            return Err(AppError::InvalidInput(format!(
                "row has {} values for {} columns",
                bad.len(),
                self.columns.len()
            )));
        }
        for row in rows {
            for (column, sample) in self.data.iter_mut().zip(row) {
                column.push(*sample);
            }
        }
        Ok(())
    }

    pub fn append_record(&mut self, record: &Record) -> AppResult<usize> {
        let rows = normalize(&self.columns, record)?;
        self.append_rows(&rows)?;
        Ok(rows.len())
    }

    pub fn extend(&mut self, other: &ResultTable) -> AppResult<()> {
        if other.columns != self.columns {
            return Err(AppError::Format("cannot extend a table with different columns".to_string()));
        }
        for (column, more) in self.data.iter_mut().zip(&other.data) {
            column.extend_from_slice(more);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for column in &mut self.data {
            column.clear();
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.columns.iter().cloned().zip(self.data.iter().cloned()).collect()
    }

    pub(crate) fn raw_columns(&self) -> &[Vec<f64>] {
        &self.data
    }
}

/// NaN compares equal to NaN so that tables survive a storage round trip.
impl PartialEq for ResultTable {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.data.len() == other.data.len()
            && self.data.iter().zip(&other.data).all(|(left, right)| {
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right)
                        .all(|(a, b)| a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize, retain_unlisted, Record, ResultTable, Value};

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn vector_record_fills_missing_columns_with_nan() {
        let record = Record::from([("I1", Value::from(vec![1.0, 2.0, 3.0]))]);
        let rows = normalize(&columns(&["I1", "Q1"]), &record).expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().map(|r| r[0]).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
        assert!(rows.iter().all(|r| r[1].is_nan()));
    }

    #[test]
    fn shorter_values_are_padded_not_dropped() {
        let record = Record::new()
            .with("frequency", vec![1.0, 2.0, 3.0, 4.0])
            .with("bias I1", 0.5);
        let mut table = ResultTable::new(&columns(&["bias I1", "frequency", "Q1"]));
        let added = table.append_record(&record).expect("append");
        assert_eq!(added, 4);
        let bias = table.column("bias I1").expect("bias");
        assert_eq!(bias[0], 0.5);
        assert!(bias[1..].iter().all(|v| v.is_nan()));
        assert_eq!(table.column("Q1").expect("q").len(), 4);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let record = Record::new().with("I9", 1.0);
        assert!(normalize(&columns(&["I1"]), &record).is_err());
    }

    #[test]
    fn empty_record_produces_no_rows() {
        let rows = normalize(&columns(&["I1"]), &Record::new()).expect("rows");
        assert!(rows.is_empty());
    }

    #[test]
    fn clearing_keeps_columns_the_record_does_not_name() {
        let mut table = ResultTable::new(&columns(&["t", "phase", "frequency"]));
        table
            .append_record(&Record::new().with("t", vec![0.0, 1.0]).with("frequency", vec![10.0, 20.0]))
            .expect("append");
        let merged = retain_unlisted(&table, &Record::new().with("t", vec![5.0, 6.0, 7.0]));
        let mut cleared = ResultTable::new(table.columns());
        cleared.append_record(&merged).expect("append");
        assert_eq!(cleared.column("t").expect("t"), &[5.0, 6.0, 7.0]);
        assert_eq!(&cleared.column("frequency").expect("f")[..2], &[10.0, 20.0]);
        assert!(cleared.column("frequency").expect("f")[2].is_nan());
    }

    #[test]
    fn tables_with_nan_compare_equal() {
        let mut left = ResultTable::new(&columns(&["a", "b"]));
        left.append_rows(&[vec![1.0, f64::NAN]]).expect("append");
        let right = left.clone();
        assert_eq!(left, right);
        assert!(left.append_rows(&[vec![1.0]]).is_err());
    }
}
