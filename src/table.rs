use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// A single table cell.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        if v.is_nan() {
            Value::Missing
        } else {
            Value::Float(v)
        }
    }
}
impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        v.map(Value::from).unwrap_or(Value::Missing)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}
impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        v.map(Value::from).unwrap_or(Value::Missing)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Missing => Ok(()),
        }
    }
}

pub type Row = BTreeMap<String, Value>;

/// Rows keyed by column name; `columns` fixes the output order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn with_columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows: Vec::new(),
        }
    }
    /// Appends a row; columns not in `values` are stored as missing.
    pub fn push<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut row: Row = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for column in &self.columns {
            row.entry(column.clone()).or_insert(Value::Missing);
        }
        self.rows.push(row);
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn column(&self, name: &str) -> Vec<&Value> {
        self.rows.iter().filter_map(|r| r.get(name)).collect()
    }
    /// Rows whose `cell` column equals `cell`.
    pub fn rows_for_cell(&self, cell: u32) -> impl Iterator<Item = &Row> {
        self.rows
            .iter()
            .filter(move |r| r.get("cell") == Some(&Value::Int(cell as i64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn missing_columns_are_filled() {
        let mut table = Table::with_columns(&["cell", "rate", "type"]);
        table.push([("cell", Value::from(3u32)), ("rate", Value::from(12.5))]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0]["type"], Value::Missing);
        assert_eq!(table.rows_for_cell(3).count(), 1);
        assert_eq!(table.column("rate")[0].as_f64(), Some(12.5));
    }
    #[test]
    fn nan_becomes_missing() {
        assert_eq!(Value::from(f64::NAN), Value::Missing);
        assert_eq!(Value::Missing.to_string(), "");
    }
}
