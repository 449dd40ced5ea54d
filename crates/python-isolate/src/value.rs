use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value which may be passed to, or returned from, a model function.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Table(Table),
    Series(Series),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Value::Table(v)
    }
}
impl From<Series> for Value {
    fn from(v: Series) -> Self {
        Value::Series(v)
    }
}

/// Logical type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Int64,
    Float64,
    Bool,
    Utf8,
}

/// Cells of a single column. Missing cells are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Utf8(Vec<Option<String>>),
}

impl ColumnData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ColumnData::Int64(_) => Dtype::Int64,
            ColumnData::Float64(_) => Dtype::Float64,
            ColumnData::Bool(_) => Dtype::Bool,
            ColumnData::Utf8(_) => Dtype::Utf8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells as plain JSON values, with missing cells as `null`.
    /// Non-finite floats have no JSON representation and are also mapped to `null`,
    /// matching the missing-value semantics of float columns in pandas.
    pub fn to_json(&self) -> Vec<serde_json::Value> {
        use serde_json::Value as J;

        match self {
            ColumnData::Int64(v) => v.iter().map(|c| c.map_or(J::Null, J::from)).collect(),
            ColumnData::Float64(v) => v
                .iter()
                .map(|c| match c {
                    Some(f) if f.is_finite() => J::from(*f),
                    _ => J::Null,
                })
                .collect(),
            ColumnData::Bool(v) => v.iter().map(|c| c.map_or(J::Null, J::from)).collect(),
            ColumnData::Utf8(v) => v
                .iter()
                .map(|c| c.as_ref().map_or(J::Null, |s| J::from(s.as_str())))
                .collect(),
        }
    }

    /// Parse cells of the given `dtype` from plain JSON values.
    pub fn from_json(dtype: Dtype, cells: Vec<serde_json::Value>) -> Result<Self, String> {
        fn cell<T>(
            (row, value): (usize, serde_json::Value),
            expect: &str,
            extract: impl Fn(&serde_json::Value) -> Option<T>,
        ) -> Result<Option<T>, String> {
            if value.is_null() {
                return Ok(None);
            }
            extract(&value)
                .map(Some)
                .ok_or_else(|| format!("row {row}: expected {expect}, found {value}"))
        }
        let cells = cells.into_iter().enumerate();

        Ok(match dtype {
            Dtype::Int64 => ColumnData::Int64(
                cells
                    .map(|c| cell(c, "an int64", serde_json::Value::as_i64))
                    .collect::<Result<_, _>>()?,
            ),
            Dtype::Float64 => ColumnData::Float64(
                cells
                    .map(|c| cell(c, "a float64", serde_json::Value::as_f64))
                    .collect::<Result<_, _>>()?,
            ),
            Dtype::Bool => ColumnData::Bool(
                cells
                    .map(|c| cell(c, "a bool", serde_json::Value::as_bool))
                    .collect::<Result<_, _>>()?,
            ),
            Dtype::Utf8 => ColumnData::Utf8(
                cells
                    .map(|c| cell(c, "a string", |v| v.as_str().map(str::to_string)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("column '{column}' has {actual} rows, but the table has {expected}")]
    RaggedColumn {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("series index has {index} labels but {values} values")]
    RaggedIndex { index: usize, values: usize },
}

/// An ordered collection of equal-length, uniquely named columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        let expected = columns.first().map(|c| c.data.len()).unwrap_or_default();

        for (index, column) in columns.iter().enumerate() {
            if column.data.len() != expected {
                return Err(TableError::RaggedColumn {
                    column: column.name.clone(),
                    expected,
                    actual: column.data.len(),
                });
            }
            if columns[..index].iter().any(|c| c.name == column.name) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or_default()
    }

    /// Ordered (name, dtype) pairs of the table's columns.
    pub fn schema(&self) -> Vec<(&str, Dtype)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.data.dtype()))
            .collect()
    }
}

/// A labeled one-dimensional array, as produced by column-wise reductions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: Option<String>,
    pub index: Vec<String>,
    #[serde(flatten)]
    pub data: ColumnData,
}

impl Series {
    pub fn new(
        name: Option<String>,
        index: Vec<String>,
        data: ColumnData,
    ) -> Result<Self, TableError> {
        if index.len() != data.len() {
            return Err(TableError::RaggedIndex {
                index: index.len(),
                values: data.len(),
            });
        }
        Ok(Self { name, index, data })
    }

    /// The value at `label`, if present.
    pub fn get(&self, label: &str) -> Option<Value> {
        let row = self.index.iter().position(|l| l == label)?;

        Some(match &self.data {
            ColumnData::Int64(v) => v[row].map_or(Value::Null, Value::Int),
            ColumnData::Float64(v) => v[row].map_or(Value::Null, Value::Float),
            ColumnData::Bool(v) => v[row].map_or(Value::Null, Value::Bool),
            ColumnData::Utf8(v) => v[row].clone().map_or(Value::Null, Value::Str),
        })
    }
}
