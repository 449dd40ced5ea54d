use crate::error::TransportError;
use crate::value::{Column, ColumnData, Dtype, Series, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk format through which tables and series are exchanged with a worker.
///
/// Tables and series are never inlined into a call: they're written to files
/// of the exchange directory, and only their paths cross the worker's pipe.
/// The worker runner must understand the format's `name`.
pub trait ExchangeFormat: Send + Sync {
    fn name(&self) -> &'static str;
    fn write_table(&self, path: &Path, table: &Table) -> std::io::Result<()>;
    fn read_table(&self, path: &Path) -> std::io::Result<Table>;
    fn write_series(&self, path: &Path, series: &Series) -> std::io::Result<()>;
    fn read_series(&self, path: &Path) -> std::io::Result<Series>;
}

/// Column-major JSON documents:
/// `{"columns": [{"name": .., "dtype": ..}], "data": [[..cells of column 0..], ..]}`.
/// Series are `{"name": .., "index": [..labels..], "dtype": .., "values": [..cells..]}`.
pub struct JsonExchange;

#[derive(Serialize, Deserialize)]
struct JsonTable {
    columns: Vec<JsonColumn>,
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Serialize, Deserialize)]
struct JsonColumn {
    name: String,
    dtype: Dtype,
}

impl ExchangeFormat for JsonExchange {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write_table(&self, path: &Path, table: &Table) -> std::io::Result<()> {
        let doc = JsonTable {
            columns: table
                .columns()
                .iter()
                .map(|c| JsonColumn {
                    name: c.name.clone(),
                    dtype: c.data.dtype(),
                })
                .collect(),
            data: table.columns().iter().map(|c| c.data.to_json()).collect(),
        };
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, &doc)?;
        Ok(())
    }

    fn read_table(&self, path: &Path) -> std::io::Result<Table> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        let JsonTable { columns, data } = serde_json::from_reader(file)?;

        if columns.len() != data.len() {
            return Err(invalid(format!(
                "table declares {} columns but has data for {}",
                columns.len(),
                data.len()
            )));
        }
        let columns = columns
            .into_iter()
            .zip(data)
            .map(|(JsonColumn { name, dtype }, cells)| {
                ColumnData::from_json(dtype, cells)
                    .map(|data| Column::new(name.clone(), data))
                    .map_err(|err| invalid(format!("column '{name}' {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Table::new(columns).map_err(|err| invalid(err.to_string()))
    }

    fn write_series(&self, path: &Path, series: &Series) -> std::io::Result<()> {
        let doc = JsonSeries {
            name: series.name.clone(),
            index: series.index.clone(),
            dtype: series.data.dtype(),
            values: series.data.to_json(),
        };
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, &doc)?;
        Ok(())
    }

    fn read_series(&self, path: &Path) -> std::io::Result<Series> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        let JsonSeries {
            name,
            index,
            dtype,
            values,
        } = serde_json::from_reader(file)?;

        let data = ColumnData::from_json(dtype, values).map_err(invalid)?;
        Series::new(name, index, data).map_err(|err| invalid(err.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct JsonSeries {
    name: Option<String>,
    index: Vec<String>,
    dtype: Dtype,
    values: Vec<serde_json::Value>,
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

/// Scratch directory of a single call, holding its exchanged tables and series.
/// The directory and its files are removed when dropped.
pub struct ExchangeDir {
    dir: tempfile::TempDir,
    format: Arc<dyn ExchangeFormat>,
    next: usize,
}

impl ExchangeDir {
    pub fn new(parent: &Path, format: Arc<dyn ExchangeFormat>) -> Result<Self, TransportError> {
        let dir = tempfile::Builder::new()
            .prefix("exchange-")
            .tempdir_in(parent)
            .map_err(|source| TransportError::Exchange {
                path: parent.to_path_buf(),
                source,
            })?;

        Ok(Self {
            dir,
            format,
            next: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn format(&self) -> &dyn ExchangeFormat {
        self.format.as_ref()
    }

    /// Encode `value` into its wire representation, writing any tables or
    /// series it contains into the exchange directory.
    pub fn encode(&mut self, value: &Value) -> Result<serde_json::Value, TransportError> {
        use serde_json::{json, Value as J};

        Ok(match value {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => encode_float(*f),
            Value::Str(s) => J::String(s.clone()),
            Value::List(items) => J::Array(
                items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    map.insert(key.clone(), self.encode(item)?);
                }
                json!({ "$map": map })
            }
            Value::Table(table) => self.encode_table(table)?,
            Value::Series(series) => {
                self.stage("$series", |format, path| format.write_series(path, series))?
            }
        })
    }

    /// Write `table` into the exchange directory, returning its `$table` reference.
    pub fn encode_table(&mut self, table: &Table) -> Result<serde_json::Value, TransportError> {
        self.stage("$table", |format, path| format.write_table(path, table))
    }

    fn stage(
        &mut self,
        tag: &str,
        write: impl FnOnce(&dyn ExchangeFormat, &Path) -> std::io::Result<()>,
    ) -> Result<serde_json::Value, TransportError> {
        let path = self.next_path("in");
        write(self.format.as_ref(), &path).map_err(|source| TransportError::Exchange {
            path: path.clone(),
            source,
        })?;

        let Some(reference) = path.to_str() else {
            return Err(TransportError::Protocol(format!(
                "exchange path {} is not valid UTF-8",
                path.display()
            )));
        };
        let mut tagged = serde_json::Map::new();
        tagged.insert(tag.to_string(), serde_json::Value::from(reference));
        Ok(serde_json::Value::Object(tagged))
    }

    /// Decode a wire value returned by a worker, reading referenced tables.
    pub fn decode(&self, value: serde_json::Value) -> Result<Value, TransportError> {
        use serde_json::Value as J;

        Ok(match value {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None if n.is_u64() => {
                    return Err(TransportError::Protocol(format!(
                        "integer {n} is out of int64 range"
                    )))
                }
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => Value::Str(s),
            J::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<_, _>>()?,
            ),
            J::Object(mut object) => {
                let tag = match object.keys().next() {
                    Some(tag) if object.len() == 1 => tag.clone(),
                    _ => return Err(protocol("object without a single type tag", &object)),
                };
                let inner = object.remove(&tag).unwrap_or_default();

                match tag.as_str() {
                    "$map" => self.decode_map(inner)?,
                    "$float" => decode_float(&inner)?,
                    "$table" => self.decode_table(inner)?,
                    "$series" => self.decode_series(inner)?,
                    _ => return Err(TransportError::Protocol(format!("unknown type tag {tag}"))),
                }
            }
        })
    }

    fn decode_map(&self, inner: serde_json::Value) -> Result<Value, TransportError> {
        let serde_json::Value::Object(entries) = inner else {
            return Err(TransportError::Protocol(format!(
                "$map must be an object, not {inner}"
            )));
        };
        let mut map = BTreeMap::new();
        for (key, item) in entries {
            map.insert(key, self.decode(item)?);
        }
        Ok(Value::Map(map))
    }

    fn decode_table(&self, inner: serde_json::Value) -> Result<Value, TransportError> {
        let path = self.reference("$table", inner)?;

        self.format
            .read_table(&path)
            .map(Value::Table)
            .map_err(|source| TransportError::Exchange { path, source })
    }

    fn decode_series(&self, inner: serde_json::Value) -> Result<Value, TransportError> {
        let path = self.reference("$series", inner)?;

        self.format
            .read_series(&path)
            .map(Value::Series)
            .map_err(|source| TransportError::Exchange { path, source })
    }

    fn reference(&self, tag: &str, inner: serde_json::Value) -> Result<PathBuf, TransportError> {
        let path: PathBuf = serde_json::from_value(inner)
            .map_err(|err| TransportError::Protocol(format!("invalid {tag} reference: {err}")))?;

        // Workers may only hand back files from within this call's directory.
        if !path.starts_with(self.dir.path()) {
            return Err(TransportError::Protocol(format!(
                "{tag} reference {} is outside of the exchange directory",
                path.display()
            )));
        }
        Ok(path)
    }

    fn next_path(&mut self, direction: &str) -> PathBuf {
        self.next += 1;
        self.dir
            .path()
            .join(format!("{direction}-{}.{}", self.next, self.format.name()))
    }
}

fn encode_float(f: f64) -> serde_json::Value {
    if f.is_finite() {
        serde_json::Value::from(f)
    } else if f.is_nan() {
        serde_json::json!({"$float": "nan"})
    } else if f > 0.0 {
        serde_json::json!({"$float": "inf"})
    } else {
        serde_json::json!({"$float": "-inf"})
    }
}

fn decode_float(inner: &serde_json::Value) -> Result<Value, TransportError> {
    match inner.as_str() {
        Some("nan") => Ok(Value::Float(f64::NAN)),
        Some("inf") => Ok(Value::Float(f64::INFINITY)),
        Some("-inf") => Ok(Value::Float(f64::NEG_INFINITY)),
        _ => Err(TransportError::Protocol(format!("invalid $float {inner}"))),
    }
}

fn protocol(what: &str, object: &serde_json::Map<String, serde_json::Value>) -> TransportError {
    let keys: Vec<&str> = object.keys().map(String::as_str).collect();
    TransportError::Protocol(format!("{what}: keys {keys:?}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn exchange() -> (tempfile::TempDir, ExchangeDir) {
        let parent = tempfile::tempdir().unwrap();
        let dir = ExchangeDir::new(parent.path(), Arc::new(JsonExchange)).unwrap();
        (parent, dir)
    }

    fn sample_table() -> Table {
        Table::new(vec![
            Column::new("id", ColumnData::Int64(vec![Some(1), Some(2), Some(3)])),
            Column::new("score", ColumnData::Float64(vec![Some(0.5), None, Some(2.25)])),
            Column::new("ok", ColumnData::Bool(vec![Some(true), Some(false), None])),
            Column::new(
                "label",
                ColumnData::Utf8(vec![Some("a".to_string()), None, Some("c".to_string())]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_tables_are_passed_by_reference() {
        let (_parent, mut exchange) = exchange();

        let wire = exchange.encode(&Value::Table(sample_table())).unwrap();
        let path = wire["$table"].as_str().unwrap().to_string();

        assert!(path.starts_with(exchange.path().to_str().unwrap()));
        assert!(path.ends_with("in-1.json"));
        // Only the reference is inlined.
        assert_eq!(wire.as_object().unwrap().len(), 1);

        let decoded = exchange.decode(wire).unwrap();
        assert_eq!(decoded, Value::Table(sample_table()));
    }

    #[test]
    fn test_table_file_preserves_column_order_and_dtypes() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("t.json");
        let table = sample_table();

        JsonExchange.write_table(&path, &table).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        insta::assert_json_snapshot!(raw["columns"], @r###"
        [
          {
            "dtype": "int64",
            "name": "id"
          },
          {
            "dtype": "float64",
            "name": "score"
          },
          {
            "dtype": "bool",
            "name": "ok"
          },
          {
            "dtype": "utf8",
            "name": "label"
          }
        ]
        "###);

        let back = JsonExchange.read_table(&path).unwrap();
        assert_eq!(back.schema(), table.schema());
        assert_eq!(back, table);
    }

    #[test]
    fn test_scalar_and_nested_encoding() {
        let (_parent, mut exchange) = exchange();

        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(1.0),
            Value::Float(f64::NEG_INFINITY),
            Value::Str("s".to_string()),
            Value::Map(BTreeMap::from([("k".to_string(), Value::Int(1))])),
        ]);
        let wire = exchange.encode(&value).unwrap();

        assert_eq!(
            wire,
            json!([null, true, -7, 1.0, {"$float": "-inf"}, "s", {"$map": {"k": 1}}])
        );
        assert_eq!(exchange.decode(wire).unwrap(), value);

        // NaN never equals itself, so check it separately.
        let nan = exchange.decode(json!({"$float": "nan"})).unwrap();
        assert!(matches!(nan, Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_series_are_passed_by_reference() {
        let (_parent, mut exchange) = exchange();
        let series = Series::new(
            Some("total".to_string()),
            vec!["a".to_string(), "b".to_string()],
            ColumnData::Int64(vec![Some(6), None]),
        )
        .unwrap();

        // A table takes the first file, and the series the second.
        exchange.encode(&Value::Table(sample_table())).unwrap();
        let wire = exchange.encode(&Value::Series(series.clone())).unwrap();
        let path = wire["$series"].as_str().unwrap().to_string();
        assert!(path.ends_with("in-2.json"), "{path}");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            raw,
            json!({"name": "total", "index": ["a", "b"], "dtype": "int64", "values": [6, null]})
        );

        let decoded = exchange.decode(wire).unwrap();
        assert_eq!(decoded, Value::Series(series));
    }

    #[test]
    fn test_malformed_wire_values() {
        let (_parent, exchange) = exchange();

        for wire in [
            json!({"plain": "object"}),
            json!({"$map": 1}),
            json!({"$float": "huge"}),
            json!({"$table": "/etc/passwd"}),
            json!({"$series": {"index": ["a"], "dtype": "bool", "values": []}}),
            json!({"$series": "/etc/passwd"}),
            json!(18446744073709551615u64),
        ] {
            let err = exchange.decode(wire.clone()).unwrap_err();
            assert!(
                matches!(err, TransportError::Protocol(_)),
                "{wire} => {err:?}"
            );
        }
    }
}
