//! Artifact loaders
//!
//! [`FileLoader`] is the boundary to the file grammars. The ensemble only
//! relies on its contract: a pure read that yields a [`Record`], or a
//! [`LoadError::NotFound`] / [`LoadError::Decode`].
//!
//! [`DefaultLoader`] covers the generic formats with the Arrow stack:
//! - CSV through `arrow::csv` (header row, schema inference)
//! - Parquet through `parquet::arrow`
//! - key-value and single-value text files
//! - flat JSON objects through `serde_json`
//! - the job status file, as a table of jobs

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, Schema, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
};
use arrow::record_batch::RecordBatch;

use crate::config::{ArtifactSpec, FileFormat};
use crate::error::LoadError;
use crate::jobs;
use crate::record::{IndexKey, Record, ScalarSet, TimeRow, TimeTable, Value};

/// Parses one artifact file into a typed record.
///
/// Implementations must be side-effect free; the realization cache relies on
/// a load being safe to run on any blocking thread.
pub trait FileLoader: Send + Sync {
    /// Load the file at `path` according to `spec.format`.
    ///
    /// # Errors
    ///
    /// - [`LoadError::NotFound`] if the file does not exist
    /// - [`LoadError::Decode`] if the content is malformed
    fn load(&self, path: &Path, spec: &ArtifactSpec) -> Result<Record, LoadError>;
}

/// Loader for all [`FileFormat`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLoader {
    _private: (),
}

impl DefaultLoader {
    /// Create a new loader
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl FileLoader for DefaultLoader {
    fn load(&self, path: &Path, spec: &ArtifactSpec) -> Result<Record, LoadError> {
        match spec.format {
            FileFormat::Csv => load_csv(path, spec.index_column.as_deref()).map(Record::TimeTable),
            FileFormat::Parquet => {
                load_parquet(path, spec.index_column.as_deref()).map(Record::TimeTable)
            }
            FileFormat::KeyValue => load_key_value(path).map(Record::ScalarSet),
            FileFormat::Scalar => load_scalar(path, &spec.name).map(Record::ScalarSet),
            FileFormat::Json => load_json(path).map(Record::ScalarSet),
            FileFormat::Status => {
                let text = read_text(path)?;
                jobs::status_table(&jobs::parse_status(&text))
                    .map(Record::TimeTable)
                    .map_err(|e| LoadError::decode(path, e))
            }
        }
    }
}

fn open(path: &Path) -> Result<File, LoadError> {
    File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoadError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            LoadError::decode(path, e)
        }
    })
}

fn read_text(path: &Path) -> Result<String, LoadError> {
    let mut text = String::new();
    open(path)?
        .read_to_string(&mut text)
        .map_err(|e| LoadError::decode(path, e))?;
    Ok(text)
}

fn load_csv(path: &Path, index_column: Option<&str>) -> Result<TimeTable, LoadError> {
    use arrow::csv::reader::Format;
    use arrow::csv::ReaderBuilder;

    let mut file = open(path)?;
    let len = file.metadata().map_err(|e| LoadError::decode(path, e))?.len();
    if len == 0 {
        return Err(LoadError::decode(path, "file is empty"));
    }

    let format = Format::default().with_header(true);
    let (schema, _) = format
        .infer_schema(&mut file, None)
        .map_err(|e| LoadError::decode(path, e))?;
    file.rewind().map_err(|e| LoadError::decode(path, e))?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_format(format)
        .build(file)
        .map_err(|e| LoadError::decode(path, e))?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoadError::decode(path, e))?;

    batches_to_table(path, &schema, &batches, index_column)
}

fn load_parquet(path: &Path, index_column: Option<&str>) -> Result<TimeTable, LoadError> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let file = open(path)?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| LoadError::decode(path, e))?;
    let schema = Arc::clone(builder.schema());
    let reader = builder.build().map_err(|e| LoadError::decode(path, e))?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoadError::decode(path, e))?;

    batches_to_table(path, &schema, &batches, index_column)
}

/// Convert Arrow batches into a time table.
///
/// Without an index column the key is the row position across all batches.
pub(crate) fn batches_to_table(
    path: &Path,
    schema: &Schema,
    batches: &[RecordBatch],
    index_column: Option<&str>,
) -> Result<TimeTable, LoadError> {
    let index_pos = match index_column {
        Some(name) => Some(schema.index_of(name).map_err(|_| {
            LoadError::decode(path, format!("index column '{name}' not found"))
        })?),
        None => None,
    };

    let columns: Vec<String> = schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(pos, _)| Some(*pos) != index_pos)
        .map(|(_, f)| f.name().clone())
        .collect();

    let mut rows = Vec::new();
    let mut position: i64 = 0;
    for batch in batches {
        let mut cells = Vec::with_capacity(batch.num_columns());
        for (pos, array) in batch.columns().iter().enumerate() {
            let values = array_values(array).map_err(|reason| {
                LoadError::decode(path, format!("column '{}': {reason}", schema.field(pos).name()))
            })?;
            cells.push(values);
        }

        for row in 0..batch.num_rows() {
            let index = match index_pos {
                Some(pos) => {
                    let cell = cells[pos][row].as_ref().ok_or_else(|| {
                        LoadError::decode(path, format!("row {row}: index value is missing"))
                    })?;
                    IndexKey::from_value(cell).ok_or_else(|| {
                        LoadError::decode(
                            path,
                            format!("row {row}: '{cell}' is not a step, date or datetime"),
                        )
                    })?
                }
                None => IndexKey::Step(position),
            };
            let values = cells
                .iter_mut()
                .enumerate()
                .filter(|(pos, _)| Some(*pos) != index_pos)
                .map(|(_, column)| column[row].take())
                .collect();
            rows.push(TimeRow { index, values });
            position += 1;
        }
    }

    let index_name = index_column.map(str::to_string);
    TimeTable::new(index_name, columns, rows).map_err(|e| LoadError::decode(path, e))
}

/// Materialize one Arrow column as nullable values.
///
/// Unsigned integers beyond `i64::MAX` are rejected rather than nulled.
fn array_values(array: &ArrayRef) -> Result<Vec<Option<Value>>, String> {
    use arrow::compute::{cast, cast_with_options, CastOptions};

    let len = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![None; len],
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let strict = CastOptions {
                safe: false,
                ..CastOptions::default()
            };
            let cast = cast_with_options(array, &DataType::Int64, &strict)
                .map_err(|e| e.to_string())?;
            let ints = cast.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| ints.is_valid(i).then(|| Value::Integer(ints.value(i))))
                .collect()
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let cast = cast(array, &DataType::Float64).map_err(|e| e.to_string())?;
            let floats = cast.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| floats.is_valid(i).then(|| Value::Float(floats.value(i))))
                .collect()
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let cast = cast(array, &DataType::Utf8).map_err(|e| e.to_string())?;
            let strings = cast.as_string::<i32>();
            (0..len)
                .map(|i| {
                    strings
                        .is_valid(i)
                        .then(|| Value::Text(strings.value(i).to_string()))
                })
                .collect()
        }
        DataType::Boolean => {
            let bools = array.as_boolean();
            (0..len)
                .map(|i| bools.is_valid(i).then(|| Value::Boolean(bools.value(i))))
                .collect()
        }
        DataType::Date32 | DataType::Date64 => {
            let cast = cast(array, &DataType::Date32).map_err(|e| e.to_string())?;
            let dates = cast.as_primitive::<Date32Type>();
            (0..len)
                .map(|i| {
                    if dates.is_valid(i) {
                        dates.value_as_date(i).map(Value::Date)
                    } else {
                        None
                    }
                })
                .collect()
        }
        DataType::Timestamp(unit, _) => {
            let datetime = |i: usize| match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(i),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(i),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(i),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(i),
            };
            (0..len)
                .map(|i| {
                    if array.is_valid(i) {
                        datetime(i).map(Value::DateTime)
                    } else {
                        None
                    }
                })
                .collect()
        }
        other => return Err(format!("unsupported column type {other}")),
    };
    Ok(values)
}

fn load_key_value(path: &Path) -> Result<ScalarSet, LoadError> {
    let text = read_text(path)?;
    let mut set = ScalarSet::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
            return Err(LoadError::decode(
                path,
                format!("line {}: expected '<key> <value>', got '{line}'", lineno + 1),
            ));
        };
        // Values with spaces are not supported, trailing tokens are ignored
        set.insert(key, Value::parse(value));
    }
    Ok(set)
}

fn load_scalar(path: &Path, name: &str) -> Result<ScalarSet, LoadError> {
    let text = read_text(path)?;
    // Empty files exist, with an empty string as value
    let value = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map_or_else(|| Value::Text(String::new()), Value::parse);
    let mut set = ScalarSet::new();
    set.insert(name, value);
    Ok(set)
}

fn load_json(path: &Path) -> Result<ScalarSet, LoadError> {
    let text = read_text(path)?;
    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| LoadError::decode(path, e))?;
    let serde_json::Value::Object(members) = parsed else {
        return Err(LoadError::decode(path, "expected a JSON object"));
    };

    let mut set = ScalarSet::new();
    for (key, member) in members {
        let value = match member {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(LoadError::decode(
                    path,
                    format!("member '{key}' is not a scalar"),
                ));
            }
        };
        set.insert(key, value);
    }
    Ok(set)
}
