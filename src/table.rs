//! Ensemble-wide result tables
//!
//! [`CombinedTable`] and [`SummaryTable`] are the only values crossing the
//! outward boundary. Both are flat and row-oriented with named columns, and
//! `None` is the absent marker. They convert to Arrow `RecordBatch` for any
//! Arrow-aware consumer and write to Parquet.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Date32Type, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use serde::Serialize;

use crate::record::{IndexKey, Value, ValueKind};
use crate::stats::Statistic;
use crate::{Error, Result};

/// Name of the realization column in exported tables.
pub const REALIZATION_COLUMN: &str = "REAL";

/// Name used for a positional index that has no column of its own.
pub const DEFAULT_INDEX_COLUMN: &str = "STEP";

/// Name of the column tagging rows with their ensemble in a stacked table.
pub const ENSEMBLE_COLUMN: &str = "ENSEMBLE";

/// Value column of a combined table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Merged kind, `None` if no realization ever had a value
    pub kind: Option<ValueKind>,
}

/// One row of a combined table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRow {
    /// Contributing realization
    pub realization: u32,
    /// Row key, `None` for key-value artifacts
    pub index: Option<IndexKey>,
    /// Cells aligned with [`CombinedTable::columns`]
    pub values: Vec<Option<Value>>,
}

/// One artifact merged across realizations.
///
/// Rows are grouped by realization ascending, then by index key ascending.
/// Tables stacked from several ensembles repeat that grouping once per
/// ensemble, in [`ENSEMBLE_COLUMN`] order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedTable {
    artifact: String,
    index_name: Option<String>,
    keyed: bool,
    columns: Vec<Column>,
    rows: Vec<CombinedRow>,
}

impl CombinedTable {
    pub(crate) fn new(
        artifact: impl Into<String>,
        index_name: Option<String>,
        keyed: bool,
        columns: Vec<Column>,
        rows: Vec<CombinedRow>,
    ) -> Self {
        Self {
            artifact: artifact.into(),
            index_name,
            keyed,
            columns,
            rows,
        }
    }

    /// Table with no contributors.
    #[must_use]
    pub fn empty(artifact: impl Into<String>) -> Self {
        Self::new(artifact, None, false, Vec::new(), Vec::new())
    }

    /// Artifact this table was built from.
    #[must_use]
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Label of the index column: the source column name, `STEP` for
    /// positional keys, `None` for key-value artifacts.
    #[must_use]
    pub fn index_label(&self) -> Option<&str> {
        self.keyed
            .then(|| self.index_name.as_deref().unwrap_or(DEFAULT_INDEX_COLUMN))
    }

    /// Index column name as read from the artifact files.
    #[must_use]
    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    /// Value columns.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Value column names.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Position of a value column.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[CombinedRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether no realization contributed rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct contributing realizations, ascending.
    #[must_use]
    pub fn realizations(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.rows.iter().map(|r| r.realization).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Rows of one realization.
    pub fn rows_for(&self, realization: u32) -> impl Iterator<Item = &CombinedRow> {
        self.rows
            .iter()
            .filter(move |r| r.realization == realization)
    }

    /// Cell lookup by row position and column name.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let pos = self.column_position(column)?;
        self.rows.get(row)?.values[pos].as_ref()
    }

    /// Export as an Arrow record batch with `REAL`, the index column (when
    /// keyed) and every value column, all nullable except `REAL`.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the assembled columns
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let rows: Vec<&CombinedRow> = self.rows.iter().collect();
        self.build_batch(&rows, true, self.index_label())
    }

    /// Write the whole table to a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_parquet_batch(path.as_ref(), &self.to_record_batch()?)
    }

    /// Write one realization's rows as CSV readable by
    /// [`DefaultLoader`](crate::loader::DefaultLoader).
    ///
    /// The index column is written only when it came from a named column, so
    /// positional keys are reproduced by row order on re-read.
    ///
    /// # Errors
    ///
    /// Returns error if the realization has no rows or writing fails
    pub fn write_realization_csv<W: Write>(&self, realization: u32, writer: W) -> Result<()> {
        let rows: Vec<&CombinedRow> = self.rows_for(realization).collect();
        if rows.is_empty() {
            return Err(Error::InvalidInput(format!(
                "realization {realization} has no rows in '{}'",
                self.artifact
            )));
        }
        let index = if self.keyed {
            self.index_name.as_deref()
        } else {
            None
        };
        let batch = self.build_batch(&rows, false, index)?;
        let mut csv = arrow::csv::WriterBuilder::new()
            .with_header(true)
            .build(writer);
        csv.write(&batch)?;
        Ok(())
    }

    fn build_batch(
        &self,
        rows: &[&CombinedRow],
        with_realization: bool,
        index_label: Option<&str>,
    ) -> Result<RecordBatch> {
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();

        if with_realization {
            fields.push(Field::new(REALIZATION_COLUMN, DataType::Int64, false));
            arrays.push(Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| i64::from(r.realization)),
            )));
        }

        if let Some(label) = index_label {
            let keys: Vec<Option<IndexKey>> = rows.iter().map(|r| r.index).collect();
            let (data_type, array) = index_array(&keys);
            fields.push(Field::new(label, data_type, true));
            arrays.push(array);
        }

        for (pos, column) in self.columns.iter().enumerate() {
            let cells: Vec<Option<&Value>> = rows.iter().map(|r| r.values[pos].as_ref()).collect();
            let (data_type, array) = value_array(column.kind, &cells);
            fields.push(Field::new(&column.name, data_type, true));
            arrays.push(array);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

fn index_array(keys: &[Option<IndexKey>]) -> (DataType, ArrayRef) {
    match keys.iter().flatten().next() {
        Some(IndexKey::Date(_)) => (
            DataType::Date32,
            Arc::new(Date32Array::from_iter(keys.iter().map(|k| match k {
                Some(IndexKey::Date(d)) => Some(Date32Type::from_naive_date(*d)),
                _ => None,
            }))),
        ),
        Some(IndexKey::DateTime(_)) => (
            DataType::Timestamp(TimeUnit::Microsecond, None),
            Arc::new(TimestampMicrosecondArray::from_iter(keys.iter().map(|k| match k {
                Some(IndexKey::DateTime(dt)) => Some(dt.and_utc().timestamp_micros()),
                _ => None,
            }))),
        ),
        _ => (
            DataType::Int64,
            Arc::new(Int64Array::from_iter(keys.iter().map(|k| match k {
                Some(IndexKey::Step(s)) => Some(*s),
                _ => None,
            }))),
        ),
    }
}

fn value_array(kind: Option<ValueKind>, cells: &[Option<&Value>]) -> (DataType, ArrayRef) {
    match kind {
        Some(ValueKind::Integer) => (
            DataType::Int64,
            Arc::new(Int64Array::from_iter(cells.iter().map(|c| match c {
                Some(Value::Integer(v)) => Some(*v),
                _ => None,
            }))),
        ),
        Some(ValueKind::Float) => (
            DataType::Float64,
            Arc::new(Float64Array::from_iter(
                cells.iter().map(|c| c.and_then(Value::as_f64)),
            )),
        ),
        Some(ValueKind::Boolean) => (
            DataType::Boolean,
            Arc::new(BooleanArray::from_iter(cells.iter().map(|c| match c {
                Some(Value::Boolean(b)) => Some(*b),
                _ => None,
            }))),
        ),
        Some(ValueKind::Date) => (
            DataType::Date32,
            Arc::new(Date32Array::from_iter(cells.iter().map(|c| match c {
                Some(Value::Date(d)) => Some(Date32Type::from_naive_date(*d)),
                _ => None,
            }))),
        ),
        Some(ValueKind::DateTime) => (
            DataType::Timestamp(TimeUnit::Microsecond, None),
            Arc::new(TimestampMicrosecondArray::from_iter(cells.iter().map(
                |c| match c {
                    Some(Value::DateTime(dt)) => Some(dt.and_utc().timestamp_micros()),
                    _ => None,
                },
            ))),
        ),
        Some(ValueKind::Text) | None => (
            DataType::Utf8,
            Arc::new(StringArray::from_iter(
                cells.iter().map(|c| c.map(ToString::to_string)),
            )),
        ),
    }
}

fn write_parquet_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    use parquet::arrow::ArrowWriter;

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Summary column: one statistic of one source column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryColumn {
    /// Value column of the combined table
    pub source: String,
    /// Statistic computed over realizations
    pub statistic: Statistic,
}

impl SummaryColumn {
    /// Flat column name, e.g. `FOPT_p90`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}_{}", self.source, self.statistic)
    }
}

/// One index key of a summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    /// Row key, `None` for key-value artifacts
    pub index: Option<IndexKey>,
    /// Cells aligned with [`SummaryTable::columns`]
    pub values: Vec<Option<f64>>,
    /// Contributing realizations per source column
    pub counts: Vec<usize>,
}

/// Cross-realization statistics of a combined table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryTable {
    index_label: Option<String>,
    sources: Vec<String>,
    columns: Vec<SummaryColumn>,
    rows: Vec<SummaryRow>,
}

impl SummaryTable {
    pub(crate) fn new(
        index_label: Option<String>,
        sources: Vec<String>,
        columns: Vec<SummaryColumn>,
        rows: Vec<SummaryRow>,
    ) -> Self {
        Self {
            index_label,
            sources,
            columns,
            rows,
        }
    }

    /// Index column label, `None` for key-value artifacts.
    #[must_use]
    pub fn index_label(&self) -> Option<&str> {
        self.index_label.as_deref()
    }

    /// Source columns that were summarized.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Summary columns.
    #[must_use]
    pub fn columns(&self) -> &[SummaryColumn] {
        &self.columns
    }

    /// Rows ordered by index key.
    #[must_use]
    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Look up one cell.
    #[must_use]
    pub fn value(&self, index: Option<IndexKey>, source: &str, statistic: Statistic) -> Option<f64> {
        let col = self
            .columns
            .iter()
            .position(|c| c.source == source && c.statistic == statistic)?;
        self.rows.iter().find(|r| r.index == index)?.values[col]
    }

    /// Number of realizations contributing to `source` at `index`.
    #[must_use]
    pub fn count(&self, index: Option<IndexKey>, source: &str) -> Option<usize> {
        let pos = self.sources.iter().position(|s| s == source)?;
        self.rows.iter().find(|r| r.index == index).map(|r| r.counts[pos])
    }

    /// Export as an Arrow record batch, one Float64 column per summary column.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the assembled columns
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();

        if let Some(label) = &self.index_label {
            let keys: Vec<Option<IndexKey>> = self.rows.iter().map(|r| r.index).collect();
            let (data_type, array) = index_array(&keys);
            fields.push(Field::new(label, data_type, true));
            arrays.push(array);
        }

        for (pos, column) in self.columns.iter().enumerate() {
            fields.push(Field::new(column.name(), DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from_iter(
                self.rows.iter().map(|r| r.values[pos]),
            )));
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Write to a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_parquet_batch(path.as_ref(), &self.to_record_batch()?)
    }
}
