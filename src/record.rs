//! Typed in-memory records parsed from realization artifacts
//!
//! ```text
//! Record ──┬── ScalarSet  (key → Value)          parameters.txt, OK, npv.json
//!          └── TimeTable  (IndexKey → row)        unsmry--monthly.csv, *.parquet
//! ```
//!
//! Cells inside a `TimeTable` are `Option<Value>`: `None` is the absent marker,
//! never zero and never an error.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::{Error, Result};

/// A single scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Whole number
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// True/false flag
    Boolean(bool),
    /// Calendar date
    Date(NaiveDate),
    /// Date and time without timezone
    DateTime(NaiveDateTime),
    /// Free text (also the fallback for unparseable numbers)
    Text(String),
}

impl Value {
    /// Kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Date(_) => ValueKind::Date,
            Self::DateTime(_) => ValueKind::DateTime,
            Self::Text(_) => ValueKind::Text,
        }
    }

    /// Numeric view of the value, `None` for non-numeric kinds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of the value, `None` for non-text kinds.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a token as integer, then float, falling back to text.
    ///
    /// ```rust
    /// use trueno_ensemble::record::Value;
    ///
    /// assert_eq!(Value::parse("42"), Value::Integer(42));
    /// assert_eq!(Value::parse("0.25"), Value::Float(0.25));
    /// assert_eq!(Value::parse("low"), Value::Text("low".into()));
    /// ```
    #[must_use]
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if let Ok(v) = token.parse::<i64>() {
            return Self::Integer(v);
        }
        if let Ok(v) = token.parse::<f64>() {
            return Self::Float(v);
        }
        Self::Text(token.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S")),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Kind of a [`Value`], used for schema reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Whole number
    Integer,
    /// Floating point number
    Float,
    /// True/false flag
    Boolean,
    /// Calendar date
    Date,
    /// Date and time
    DateTime,
    /// Free text
    Text,
}

impl ValueKind {
    /// Combine two kinds observed for the same column.
    ///
    /// Integer and Float widen to Float; any other mix is incompatible.
    #[must_use]
    pub fn merge(self, other: Self) -> Option<Self> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Some(Self::Float),
            _ => None,
        }
    }

    /// Whether values of this kind take part in statistics.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Row key of a time table: a simulation step or a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum IndexKey {
    /// Report step or row position
    Step(i64),
    /// Calendar date
    Date(NaiveDate),
    /// Date and time
    DateTime(NaiveDateTime),
}

impl IndexKey {
    /// Kind of the key, expressed as the matching value kind.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Step(_) => ValueKind::Integer,
            Self::Date(_) => ValueKind::Date,
            Self::DateTime(_) => ValueKind::DateTime,
        }
    }

    /// Convert a cell value into an index key.
    ///
    /// Text is accepted when it is an ISO date (`2020-01-31`) or datetime
    /// (`2020-01-31T12:00:00`, `2020-01-31 12:00:00`).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(Self::Step(*v)),
            Value::Date(d) => Some(Self::Date(*d)),
            Value::DateTime(dt) => Some(Self::DateTime(*dt)),
            Value::Text(s) => Self::parse(s),
            Value::Float(_) | Value::Boolean(_) => None,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(step) = text.parse::<i64>() {
            return Some(Self::Step(step));
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            return Some(Self::Date(date));
        }
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(Self::DateTime)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// Key → value mapping (`parameters.txt`, single-value files, flat JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalarSet {
    entries: BTreeMap<String, Value>,
}

impl ScalarSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ScalarSet {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// One row of a [`TimeTable`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRow {
    /// Row key
    pub index: IndexKey,
    /// Cells aligned with [`TimeTable::columns`]
    pub values: Vec<Option<Value>>,
}

/// Ordered table of rows keyed by step or time.
///
/// Rows are kept sorted by index key. Sorting is stable, so rows sharing a
/// key stay in file order and the last one is the most recently loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeTable {
    index_name: Option<String>,
    columns: Vec<String>,
    rows: Vec<TimeRow>,
}

impl TimeTable {
    /// Build a table, sorting rows by index key.
    ///
    /// `index_name` is `None` when the key is the row position.
    ///
    /// # Errors
    ///
    /// Returns error if a row width differs from the column count or a
    /// column name is repeated
    pub fn new(
        index_name: Option<String>,
        columns: Vec<String>,
        mut rows: Vec<TimeRow>,
    ) -> Result<Self> {
        for (pos, name) in columns.iter().enumerate() {
            if columns[..pos].contains(name) {
                return Err(Error::InvalidInput(format!("duplicate column '{name}'")));
            }
        }
        if let Some(row) = rows.iter().find(|r| r.values.len() != columns.len()) {
            return Err(Error::InvalidInput(format!(
                "row at index {} has {} cells, expected {}",
                row.index,
                row.values.len(),
                columns.len()
            )));
        }
        rows.sort_by_key(|r| r.index);
        Ok(Self {
            index_name,
            columns,
            rows,
        })
    }

    /// Name of the index column, if the key came from one.
    #[must_use]
    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    /// Value column names, in file order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows sorted by index key.
    #[must_use]
    pub fn rows(&self) -> &[TimeRow] {
        &self.rows
    }

    /// Position of a value column.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Parsed artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Record {
    /// Key → value mapping
    ScalarSet(ScalarSet),
    /// Step/time indexed table
    TimeTable(TimeTable),
}

impl Record {
    /// Human-readable variant name, used in conflict diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::ScalarSet(_) => "key-value set",
            Self::TimeTable(_) => "time table",
        }
    }

    /// Whether the record exposes a column or key with this name.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        match self {
            Self::ScalarSet(set) => set.get(name).is_some(),
            Self::TimeTable(table) => {
                table.column_position(name).is_some() || table.index_name() == Some(name)
            }
        }
    }

    /// Borrow as a scalar set.
    #[must_use]
    pub const fn as_scalar_set(&self) -> Option<&ScalarSet> {
        match self {
            Self::ScalarSet(set) => Some(set),
            Self::TimeTable(_) => None,
        }
    }

    /// Borrow as a time table.
    #[must_use]
    pub const fn as_time_table(&self) -> Option<&TimeTable> {
        match self {
            Self::TimeTable(table) => Some(table),
            Self::ScalarSet(_) => None,
        }
    }
}
