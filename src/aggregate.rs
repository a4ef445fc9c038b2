//! Cross-realization aggregation
//!
//! Merges one artifact's records from many realizations into a single
//! [`CombinedTable`]:
//!
//! 1. Contributions are ordered by realization index.
//! 2. The first contributor fixes the record kind (key-value set or table);
//!    a later contributor of the other kind is a [`Error::RecordKindConflict`].
//! 3. Columns are the union across contributors, in first-seen order.
//! 4. Each column carries one value kind. Integer and Float widen to Float;
//!    any other mismatch is an [`Error::SchemaConflict`] naming both
//!    realizations.
//! 5. Cells a realization does not have are `None`.
//!
//! Aggregation is pure: it reads shared records and never touches any
//! realization cache, so a failed aggregation leaves nothing behind.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::record::{IndexKey, Record, ScalarSet, TimeTable, Value, ValueKind};
use crate::table::{Column, CombinedRow, CombinedTable, DEFAULT_INDEX_COLUMN, ENSEMBLE_COLUMN};
use crate::{Error, Result};

/// Merges per-realization records of one artifact.
#[derive(Debug, Clone)]
pub struct Aggregator {
    artifact: String,
}

impl Aggregator {
    /// Create an aggregator for the named artifact.
    #[must_use]
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
        }
    }

    /// Artifact name used in the result and in error context.
    #[must_use]
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Combine `(realization index, record)` pairs into one table.
    ///
    /// Input order does not matter; output rows are grouped by realization
    /// ascending. No contributors yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordKindConflict`] or [`Error::SchemaConflict`] when
    /// contributors cannot be reconciled
    pub fn combine(&self, contributions: &[(u32, Arc<Record>)]) -> Result<CombinedTable> {
        let mut ordered: Vec<(u32, &Record)> = contributions
            .iter()
            .map(|(idx, record)| (*idx, record.as_ref()))
            .collect();
        ordered.sort_by_key(|(idx, _)| *idx);

        let Some((first_idx, first)) = ordered.first().copied() else {
            return Ok(CombinedTable::empty(self.artifact.clone()));
        };
        for &(idx, record) in &ordered[1..] {
            if std::mem::discriminant(record) != std::mem::discriminant(first) {
                return Err(Error::RecordKindConflict {
                    artifact: self.artifact.clone(),
                    realization: idx,
                    expected: first.kind_name(),
                    found: record.kind_name(),
                });
            }
        }
        debug!(
            artifact = %self.artifact,
            contributors = ordered.len(),
            first = first_idx,
            kind = first.kind_name(),
            "Aggregating artifact"
        );

        let table = match first {
            Record::ScalarSet(_) => {
                let sets: Vec<(u32, &ScalarSet)> = ordered
                    .iter()
                    .filter_map(|(idx, r)| r.as_scalar_set().map(|s| (*idx, s)))
                    .collect();
                self.combine_scalar_sets(&sets)?
            }
            Record::TimeTable(_) => {
                let tables: Vec<(u32, &TimeTable)> = ordered
                    .iter()
                    .filter_map(|(idx, r)| r.as_time_table().map(|t| (*idx, t)))
                    .collect();
                self.combine_time_tables(&tables)?
            }
        };

        debug!(
            artifact = %self.artifact,
            rows = table.num_rows(),
            columns = table.columns().len(),
            "Aggregation complete"
        );
        Ok(table)
    }

    fn combine_scalar_sets(&self, sets: &[(u32, &ScalarSet)]) -> Result<CombinedTable> {
        let mut schema = ColumnUnion::new(&self.artifact);
        let mut pending = Vec::with_capacity(sets.len());

        for &(realization, set) in sets {
            let mut cells = Vec::with_capacity(set.len());
            for (key, value) in set.iter() {
                let pos = schema.position(key);
                schema.observe(pos, realization, value.kind())?;
                cells.push((pos, value.clone()));
            }
            pending.push((realization, None, cells));
        }

        Ok(schema.finish(None, false, pending))
    }

    fn combine_time_tables(&self, tables: &[(u32, &TimeTable)]) -> Result<CombinedTable> {
        let mut schema = ColumnUnion::new(&self.artifact);
        let index_name = tables
            .iter()
            .find_map(|(_, t)| t.index_name().map(str::to_string));
        let index_label = index_name.as_deref().unwrap_or(DEFAULT_INDEX_COLUMN);
        let mut index_kind: Option<(ValueKind, u32)> = None;
        let mut pending = Vec::new();

        for &(realization, table) in tables {
            let positions: Vec<usize> = table
                .columns()
                .iter()
                .map(|name| schema.position(name))
                .collect();

            let rows = table.rows();
            for (i, row) in rows.iter().enumerate() {
                // Rows are sorted; of several rows sharing a key the last wins.
                if rows.get(i + 1).is_some_and(|next| next.index == row.index) {
                    continue;
                }

                self.check_index_kind(&mut index_kind, index_label, realization, row.index)?;

                let mut cells = Vec::with_capacity(row.values.len());
                for (&pos, value) in positions.iter().zip(&row.values) {
                    if let Some(value) = value {
                        schema.observe(pos, realization, value.kind())?;
                        cells.push((pos, value.clone()));
                    }
                }
                pending.push((realization, Some(row.index), cells));
            }
        }

        Ok(schema.finish(index_name, true, pending))
    }

    /// Stack already combined tables of this artifact, one per labelled
    /// ensemble.
    ///
    /// Every row gains a leading [`ENSEMBLE_COLUMN`] text cell holding its
    /// table's label. Columns are unioned and reconciled as in
    /// [`Self::combine`]; rows keep input table order. Empty tables are
    /// ignored, and no non-empty input yields an empty table.
    ///
    /// # Errors
    ///
    /// - [`Error::RecordKindConflict`] when keyed and key-value tables mix
    /// - [`Error::SchemaConflict`] for incompatible columns or index keys
    /// - [`Error::InvalidInput`] if a table already has an `ENSEMBLE` column
    pub fn concat(&self, tables: &[(&str, &CombinedTable)]) -> Result<CombinedTable> {
        let tables: Vec<(&str, &CombinedTable)> = tables
            .iter()
            .copied()
            .filter(|(_, table)| !table.is_empty())
            .collect();
        let Some(&(_, first)) = tables.first() else {
            return Ok(CombinedTable::empty(self.artifact.clone()));
        };
        let keyed = first.index_label().is_some();

        let mut schema = ColumnUnion::new(&self.artifact);
        let tag = schema.position(ENSEMBLE_COLUMN);
        let index_name = tables
            .iter()
            .find_map(|(_, t)| t.index_name().map(str::to_string));
        let index_label = index_name.as_deref().unwrap_or(DEFAULT_INDEX_COLUMN);
        let mut index_kind: Option<(ValueKind, u32)> = None;
        let mut pending = Vec::new();

        for &(label, table) in &tables {
            if table.column_position(ENSEMBLE_COLUMN).is_some() {
                return Err(Error::InvalidInput(format!(
                    "'{}' already has a column named {ENSEMBLE_COLUMN}",
                    self.artifact
                )));
            }
            let lead = table.rows().first().map_or(0, |row| row.realization);
            if table.index_label().is_some() != keyed {
                return Err(Error::RecordKindConflict {
                    artifact: self.artifact.clone(),
                    realization: lead,
                    expected: table_kind(keyed),
                    found: table_kind(!keyed),
                });
            }
            schema.observe(tag, lead, ValueKind::Text)?;

            let positions: Vec<usize> = table
                .columns()
                .iter()
                .map(|column| schema.position(&column.name))
                .collect();
            for (&pos, column) in positions.iter().zip(table.columns()) {
                if let Some(kind) = column.kind {
                    schema.observe(pos, lead, kind)?;
                }
            }

            for row in table.rows() {
                if let Some(key) = row.index {
                    self.check_index_kind(&mut index_kind, index_label, row.realization, key)?;
                }
                let mut cells = Vec::with_capacity(row.values.len() + 1);
                cells.push((tag, Value::Text(label.to_string())));
                for (&pos, value) in positions.iter().zip(&row.values) {
                    if let Some(value) = value {
                        cells.push((pos, value.clone()));
                    }
                }
                pending.push((row.realization, row.index, cells));
            }
        }

        debug!(
            artifact = %self.artifact,
            tables = tables.len(),
            rows = pending.len(),
            "Concatenated ensemble tables"
        );
        Ok(schema.finish(index_name, keyed, pending))
    }

    fn check_index_kind(
        &self,
        seen: &mut Option<(ValueKind, u32)>,
        label: &str,
        realization: u32,
        key: IndexKey,
    ) -> Result<()> {
        match *seen {
            None => *seen = Some((key.kind(), realization)),
            Some((kind, first)) if kind != key.kind() => {
                return Err(Error::SchemaConflict {
                    artifact: self.artifact.clone(),
                    column: label.to_string(),
                    first_realization: first,
                    realization,
                    expected: kind,
                    found: key.kind(),
                });
            }
            Some(_) => {}
        }
        Ok(())
    }
}

const fn table_kind(keyed: bool) -> &'static str {
    if keyed {
        "time table"
    } else {
        "key-value set"
    }
}

type PendingRow = (u32, Option<IndexKey>, Vec<(usize, Value)>);

/// Union of column names with per-column kind reconciliation.
struct ColumnUnion<'a> {
    artifact: &'a str,
    columns: Vec<UnionColumn>,
    lookup: FxHashMap<String, usize>,
}

struct UnionColumn {
    name: String,
    kind: Option<(ValueKind, u32)>,
}

impl<'a> ColumnUnion<'a> {
    fn new(artifact: &'a str) -> Self {
        Self {
            artifact,
            columns: Vec::new(),
            lookup: FxHashMap::default(),
        }
    }

    fn position(&mut self, name: &str) -> usize {
        if let Some(&pos) = self.lookup.get(name) {
            return pos;
        }
        let pos = self.columns.len();
        self.columns.push(UnionColumn {
            name: name.to_string(),
            kind: None,
        });
        self.lookup.insert(name.to_string(), pos);
        pos
    }

    fn observe(&mut self, pos: usize, realization: u32, kind: ValueKind) -> Result<()> {
        let column = &mut self.columns[pos];
        match column.kind {
            None => column.kind = Some((kind, realization)),
            Some((current, first)) => match current.merge(kind) {
                Some(merged) => column.kind = Some((merged, first)),
                None => {
                    return Err(Error::SchemaConflict {
                        artifact: self.artifact.to_string(),
                        column: column.name.clone(),
                        first_realization: first,
                        realization,
                        expected: current,
                        found: kind,
                    });
                }
            },
        }
        Ok(())
    }

    /// Lay pending cells out in column order, converting each to its
    /// column's merged kind.
    #[allow(clippy::cast_precision_loss)]
    fn finish(
        self,
        index_name: Option<String>,
        keyed: bool,
        pending: Vec<PendingRow>,
    ) -> CombinedTable {
        let width = self.columns.len();
        let kinds: Vec<Option<ValueKind>> = self
            .columns
            .iter()
            .map(|c| c.kind.map(|(kind, _)| kind))
            .collect();
        let rows = pending
            .into_iter()
            .map(|(realization, index, cells)| {
                let mut values = vec![None; width];
                for (pos, value) in cells {
                    values[pos] = Some(match (kinds[pos], value) {
                        (Some(ValueKind::Float), Value::Integer(v)) => Value::Float(v as f64),
                        (_, value) => value,
                    });
                }
                CombinedRow {
                    realization,
                    index,
                    values,
                }
            })
            .collect();
        let columns = self
            .columns
            .into_iter()
            .map(|c| Column {
                name: c.name,
                kind: c.kind.map(|(kind, _)| kind),
            })
            .collect();
        CombinedTable::new(self.artifact, index_name, keyed, columns, rows)
    }
}
