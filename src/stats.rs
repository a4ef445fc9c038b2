//! Cross-realization statistics
//!
//! For every index key of a [`CombinedTable`] and every numeric column, the
//! statistics are computed over the realizations that have a value there.
//! Absent cells (and NaN) never count as zero; a key with one contributor has
//! a mean but no standard deviation.
//!
//! Percentiles use linear interpolation between closest ranks:
//!
//! ```text
//! h = (n - 1) * p / 100
//! P = x[floor(h)] + (h - floor(h)) * (x[floor(h) + 1] - x[floor(h)])
//! ```
//!
//! Groups are independent and computed in parallel with rayon.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::record::IndexKey;
use crate::table::{CombinedTable, SummaryColumn, SummaryRow, SummaryTable};
use crate::{Error, Result};

/// A statistic over realizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Statistic {
    /// Arithmetic mean
    Mean,
    /// Smallest value
    Min,
    /// Largest value
    Max,
    /// Sample standard deviation (n - 1 denominator)
    Std,
    /// Percentile in `0..=100`
    Percentile(u8),
}

impl Statistic {
    /// 10th percentile
    pub const P10: Self = Self::Percentile(10);
    /// Median
    pub const P50: Self = Self::Percentile(50);
    /// 90th percentile
    pub const P90: Self = Self::Percentile(90);

    /// Mean, min, max, P10, P50 and P90.
    pub const DEFAULT: [Self; 6] = [
        Self::Mean,
        Self::Min,
        Self::Max,
        Self::P10,
        Self::P50,
        Self::P90,
    ];

    /// Evaluate over values sorted ascending.
    #[must_use]
    pub fn evaluate(self, sorted: &[f64]) -> Option<f64> {
        let (first, last) = (sorted.first()?, sorted.last()?);
        match self {
            Self::Mean => Some(mean(sorted)),
            Self::Min => Some(*first),
            Self::Max => Some(*last),
            Self::Std => std_dev(sorted),
            Self::Percentile(p) => percentile(sorted, f64::from(p)),
        }
    }

    fn validate(self) -> Result<Self> {
        match self {
            Self::Percentile(p) if p > 100 => Err(Error::InvalidInput(format!(
                "percentile must be within 0..=100, got {p}"
            ))),
            other => Ok(other),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("mean"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Std => f.write_str("std"),
            Self::Percentile(p) => write!(f, "p{p}"),
        }
    }
}

impl FromStr for Statistic {
    type Err = Error;

    /// Accepts `mean`, `min`, `max`, `std`, `median` and `pNN`.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let stat = match lower.as_str() {
            "mean" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            "std" => Self::Std,
            "median" => Self::P50,
            other => {
                let p = other
                    .strip_prefix('p')
                    .and_then(|n| n.parse::<u8>().ok())
                    .ok_or_else(|| Error::InvalidInput(format!("unknown statistic '{s}'")))?;
                Self::Percentile(p)
            }
        };
        stat.validate()
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Linear-interpolation percentile of values sorted ascending.
///
/// Returns `None` for an empty slice or `p` outside `0..=100`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * p / 100.0;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    Some(sorted[lo] + (h - h.floor()) * (sorted[hi] - sorted[lo]))
}

/// Summarize a combined table.
///
/// Only numeric columns are summarized. Rows of the result follow index-key
/// order; key-value artifacts produce a single row with no index.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `statistics` is empty or holds a
/// percentile above 100
pub fn summarize(table: &CombinedTable, statistics: &[Statistic]) -> Result<SummaryTable> {
    if statistics.is_empty() {
        return Err(Error::InvalidInput("no statistics requested".to_string()));
    }
    let mut stats: Vec<Statistic> = Vec::with_capacity(statistics.len());
    for stat in statistics {
        let stat = stat.validate()?;
        if !stats.contains(&stat) {
            stats.push(stat);
        }
    }

    let numeric: Vec<(usize, &str)> = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind.is_some_and(|k| k.is_numeric()))
        .map(|(pos, c)| (pos, c.name.as_str()))
        .collect();

    let mut groups: BTreeMap<Option<IndexKey>, Vec<usize>> = BTreeMap::new();
    for (row, combined) in table.rows().iter().enumerate() {
        groups.entry(combined.index).or_default().push(row);
    }

    let rows: Vec<SummaryRow> = groups
        .into_par_iter()
        .map(|(index, members)| {
            let mut values = Vec::with_capacity(numeric.len() * stats.len());
            let mut counts = Vec::with_capacity(numeric.len());
            for &(pos, _) in &numeric {
                let mut samples: Vec<f64> = members
                    .iter()
                    .filter_map(|&row| table.rows()[row].values[pos].as_ref())
                    .filter_map(|v| v.as_f64())
                    .filter(|v| !v.is_nan())
                    .collect();
                samples.sort_by(f64::total_cmp);
                counts.push(samples.len());
                values.extend(stats.iter().map(|s| s.evaluate(&samples)));
            }
            SummaryRow {
                index,
                values,
                counts,
            }
        })
        .collect();

    let columns = numeric
        .iter()
        .flat_map(|&(_, name)| {
            stats.iter().map(move |&statistic| SummaryColumn {
                source: name.to_string(),
                statistic,
            })
        })
        .collect();

    debug!(
        artifact = table.artifact(),
        keys = rows.len(),
        columns = numeric.len(),
        statistics = stats.len(),
        "Computed ensemble statistics"
    );

    Ok(SummaryTable::new(
        table.index_label().map(str::to_string),
        numeric.iter().map(|(_, n)| (*n).to_string()).collect(),
        columns,
        rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ValueKind;
    use crate::record::Value;
    use crate::table::{Column, CombinedRow};
    use proptest::prelude::*;

    fn combined(cells: &[(u32, i64, Option<f64>)]) -> CombinedTable {
        CombinedTable::new(
            "summary",
            Some("STEP".into()),
            true,
            vec![
                Column {
                    name: "x".into(),
                    kind: Some(ValueKind::Float),
                },
                Column {
                    name: "label".into(),
                    kind: Some(ValueKind::Text),
                },
            ],
            cells
                .iter()
                .map(|&(realization, step, v)| CombinedRow {
                    realization,
                    index: Some(IndexKey::Step(step)),
                    values: vec![v.map(Value::Float), Some(Value::Text("t".into()))],
                })
                .collect(),
        )
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(4.0));
        assert_eq!(percentile(&v, 50.0), Some(2.5));
        assert!((percentile(&v, 10.0).unwrap() - 1.3).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&v, 101.0), None);
    }

    #[test]
    fn test_std_needs_two_values() {
        assert_eq!(Statistic::Std.evaluate(&[3.0]), None);
        let s = Statistic::Std.evaluate(&[2.0, 4.0]).unwrap();
        assert!((s - std::f64::consts::SQRT_2).abs() < 1e-12);
        assert_eq!(Statistic::Mean.evaluate(&[]), None);
    }

    #[test]
    fn test_statistic_parse() {
        assert_eq!("mean".parse::<Statistic>().unwrap(), Statistic::Mean);
        assert_eq!("P90".parse::<Statistic>().unwrap(), Statistic::P90);
        assert_eq!("median".parse::<Statistic>().unwrap(), Statistic::P50);
        assert!("p101".parse::<Statistic>().is_err());
        assert!("avg".parse::<Statistic>().is_err());
        assert_eq!(Statistic::P10.to_string(), "p10");
    }

    #[test]
    fn test_absent_values_are_excluded() {
        // Two of five realizations report x at step 1
        let table = combined(&[
            (0, 1, Some(10.0)),
            (1, 1, None),
            (2, 1, Some(20.0)),
            (3, 1, None),
            (4, 1, None),
        ]);
        let summary = summarize(&table, &[Statistic::Mean, Statistic::Std]).unwrap();
        let key = Some(IndexKey::Step(1));
        assert_eq!(summary.value(key, "x", Statistic::Mean), Some(15.0));
        assert_eq!(summary.count(key, "x"), Some(2));
        // Text column is not summarized
        assert_eq!(summary.sources(), &["x".to_string()][..]);
        assert_eq!(summary.columns()[0].name(), "x_mean");
    }

    #[test]
    fn test_single_contributor_has_mean_not_std() {
        let table = combined(&[(0, 1, Some(5.0)), (0, 2, Some(6.0)), (1, 2, Some(8.0))]);
        let summary = summarize(&table, &[Statistic::Mean, Statistic::Std]).unwrap();
        assert_eq!(summary.num_rows(), 2);
        let key = Some(IndexKey::Step(1));
        assert_eq!(summary.value(key, "x", Statistic::Mean), Some(5.0));
        assert_eq!(summary.value(key, "x", Statistic::Std), None);
    }

    #[test]
    fn test_invalid_requests() {
        let table = combined(&[(0, 1, Some(1.0))]);
        assert!(matches!(summarize(&table, &[]), Err(Error::InvalidInput(_))));
        assert!(matches!(
            summarize(&table, &[Statistic::Percentile(150)]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_duplicate_statistics_collapse() {
        let table = combined(&[(0, 1, Some(1.0))]);
        let summary = summarize(&table, &[Statistic::Mean, Statistic::Mean]).unwrap();
        assert_eq!(summary.columns().len(), 1);
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_bounded_and_ordered(
            mut values in prop::collection::vec(-1e6f64..1e6, 1..50)
        ) {
            values.sort_by(f64::total_cmp);
            let min = values[0];
            let max = values[values.len() - 1];
            let p10 = percentile(&values, 10.0).unwrap();
            let p50 = percentile(&values, 50.0).unwrap();
            let p90 = percentile(&values, 90.0).unwrap();
            let eps = 1e-9;
            prop_assert!(min <= p10 + eps && p10 <= p50 + eps && p50 <= p90 + eps && p90 <= max + eps);
            let m = mean(&values);
            prop_assert!(min - 1e-6 <= m && m <= max + 1e-6);
        }
    }
}
