//! # Trueno-Ensemble: Ensemble Aggregation Engine
//!
//! **Version**: 0.1.0
//!
//! Trueno-Ensemble turns a directory of independent simulation runs
//! ("realizations") into ensemble-wide tables: each realization loads its
//! artifacts lazily and at most once, the ensemble fans requests out under a
//! concurrency limit and deadline, and the aggregator reconciles differing
//! schemas without ever zero-filling missing data.
//!
//! ## Data Flow
//!
//! ```text
//! Ensemble::collect("summary")
//!   → Realization::load_artifact   (per-artifact single flight, cached outcome)
//!     → FileLoader::load           (csv / parquet / key-value / scalar / json / status)
//!   → Aggregator::combine          (column union, kind widening, absent cells)
//!   → stats::summarize             (mean, std, min, max, percentiles per key)
//!
//! EnsembleSet::get_dataframe("summary")
//!   → Ensemble::collect per member
//!   → Aggregator::concat           (ENSEMBLE tag column, same reconciliation)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trueno_ensemble::config::EnsembleConfig;
//! use trueno_ensemble::ensemble::Ensemble;
//! use trueno_ensemble::loader::DefaultLoader;
//! use trueno_ensemble::stats::Statistic;
//!
//! # async fn run() -> trueno_ensemble::Result<()> {
//! let config = EnsembleConfig::from_json_file("ensemble.json")?;
//! let ensemble = Ensemble::discover("iter-0", "/scratch/case", config, Arc::new(DefaultLoader::new()))?;
//!
//! let table = ensemble.get_dataframe("summary").await?;
//! println!("{} rows from {:?}", table.num_rows(), table.realizations());
//!
//! let summary = ensemble.get_statistics("summary", &Statistic::DEFAULT).await?;
//! summary.write_parquet("summary_stats.parquet")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregate;
pub mod config;
pub mod ensemble;
pub mod ensemble_set;
pub mod error;
pub mod jobs;
pub mod loader;
pub mod realization;
pub mod record;
pub mod stats;
pub mod table;
pub mod telemetry;

pub use aggregate::Aggregator;
pub use config::{ArtifactSpec, EnsembleConfig, FileFormat};
pub use ensemble::{Collection, Ensemble, LoadOptions, Requirement, SkipReason, Skipped};
pub use ensemble_set::{EnsembleSet, SetCollection};
pub use error::{Error, LoadError, Result};
pub use loader::{DefaultLoader, FileLoader};
pub use realization::{Realization, Status};
pub use record::{IndexKey, Record, Value, ValueKind};
pub use stats::Statistic;
pub use table::{CombinedTable, SummaryTable};
