//! Ensemble: ordered realizations and artifact fan-out
//!
//! ## Fan-out
//!
//! ```text
//! collect("summary")
//!   │
//!   ├─ realization 0 ──┐
//!   ├─ realization 1 ──┼── Semaphore(max_concurrency) ── load_artifact (single flight)
//!   ├─ realization 2 ──┘         │
//!   │   ...                      └─ deadline passed: stop issuing, rest DeadlineExceeded
//!   ▼
//! Aggregator::combine(successes)  +  skipped side list
//! ```
//!
//! Per-realization failures never abort the call; they are cached by the
//! realization and reported in [`Collection::skipped`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::{ArtifactCatalog, ArtifactSpec, EnsembleConfig};
use crate::error::LoadError;
use crate::loader::FileLoader;
use crate::realization::{Outcome, Realization};
use crate::record::{Record, Value};
use crate::stats::{self, Statistic};
use crate::table::{CombinedTable, SummaryTable};
use crate::{Error, Result};

/// Caller-supplied limits for one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Stop issuing loads after this instant; loads in flight time out at it
    pub deadline: Option<Instant>,
    /// Maximum realizations loading at once
    pub max_concurrency: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl LoadOptions {
    /// Options from configuration, with the deadline starting now.
    #[must_use]
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self {
            deadline: config
                .load_timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            max_concurrency: config.max_concurrency,
        }
    }

    /// Set a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set an absolute deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the concurrency limit (at least 1).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Why a realization contributed nothing to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Realization is marked failed
    Failed,
    /// Artifact could not be loaded
    MissingArtifact(#[serde(serialize_with = "display")] LoadError),
    /// Deadline passed before a load was issued
    DeadlineExceeded,
}

fn display<S: serde::Serializer>(err: &LoadError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(err)
}

/// A realization left out of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    /// Realization index
    pub realization: u32,
    /// Reason
    pub reason: SkipReason,
}

/// Result of collecting one artifact across the ensemble.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    /// Combined table of every realization that yielded data
    pub table: CombinedTable,
    /// Realizations that did not, ascending
    pub skipped: Vec<Skipped>,
}

/// Condition a realization must satisfy to survive [`Ensemble::filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    /// Artifact loads successfully
    HasArtifact(String),
    /// Artifact loads and has the column (or key)
    HasColumn {
        /// Artifact name
        artifact: String,
        /// Column or key name
        column: String,
    },
    /// Key-value artifact holds `key` equal to `value`
    KeyEquals {
        /// Artifact name
        artifact: String,
        /// Key in the artifact
        key: String,
        /// Required value; numbers compare by value across Integer/Float
        value: Value,
    },
}

impl Requirement {
    fn artifact(&self) -> &str {
        match self {
            Self::HasArtifact(artifact)
            | Self::HasColumn { artifact, .. }
            | Self::KeyEquals { artifact, .. } => artifact,
        }
    }

    fn satisfied_by(&self, record: &Record) -> bool {
        match self {
            Self::HasArtifact(_) => true,
            Self::HasColumn { column, .. } => record.has_column(column),
            Self::KeyEquals { key, value, .. } => record
                .as_scalar_set()
                .and_then(|set| set.get(key))
                .is_some_and(|found| values_equal(found, value)),
        }
    }
}

#[allow(clippy::float_cmp)]
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered collection of realizations keyed by index.
pub struct Ensemble {
    name: String,
    config: EnsembleConfig,
    catalog: Arc<ArtifactCatalog>,
    loader: Arc<dyn FileLoader>,
    realizations: BTreeMap<u32, Arc<Realization>>,
}

impl std::fmt::Debug for Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble")
            .field("name", &self.name)
            .field("realizations", &self.realizations.len())
            .finish_non_exhaustive()
    }
}

impl Ensemble {
    /// Create an empty ensemble.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid
    pub fn new(
        name: impl Into<String>,
        config: EnsembleConfig,
        loader: Arc<dyn FileLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        Ok(Self {
            name: name.into(),
            config,
            catalog,
            loader,
            realizations: BTreeMap::new(),
        })
    }

    /// Discover realizations under `root`.
    ///
    /// Every subdirectory named `<realization_prefix><index>` is registered,
    /// joined with `runpath_suffix` when configured. Directories where the
    /// suffix does not exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or `root` cannot be read
    pub fn discover(
        name: impl Into<String>,
        root: impl AsRef<Path>,
        config: EnsembleConfig,
        loader: Arc<dyn FileLoader>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let mut ensemble = Self::new(name, config, loader)?;

        let mut found = BTreeMap::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|n| ensemble.config.parse_realization_dir(n))
            else {
                continue;
            };
            let mut path = entry.path();
            if let Some(suffix) = &ensemble.config.runpath_suffix {
                path = path.join(suffix);
                if !path.is_dir() {
                    debug!(realization = index, path = %path.display(), "Runpath missing, skipping");
                    continue;
                }
            }
            found.insert(index, path);
        }

        for (index, path) in found {
            ensemble.add_realization(path, index)?;
        }
        info!(
            ensemble = %ensemble.name,
            root = %root.display(),
            realizations = ensemble.len(),
            "Discovered ensemble"
        );
        Ok(ensemble)
    }

    /// Register one realization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateIndex`] if `index` is already registered
    pub fn add_realization(&mut self, path: impl Into<PathBuf>, index: u32) -> Result<()> {
        if self.realizations.contains_key(&index) {
            return Err(Error::DuplicateIndex {
                ensemble: self.name.clone(),
                index,
            });
        }
        let realization = Realization::new(
            index,
            path,
            &self.config,
            Arc::clone(&self.catalog),
            Arc::clone(&self.loader),
        );
        self.realizations.insert(index, Arc::new(realization));
        Ok(())
    }

    /// Register realizations listed in a runpath file.
    ///
    /// Each line is `index runpath [eclbase [iteration]]`. With a `filter`,
    /// only lines containing it are used. Nothing is registered if any line
    /// is malformed or any index is already taken.
    ///
    /// Returns the number of realizations added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for malformed lines and
    /// [`Error::DuplicateIndex`] for repeated indices
    pub fn add_from_runpath_file(&mut self, path: impl AsRef<Path>, filter: Option<&str>) -> Result<usize> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let mut entries: BTreeMap<u32, PathBuf> = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() || filter.is_some_and(|f| !line.contains(f)) {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(index), Some(runpath)) = (tokens.next(), tokens.next()) else {
                return Err(Error::InvalidInput(format!(
                    "{}:{}: expected 'index runpath', got '{line}'",
                    path.display(),
                    lineno + 1
                )));
            };
            let index: u32 = index.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "{}:{}: invalid realization index '{index}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            if self.realizations.contains_key(&index)
                || entries.insert(index, PathBuf::from(runpath)).is_some()
            {
                return Err(Error::DuplicateIndex {
                    ensemble: self.name.clone(),
                    index,
                });
            }
        }

        let added = entries.len();
        for (index, runpath) in entries {
            self.add_realization(runpath, index)?;
        }
        info!(ensemble = %self.name, runpath_file = %path.display(), added, "Loaded runpath file");
        Ok(added)
    }

    /// Drop realizations by index, returning how many were present.
    pub fn remove_realizations(&mut self, indices: &[u32]) -> usize {
        let removed = indices
            .iter()
            .filter(|&&idx| self.realizations.remove(&idx).is_some())
            .count();
        if removed > 0 {
            info!(ensemble = %self.name, removed, remaining = self.len(), "Removed realizations");
        }
        removed
    }

    /// Ensemble name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Number of realizations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.realizations.len()
    }

    /// Whether the ensemble has no realizations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.realizations.is_empty()
    }

    /// Realization indices, ascending.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        self.realizations.keys().copied().collect()
    }

    /// Look up a realization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRealization`] if `index` is not registered
    pub fn get(&self, index: u32) -> Result<&Arc<Realization>> {
        self.realizations
            .get(&index)
            .ok_or(Error::UnknownRealization(index))
    }

    /// Realizations in index order.
    pub fn realizations(&self) -> impl Iterator<Item = &Arc<Realization>> {
        self.realizations.values()
    }

    /// Union of artifact names successfully loaded by any realization.
    #[must_use]
    pub fn loaded_artifacts(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .realizations
            .values()
            .flat_map(|r| r.loaded_artifacts())
            .collect();
        names.into_iter().collect()
    }

    /// Combine an artifact across all realizations with the configured load
    /// options.
    ///
    /// # Errors
    ///
    /// Returns error if the artifact name cannot be resolved or the records
    /// cannot be reconciled
    pub async fn get_dataframe(&self, artifact: &str) -> Result<CombinedTable> {
        let options = LoadOptions::from_config(&self.config);
        Ok(self.collect(artifact, &options).await?.table)
    }

    /// Combine an artifact across all realizations.
    ///
    /// Failed realizations are skipped without loading. Realizations whose
    /// load fails contribute no rows. Both are listed in
    /// [`Collection::skipped`].
    ///
    /// # Errors
    ///
    /// Returns error if the artifact name cannot be resolved or the records
    /// cannot be reconciled
    pub async fn collect(&self, artifact: &str, options: &LoadOptions) -> Result<Collection> {
        let spec = self.catalog.resolve(artifact)?;
        let (records, skipped) = self.fan_out(&spec, options).await?;

        let contributions: Vec<(u32, Arc<Record>)> = records.into_iter().collect();
        let table = Aggregator::new(artifact).combine(&contributions)?;

        info!(
            ensemble = %self.name,
            artifact,
            contributors = contributions.len(),
            skipped = skipped.len(),
            rows = table.num_rows(),
            "Collected artifact"
        );
        Ok(Collection { table, skipped })
    }

    /// Collect an artifact and summarize it.
    ///
    /// # Errors
    ///
    /// Returns error if collection fails or `statistics` is invalid
    pub async fn get_statistics(&self, artifact: &str, statistics: &[Statistic]) -> Result<SummaryTable> {
        let table = self.get_dataframe(artifact).await?;
        stats::summarize(&table, statistics)
    }

    /// Remove realizations that do not satisfy `requirement`.
    ///
    /// Loads the artifact without a deadline. Returns the removed indices,
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns error if the artifact name cannot be resolved
    pub async fn filter(&mut self, requirement: &Requirement) -> Result<Vec<u32>> {
        let spec = self.catalog.resolve(requirement.artifact())?;
        let options = LoadOptions::default().with_max_concurrency(self.config.max_concurrency);
        let (records, _) = self.fan_out(&spec, &options).await?;

        let removed: Vec<u32> = self
            .realizations
            .keys()
            .copied()
            .filter(|idx| {
                !records
                    .get(idx)
                    .is_some_and(|record| requirement.satisfied_by(record))
            })
            .collect();
        self.remove_realizations(&removed);
        Ok(removed)
    }

    async fn fan_out(
        &self,
        spec: &ArtifactSpec,
        options: &LoadOptions,
    ) -> Result<(BTreeMap<u32, Arc<Record>>, Vec<Skipped>)> {
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        let mut tasks: JoinSet<(u32, Outcome)> = JoinSet::new();
        let mut outcomes: BTreeMap<u32, Outcome> = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut expired = false;

        for (&index, realization) in &self.realizations {
            if realization.is_failed() {
                skipped.push(Skipped {
                    realization: index,
                    reason: SkipReason::Failed,
                });
                continue;
            }
            if let Some(outcome) = realization.cached(&spec.name) {
                outcomes.insert(index, outcome);
                continue;
            }
            if !expired {
                let permit = match options.deadline {
                    Some(deadline) => {
                        tokio::time::timeout_at(deadline, Arc::clone(&semaphore).acquire_owned())
                            .await
                            .ok()
                    }
                    None => Some(Arc::clone(&semaphore).acquire_owned().await),
                };
                match permit {
                    Some(Ok(permit)) if !options.deadline_passed() => {
                        let realization = Arc::clone(realization);
                        let spec = spec.clone();
                        let deadline = options.deadline;
                        tasks.spawn(async move {
                            let _permit = permit;
                            (index, realization.load_artifact(&spec, deadline).await)
                        });
                        continue;
                    }
                    Some(Err(e)) => return Err(Error::Other(format!("load semaphore closed: {e}"))),
                    _ => {
                        warn!(
                            ensemble = %self.name,
                            artifact = %spec.name,
                            first_unissued = index,
                            "Deadline passed, not issuing further loads"
                        );
                        expired = true;
                    }
                }
            }
            skipped.push(Skipped {
                realization: index,
                reason: SkipReason::DeadlineExceeded,
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) =
                joined.map_err(|e| Error::Other(format!("load task failed: {e}")))?;
            outcomes.insert(index, outcome);
        }

        let mut records = BTreeMap::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(record) => {
                    records.insert(index, record);
                }
                Err(e) => {
                    // Uncached means the load was never attempted
                    let attempted = self
                        .realizations
                        .get(&index)
                        .is_some_and(|r| r.cached(&spec.name).is_some());
                    let reason = if attempted {
                        SkipReason::MissingArtifact(e)
                    } else {
                        SkipReason::DeadlineExceeded
                    };
                    skipped.push(Skipped {
                        realization: index,
                        reason,
                    });
                }
            }
        }
        skipped.sort_by_key(|s| s.realization);

        debug!(
            ensemble = %self.name,
            artifact = %spec.name,
            loaded = records.len(),
            skipped = skipped.len(),
            "Fan-out complete"
        );
        Ok((records, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;
    use crate::loader::DefaultLoader;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn config() -> EnsembleConfig {
        EnsembleConfig::default()
            .with_artifact(ArtifactSpec::new("parameters", FileFormat::KeyValue).with_path("parameters.txt"))
    }

    #[test]
    fn test_add_realization_rejects_duplicates() {
        let mut ens = Ensemble::new("e", config(), Arc::new(DefaultLoader::new())).unwrap();
        ens.add_realization("/tmp/r0", 0).unwrap();
        let err = ens.add_realization("/tmp/other", 0).unwrap_err();
        assert!(matches!(err, Error::DuplicateIndex { index: 0, .. }));
        assert_eq!(ens.len(), 1);
    }

    #[test]
    fn test_discover_orders_by_index_and_applies_suffix() {
        let dir = tempfile::tempdir().unwrap();
        for i in [10, 2, 1] {
            std::fs::create_dir_all(dir.path().join(format!("realization-{i}/iter-0"))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("realization-5")).unwrap();
        std::fs::create_dir_all(dir.path().join("share")).unwrap();

        let config = EnsembleConfig {
            runpath_suffix: Some("iter-0".into()),
            ..config()
        };
        let ens = Ensemble::discover("e", dir.path(), config, Arc::new(DefaultLoader::new())).unwrap();
        assert_eq!(ens.indices(), vec![1, 2, 10]);
        assert!(ens.get(2).unwrap().root().ends_with("realization-2/iter-0"));
        assert!(matches!(ens.get(5), Err(Error::UnknownRealization(5))));
    }

    #[test]
    fn test_runpath_file_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let runpath = dir.path().join("runpath");
        write(
            &runpath,
            "000 /scratch/case/realization-0/iter-0 CASE-0 000\n\
             001 /scratch/case/realization-1/iter-0 CASE-1 000\n\
             000 /scratch/case/realization-0/iter-1 CASE-0 001\n",
        );

        let mut ens = Ensemble::new("e", config(), Arc::new(DefaultLoader::new())).unwrap();
        assert_eq!(ens.add_from_runpath_file(&runpath, Some("iter-0")).unwrap(), 2);
        assert_eq!(ens.indices(), vec![0, 1]);

        // Unfiltered the file repeats index 0
        let mut ens = Ensemble::new("e", config(), Arc::new(DefaultLoader::new())).unwrap();
        assert!(matches!(
            ens.add_from_runpath_file(&runpath, None),
            Err(Error::DuplicateIndex { index: 0, .. })
        ));
        assert!(ens.is_empty());
    }

    #[test]
    fn test_runpath_file_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let runpath = dir.path().join("runpath");
        write(&runpath, "abc /x\n");
        let mut ens = Ensemble::new("e", config(), Arc::new(DefaultLoader::new())).unwrap();
        assert!(matches!(
            ens.add_from_runpath_file(&runpath, None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_key_equals() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("realization-0/parameters.txt"), "MODE 1\n");
        write(&dir.path().join("realization-1/parameters.txt"), "MODE 2\n");
        write(&dir.path().join("realization-2/parameters.txt"), "MODE 1.0\n");
        std::fs::create_dir_all(dir.path().join("realization-3")).unwrap();

        let mut ens = Ensemble::discover("e", dir.path(), config(), Arc::new(DefaultLoader::new())).unwrap();
        let removed = ens
            .filter(&Requirement::KeyEquals {
                artifact: "parameters".into(),
                key: "MODE".into(),
                value: Value::Integer(1),
            })
            .await
            .unwrap();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(ens.indices(), vec![0, 2]);
        assert_eq!(ens.loaded_artifacts(), vec!["parameters".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_realizations() {
        let mut ens = Ensemble::new("e", config(), Arc::new(DefaultLoader::new())).unwrap();
        for i in 0..4 {
            ens.add_realization(format!("/tmp/r{i}"), i).unwrap();
        }
        assert_eq!(ens.remove_realizations(&[1, 3, 7]), 2);
        assert_eq!(ens.indices(), vec![0, 2]);
    }

    /// Tracks how many loads run at once.
    #[derive(Default)]
    struct InFlightLoader {
        in_flight: std::sync::atomic::AtomicUsize,
        max_in_flight: std::sync::atomic::AtomicUsize,
    }

    impl FileLoader for InFlightLoader {
        fn load(&self, _path: &Path, spec: &ArtifactSpec) -> std::result::Result<Record, LoadError> {
            use std::sync::atomic::Ordering;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Record::ScalarSet(
                [(spec.name.clone(), Value::Integer(1))].into_iter().collect(),
            ))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_collect_loads_realizations_in_parallel() {
        let loader = Arc::new(InFlightLoader::default());
        let mut ens = Ensemble::new("e", EnsembleConfig::default(), loader.clone()).unwrap();
        for i in 0..12 {
            ens.add_realization(format!("/nonexistent/realization-{i}"), i)
                .unwrap();
        }

        let options = LoadOptions::default().with_max_concurrency(4);
        let collection = ens.collect("x.txt", &options).await.unwrap();
        assert_eq!(collection.table.num_rows(), 12);
        assert!(collection.skipped.is_empty());

        let peak = loader
            .max_in_flight
            .load(std::sync::atomic::Ordering::SeqCst);
        assert!(peak > 1, "loads ran one at a time");
        assert!(peak <= 4, "{peak} loads exceeded the limit of 4");
    }

    #[test]
    fn test_load_options() {
        let config = EnsembleConfig {
            load_timeout_ms: Some(1_000),
            max_concurrency: 3,
            ..EnsembleConfig::default()
        };
        let opts = LoadOptions::from_config(&config);
        assert!(opts.deadline.is_some());
        assert_eq!(opts.max_concurrency, 3);
        assert_eq!(LoadOptions::default().with_max_concurrency(0).max_concurrency, 1);
        assert!(LoadOptions::default().deadline.is_none());
    }
}
