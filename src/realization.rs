//! One simulation run and its lazily loaded artifacts
//!
//! ## Cache Design
//!
//! ```text
//! DashMap<artifact name, watch::Receiver<Option<Outcome>>>
//!            │                   │
//!            │                   └─ single flight: the first caller spawns the
//!            │                      load, which publishes its outcome here;
//!            │                      every caller waits on a receiver
//!            └─ shard lock held only to fetch or insert, never across an await
//! ```
//!
//! The load runs in its own task, so a caller that is cancelled or gives up
//! at its deadline never abandons it. An outcome, success or failure, is
//! published once and never replaced, so a realization attempts each
//! artifact at most once per process lifetime. Different artifacts load
//! concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ArtifactCatalog, ArtifactSpec, EnsembleConfig};
use crate::error::LoadError;
use crate::jobs::{self, JobRecord};
use crate::loader::FileLoader;
use crate::record::Record;
use crate::Result;

/// Result of loading one artifact, as cached.
pub type Outcome = std::result::Result<Arc<Record>, LoadError>;

type Slot = watch::Receiver<Option<Outcome>>;

/// Health of a realization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// No failure marker and every requested artifact loaded
    Ok,
    /// A failure marker or failed job was found at construction
    Failed,
    /// At least one requested artifact could not be loaded
    MissingData,
}

/// One realization directory.
pub struct Realization {
    index: u32,
    root: PathBuf,
    catalog: Arc<ArtifactCatalog>,
    loader: Arc<dyn FileLoader>,
    failed: bool,
    jobs: Vec<JobRecord>,
    cache: DashMap<String, Slot>,
}

impl std::fmt::Debug for Realization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realization")
            .field("index", &self.index)
            .field("root", &self.root)
            .field("failed", &self.failed)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Realization {
    /// Open a realization rooted at `root`.
    ///
    /// Failure markers and the job status file are inspected here, once;
    /// nothing else is read until an artifact is requested. A status file
    /// that was found is cached as the artifact of the same name.
    pub fn new(
        index: u32,
        root: impl Into<PathBuf>,
        config: &EnsembleConfig,
        catalog: Arc<ArtifactCatalog>,
        loader: Arc<dyn FileLoader>,
    ) -> Self {
        let root = root.into();
        let cache: DashMap<String, Slot> = DashMap::new();

        let jobs = match &config.status_file {
            Some(name) => match jobs::load_status(&root.join(name)) {
                Some(jobs) => {
                    match jobs::status_table(&jobs) {
                        Ok(table) => {
                            let record = Arc::new(Record::TimeTable(table));
                            let (_, slot) = watch::channel(Some(Ok(record)));
                            cache.insert(name.clone(), slot);
                        }
                        Err(e) => warn!(realization = index, error = %e, "Could not tabulate jobs"),
                    }
                    jobs
                }
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let marker = config
            .failure_markers
            .iter()
            .find(|marker| root.join(marker).exists());
        let failed_job = jobs.iter().find(|job| job.failed());

        if let Some(marker) = marker {
            warn!(realization = index, marker = %marker, "Failure marker present");
        }
        if let Some(job) = failed_job {
            warn!(
                realization = index,
                job = %job.name,
                error = job.error.as_deref().unwrap_or_default(),
                "Job reported an error"
            );
        }
        let failed = marker.is_some() || failed_job.is_some();

        info!(realization = index, root = %root.display(), failed, "Initialized realization");

        Self {
            index,
            root,
            catalog,
            loader,
            failed,
            jobs,
            cache,
        }
    }

    /// Realization index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Realization root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Jobs parsed from the status file (empty if there was none).
    #[must_use]
    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    /// Whether the realization was marked failed at construction.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// Current status.
    ///
    /// `Failed` overrides everything; otherwise any cached load failure
    /// degrades the realization to `MissingData`.
    #[must_use]
    pub fn status(&self) -> Status {
        if self.failed {
            Status::Failed
        } else if self
            .cache
            .iter()
            .any(|entry| matches!(*entry.value().borrow(), Some(Err(_))))
        {
            Status::MissingData
        } else {
            Status::Ok
        }
    }

    /// Cached outcome for an artifact, `None` if it was never loaded or is
    /// still loading.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<Outcome> {
        self.cache
            .get(name)
            .and_then(|slot| slot.value().borrow().clone())
    }

    /// Status of one artifact, `None` if it was never requested.
    #[must_use]
    pub fn artifact_status(&self, name: &str) -> Option<Status> {
        self.cached(name).map(|outcome| match outcome {
            Ok(_) => Status::Ok,
            Err(_) => Status::MissingData,
        })
    }

    /// Names of artifacts loaded successfully, sorted.
    #[must_use]
    pub fn loaded_artifacts(&self) -> Vec<String> {
        self.cached_names(|outcome| outcome.is_ok())
    }

    /// Names of artifacts whose load failed, sorted.
    #[must_use]
    pub fn missing_artifacts(&self) -> Vec<String> {
        self.cached_names(|outcome| outcome.is_err())
    }

    fn cached_names(&self, keep: impl Fn(&Outcome) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.value().borrow().as_ref().is_some_and(&keep))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Get an artifact by name, loading it on first request.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::UnsupportedFormat`] if the name cannot be resolved
    /// - the cached load failure otherwise
    pub async fn get_artifact(&self, name: &str) -> Result<Arc<Record>> {
        let spec = self.catalog.resolve(name)?;
        Ok(self.load_artifact(&spec, None).await?)
    }

    /// Load an artifact through the cache.
    ///
    /// The first call for `spec.name` spawns the load on the blocking pool
    /// and caches its outcome; every later or concurrent call returns that
    /// outcome. A load that overruns the first caller's `deadline` is cached
    /// as [`LoadError::Timeout`].
    ///
    /// A caller joining a load already in flight waits at most until its own
    /// `deadline`, then gets `Timeout` while the load carries on and caches
    /// its own outcome. If the deadline has already passed before any
    /// attempt, `Timeout` is returned and the cache is left untouched.
    pub async fn load_artifact(&self, spec: &ArtifactSpec, deadline: Option<Instant>) -> Outcome {
        let path = spec.resolve(&self.root);
        let (slot, joined) = match self.cache.entry(spec.name.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(LoadError::Timeout {
                        path,
                        after: Duration::ZERO,
                    });
                }
                let (publish, slot) = watch::channel(None);
                entry.insert(slot.clone());
                tokio::spawn(run_load(
                    self.index,
                    Arc::clone(&self.loader),
                    spec.clone(),
                    path.clone(),
                    deadline,
                    publish,
                ));
                (slot, false)
            }
        };

        let ready = slot.borrow().clone();
        if let Some(outcome) = ready {
            return outcome;
        }

        // The spawned load enforces the first caller's deadline itself
        match deadline {
            Some(deadline) if joined => {
                let started = Instant::now();
                match tokio::time::timeout_at(deadline, wait_outcome(slot, &path)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let after = started.elapsed();
                        debug!(
                            realization = self.index,
                            artifact = %spec.name,
                            ?after,
                            "Gave up waiting on load in flight"
                        );
                        Err(LoadError::Timeout { path, after })
                    }
                }
            }
            _ => wait_outcome(slot, &path).await,
        }
    }
}

async fn wait_outcome(mut slot: Slot, path: &Path) -> Outcome {
    let outcome = match slot.wait_for(Option::is_some).await {
        Ok(published) => published.clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| Err(LoadError::decode(path, "load task ended without an outcome")))
}

async fn run_load(
    realization: u32,
    loader: Arc<dyn FileLoader>,
    spec: ArtifactSpec,
    path: PathBuf,
    deadline: Option<Instant>,
    publish: watch::Sender<Option<Outcome>>,
) {
    let started = Instant::now();
    let task_path = path.clone();
    let name = spec.name.clone();
    let task = tokio::task::spawn_blocking(move || loader.load(&task_path, &spec));

    let joined = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, task).await.ok(),
        None => Some(task.await),
    };

    let outcome = match joined {
        Some(Ok(result)) => result.map(Arc::new),
        Some(Err(e)) => Err(LoadError::decode(&path, format!("loader task failed: {e}"))),
        None => {
            let after = started.elapsed();
            warn!(realization, artifact = %name, ?after, "Load timed out");
            Err(LoadError::Timeout { path, after })
        }
    };

    match &outcome {
        Ok(_) => debug!(
            realization,
            artifact = %name,
            elapsed = ?started.elapsed(),
            "Loaded artifact"
        ),
        Err(LoadError::Timeout { .. }) => {}
        Err(e) => warn!(realization, artifact = %name, error = %e, "Artifact unavailable"),
    }
    publish.send_replace(Some(outcome));
}
