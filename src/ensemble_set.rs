//! Named ensembles side by side
//!
//! An [`EnsembleSet`] holds several ensembles of one case, typically its
//! iterations (`realization-*/iter-0`, `realization-*/iter-1`, ...). Tables
//! from every member are stacked with a leading `ENSEMBLE` column naming the
//! member each row came from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::Aggregator;
use crate::config::EnsembleConfig;
use crate::ensemble::{Ensemble, LoadOptions, Skipped};
use crate::loader::FileLoader;
use crate::stats::Statistic;
use crate::table::{CombinedTable, SummaryTable};
use crate::{Error, Result};

/// Result of collecting one artifact across a set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetCollection {
    /// Stacked table of every ensemble that yielded data
    pub table: CombinedTable,
    /// Skipped realizations per ensemble; ensembles with none are left out
    pub skipped: BTreeMap<String, Vec<Skipped>>,
}

/// Ensembles keyed by name.
#[derive(Debug)]
pub struct EnsembleSet {
    name: String,
    ensembles: BTreeMap<String, Ensemble>,
}

impl EnsembleSet {
    /// Create an empty set.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensembles: BTreeMap::new(),
        }
    }

    /// Create a set from every iteration found under `root`.
    ///
    /// # Errors
    ///
    /// See [`Self::add_ensembles_from_path`]
    pub fn from_path(
        name: impl Into<String>,
        root: impl AsRef<Path>,
        config: &EnsembleConfig,
        loader: Arc<dyn FileLoader>,
    ) -> Result<Self> {
        let mut set = Self::new(name);
        set.add_ensembles_from_path(root, config, loader)?;
        Ok(set)
    }

    /// Add one ensemble under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEnsemble`] if the name is taken
    pub fn add_ensemble(&mut self, ensemble: Ensemble) -> Result<()> {
        if self.ensembles.contains_key(ensemble.name()) {
            return Err(Error::DuplicateEnsemble {
                set: self.name.clone(),
                name: ensemble.name().to_string(),
            });
        }
        debug!(set = %self.name, ensemble = %ensemble.name(), realizations = ensemble.len(), "Added ensemble");
        self.ensembles.insert(ensemble.name().to_string(), ensemble);
        Ok(())
    }

    /// Add one ensemble per iteration found under `root`.
    ///
    /// Looks for `<realization_prefix><index>/<iteration_prefix><n>`
    /// directories and groups them by iteration directory name, which
    /// becomes the ensemble name. `runpath_suffix` is not used here.
    /// Nothing is added if any iteration name is already taken.
    ///
    /// Returns the number of ensembles added.
    ///
    /// # Errors
    ///
    /// Returns error if `root` cannot be read, the configuration is invalid
    /// or an iteration name is already in the set
    pub fn add_ensembles_from_path(
        &mut self,
        root: impl AsRef<Path>,
        config: &EnsembleConfig,
        loader: Arc<dyn FileLoader>,
    ) -> Result<usize> {
        let root = root.as_ref();
        let mut iterations: BTreeMap<String, BTreeMap<u32, PathBuf>> = BTreeMap::new();

        for (name, path) in subdirectories(root)? {
            let Some(index) = config.parse_realization_dir(&name) else {
                continue;
            };
            for (iteration, runpath) in subdirectories(&path)? {
                if config.is_iteration_dir(&iteration) {
                    iterations.entry(iteration).or_default().insert(index, runpath);
                }
            }
        }

        if let Some(taken) = iterations.keys().find(|name| self.ensembles.contains_key(*name)) {
            return Err(Error::DuplicateEnsemble {
                set: self.name.clone(),
                name: taken.clone(),
            });
        }

        let mut ensembles = Vec::with_capacity(iterations.len());
        for (iteration, runpaths) in iterations {
            let mut ensemble = Ensemble::new(iteration, config.clone(), Arc::clone(&loader))?;
            for (index, runpath) in runpaths {
                ensemble.add_realization(runpath, index)?;
            }
            ensembles.push(ensemble);
        }

        let added = ensembles.len();
        for ensemble in ensembles {
            self.add_ensemble(ensemble)?;
        }
        info!(set = %self.name, root = %root.display(), added, "Discovered iterations");
        Ok(added)
    }

    /// Remove an ensemble by name.
    pub fn remove(&mut self, name: &str) -> Option<Ensemble> {
        self.ensembles.remove(name)
    }

    /// Set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ensembles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ensembles.len()
    }

    /// Whether the set has no ensembles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ensembles.is_empty()
    }

    /// Ensemble names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.ensembles.keys().map(String::as_str).collect()
    }

    /// Look up an ensemble.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Ensemble> {
        self.ensembles.get(name)
    }

    /// Look up an ensemble for modification.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Ensemble> {
        self.ensembles.get_mut(name)
    }

    /// Ensembles in name order.
    pub fn ensembles(&self) -> impl Iterator<Item = &Ensemble> {
        self.ensembles.values()
    }

    /// Stack an artifact from every ensemble, each with its own configured
    /// load options.
    ///
    /// # Errors
    ///
    /// Returns error if any ensemble fails to collect or the tables cannot
    /// be reconciled
    pub async fn get_dataframe(&self, artifact: &str) -> Result<CombinedTable> {
        let mut tables = Vec::with_capacity(self.ensembles.len());
        for (name, ensemble) in &self.ensembles {
            tables.push((name.as_str(), ensemble.get_dataframe(artifact).await?));
        }
        self.stack(artifact, &tables)
    }

    /// Stack an artifact from every ensemble under shared load options.
    ///
    /// # Errors
    ///
    /// Returns error if any ensemble fails to collect or the tables cannot
    /// be reconciled
    pub async fn collect(&self, artifact: &str, options: &LoadOptions) -> Result<SetCollection> {
        let mut tables = Vec::with_capacity(self.ensembles.len());
        let mut skipped = BTreeMap::new();
        for (name, ensemble) in &self.ensembles {
            let collection = ensemble.collect(artifact, options).await?;
            if !collection.skipped.is_empty() {
                skipped.insert(name.clone(), collection.skipped);
            }
            tables.push((name.as_str(), collection.table));
        }
        let table = self.stack(artifact, &tables)?;
        Ok(SetCollection { table, skipped })
    }

    /// Summarize an artifact per ensemble.
    ///
    /// # Errors
    ///
    /// Returns error if any ensemble fails to collect or summarize
    pub async fn get_statistics(
        &self,
        artifact: &str,
        statistics: &[Statistic],
    ) -> Result<BTreeMap<String, SummaryTable>> {
        let mut out = BTreeMap::new();
        for (name, ensemble) in &self.ensembles {
            out.insert(name.clone(), ensemble.get_statistics(artifact, statistics).await?);
        }
        Ok(out)
    }

    fn stack(&self, artifact: &str, tables: &[(&str, CombinedTable)]) -> Result<CombinedTable> {
        let labelled: Vec<(&str, &CombinedTable)> =
            tables.iter().map(|(name, table)| (*name, table)).collect();
        let table = Aggregator::new(artifact).concat(&labelled)?;
        info!(
            set = %self.name,
            artifact,
            ensembles = tables.len(),
            rows = table.num_rows(),
            "Stacked artifact"
        );
        Ok(table)
    }
}

fn subdirectories(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.push((name.to_string(), entry.path()));
        }
    }
    Ok(out)
}
