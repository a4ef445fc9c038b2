//! Ensemble configuration and the artifact catalog
//!
//! The filesystem layout is configuration, not code: realization directory
//! naming, failure markers and the artifact → file mapping all live here.
//!
//! ```json
//! {
//!   "realization_prefix": "realization-",
//!   "runpath_suffix": "iter-0",
//!   "iteration_prefix": "iter-",
//!   "max_concurrency": 32,
//!   "load_timeout_ms": 30000,
//!   "artifacts": [
//!     { "name": "parameters", "path": "parameters.txt", "format": "keyvalue" },
//!     { "name": "summary", "path": "share/results/unsmry.csv",
//!       "format": "csv", "index_column": "DATE" },
//!     { "name": "OK", "format": "scalar" }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Supported artifact formats.
///
/// Closed set: an artifact whose format cannot be named explicitly or mapped
/// from its extension is rejected, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Comma separated table with header row
    Csv,
    /// Parquet columnar table
    Parquet,
    /// `key value` per line
    #[serde(alias = "txt")]
    KeyValue,
    /// Single value on the first non-blank line
    Scalar,
    /// Flat JSON object of scalars
    Json,
    /// Job status file written by the workflow runner
    Status,
}

impl FileFormat {
    /// Map a file extension to a format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] for unknown extensions
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "parquet" | "pq" => Ok(Self::Parquet),
            "txt" => Ok(Self::KeyValue),
            "json" => Ok(Self::Json),
            other => Err(Error::UnsupportedFormat(format!(
                "no format registered for extension '.{other}'"
            ))),
        }
    }

    /// Map a path or artifact name to a format by its extension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] if there is no extension or it is
    /// unknown
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "'{}' has no extension; configure its format explicitly",
                path.display()
            ))
        })?;
        Self::from_extension(ext)
    }

    /// Canonical extension, `None` for formats without one.
    #[must_use]
    pub const fn extension(self) -> Option<&'static str> {
        match self {
            Self::Csv => Some("csv"),
            Self::Parquet => Some("parquet"),
            Self::KeyValue => Some("txt"),
            Self::Json => Some("json"),
            Self::Scalar | Self::Status => None,
        }
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            "keyvalue" | "txt" => Ok(Self::KeyValue),
            "scalar" => Ok(Self::Scalar),
            "json" => Ok(Self::Json),
            "status" => Ok(Self::Status),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::KeyValue => "keyvalue",
            Self::Scalar => "scalar",
            Self::Json => "json",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// How one named artifact maps onto a file inside a realization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Name callers use to request the artifact
    pub name: String,
    /// Path relative to the realization root (defaults from the name)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Parser to use
    pub format: FileFormat,
    /// Column holding the step/time key for tabular formats
    #[serde(default)]
    pub index_column: Option<String>,
}

impl ArtifactSpec {
    /// Create a spec whose path is derived from the name.
    #[must_use]
    pub fn new(name: impl Into<String>, format: FileFormat) -> Self {
        Self {
            name: name.into(),
            path: None,
            format,
            index_column: None,
        }
    }

    /// Set an explicit relative path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the index column.
    #[must_use]
    pub fn with_index_column(mut self, column: impl Into<String>) -> Self {
        self.index_column = Some(column.into());
        self
    }

    /// Path relative to a realization root.
    ///
    /// Without an explicit path this is the name, with the format's
    /// extension appended when the name does not already carry it.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let has_ext = Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FileFormat::from_extension(e).ok() == Some(self.format));
        match self.format.extension() {
            Some(ext) if !has_ext => PathBuf::from(format!("{}.{ext}", self.name)),
            _ => PathBuf::from(&self.name),
        }
    }

    /// Resolve against a realization root.
    #[must_use]
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

/// Name → spec lookup with extension fallback.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCatalog {
    specs: HashMap<String, ArtifactSpec>,
}

impl ArtifactCatalog {
    /// Build from configured specs.
    ///
    /// # Errors
    ///
    /// Returns error on duplicate artifact names
    pub fn new(specs: impl IntoIterator<Item = ArtifactSpec>) -> Result<Self> {
        let mut map = HashMap::new();
        for spec in specs {
            if map.contains_key(&spec.name) {
                return Err(Error::Config(format!(
                    "artifact '{}' is configured twice",
                    spec.name
                )));
            }
            map.insert(spec.name.clone(), spec);
        }
        Ok(Self { specs: map })
    }

    /// Resolve an artifact name to its spec.
    ///
    /// Configured names win; otherwise the name itself must carry a known
    /// extension (`parameters.txt`, `unsmry.csv`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] when neither applies
    pub fn resolve(&self, name: &str) -> Result<ArtifactSpec> {
        if let Some(spec) = self.specs.get(name) {
            return Ok(spec.clone());
        }
        let format = FileFormat::from_path(name)?;
        Ok(ArtifactSpec::new(name, format))
    }

    /// Number of configured specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no specs are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Default number of realizations loaded at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Ensemble-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnsembleConfig {
    /// Directory name prefix followed by the realization index
    pub realization_prefix: String,
    /// Optional sub-path under each realization directory (e.g. `iter-0`)
    pub runpath_suffix: Option<PathBuf>,
    /// Directory name prefix of iterations, followed by the iteration number
    pub iteration_prefix: String,
    /// Files whose presence marks a realization as failed
    pub failure_markers: Vec<String>,
    /// Job status file, parsed at construction
    pub status_file: Option<String>,
    /// Maximum realizations loading concurrently
    pub max_concurrency: usize,
    /// Per-call load budget in milliseconds (no deadline when unset)
    pub load_timeout_ms: Option<u64>,
    /// Configured artifacts
    pub artifacts: Vec<ArtifactSpec>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            realization_prefix: "realization-".to_string(),
            runpath_suffix: None,
            iteration_prefix: "iter-".to_string(),
            failure_markers: vec!["ERROR".to_string()],
            status_file: Some("STATUS".to_string()),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            load_timeout_ms: None,
            artifacts: Vec::new(),
        }
    }
}

impl EnsembleConfig {
    /// Parse and validate a JSON config string.
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or invalid settings
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Add an artifact spec.
    #[must_use]
    pub fn with_artifact(mut self, spec: ArtifactSpec) -> Self {
        self.artifacts.push(spec);
        self
    }

    /// Check invariants the loader relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero concurrency, an empty prefix or
    /// duplicate artifact names
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if self.realization_prefix.is_empty() {
            return Err(Error::Config("realization_prefix must not be empty".into()));
        }
        if self.iteration_prefix.is_empty() {
            return Err(Error::Config("iteration_prefix must not be empty".into()));
        }
        self.catalog().map(|_| ())
    }

    /// Build the artifact catalog.
    ///
    /// The status file is cataloged under its own name unless an artifact
    /// of that name is configured.
    ///
    /// # Errors
    ///
    /// Returns error on duplicate artifact names
    pub fn catalog(&self) -> Result<ArtifactCatalog> {
        let status = self
            .status_file
            .as_ref()
            .filter(|name| !self.artifacts.iter().any(|a| &a.name == *name))
            .map(|name| ArtifactSpec::new(name.clone(), FileFormat::Status));
        ArtifactCatalog::new(self.artifacts.iter().cloned().chain(status))
    }

    /// Directory name for a realization index.
    #[must_use]
    pub fn realization_dir_name(&self, index: u32) -> String {
        format!("{}{index}", self.realization_prefix)
    }

    /// Parse a realization index out of a directory name.
    #[must_use]
    pub fn parse_realization_dir(&self, dir_name: &str) -> Option<u32> {
        parse_numbered(dir_name, &self.realization_prefix)
    }

    /// Whether a directory name is an iteration (`<iteration_prefix><n>`).
    #[must_use]
    pub fn is_iteration_dir(&self, dir_name: &str) -> bool {
        parse_numbered(dir_name, &self.iteration_prefix).is_some()
    }
}

fn parse_numbered(dir_name: &str, prefix: &str) -> Option<u32> {
    dir_name
        .strip_prefix(prefix)
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
}
