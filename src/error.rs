//! Error types for trueno-ensemble
//!
//! Two layers:
//! - [`LoadError`]: per-artifact outcome of a failed load. Cheap to clone,
//!   cached by the owning realization and never thrown during ensemble fan-out.
//! - [`Error`]: everything surfaced to a caller. Registration and aggregation
//!   errors carry enough context (realization, artifact, column) to diagnose
//!   without re-running.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::record::ValueKind;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to load one artifact from one realization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Artifact file absent
    #[error("Artifact not found: {}", path.display())]
    NotFound {
        /// Resolved path that was probed
        path: PathBuf,
    },

    /// Artifact present but malformed
    #[error("Failed to decode {}: {reason}", path.display())]
    Decode {
        /// Resolved path
        path: PathBuf,
        /// Parser diagnostic
        reason: String,
    },

    /// Load did not finish before the caller's deadline
    #[error("Loading {} timed out after {after:?}", path.display())]
    Timeout {
        /// Resolved path
        path: PathBuf,
        /// Time spent waiting before giving up
        after: Duration,
    },
}

impl LoadError {
    /// Build a decode error from any displayable parser failure.
    pub fn decode(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Path of the artifact that failed.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::NotFound { path } | Self::Decode { path, .. } | Self::Timeout { path, .. } => {
                path
            }
        }
    }
}

/// trueno-ensemble error types
#[derive(Error, Debug)]
pub enum Error {
    /// Artifact file absent
    #[error("Artifact not found: {}", path.display())]
    NotFound {
        /// Resolved path
        path: PathBuf,
    },

    /// Artifact malformed
    #[error("Failed to decode {}: {reason}", path.display())]
    Decode {
        /// Resolved path
        path: PathBuf,
        /// Parser diagnostic
        reason: String,
    },

    /// Artifact load overran its deadline
    #[error("Loading {} timed out after {after:?}", path.display())]
    Timeout {
        /// Resolved path
        path: PathBuf,
        /// Time spent waiting
        after: Duration,
    },

    /// Realization index registered twice
    #[error("Realization index {index} is already registered in ensemble '{ensemble}'")]
    DuplicateIndex {
        /// Ensemble name
        ensemble: String,
        /// Offending index
        index: u32,
    },

    /// Ensemble name registered twice in a set
    #[error("Ensemble '{name}' is already part of ensemble set '{set}'")]
    DuplicateEnsemble {
        /// Ensemble set name
        set: String,
        /// Offending ensemble name
        name: String,
    },

    /// Same column used with incompatible value kinds across realizations
    #[error(
        "Schema conflict in '{artifact}': column '{column}' is {expected} in realization \
         {first_realization} but {found} in realization {realization}"
    )]
    SchemaConflict {
        /// Artifact being aggregated
        artifact: String,
        /// Conflicting column
        column: String,
        /// Realization that first defined the column
        first_realization: u32,
        /// Realization with the incompatible kind
        realization: u32,
        /// Kind established by `first_realization`
        expected: ValueKind,
        /// Kind found in `realization`
        found: ValueKind,
    },

    /// Key-value records mixed with tables for the same artifact
    #[error(
        "Record kind conflict in '{artifact}': realization {realization} holds a {found} \
         where earlier realizations hold a {expected}"
    )]
    RecordKindConflict {
        /// Artifact being aggregated
        artifact: String,
        /// Offending realization
        realization: u32,
        /// Record kind of earlier contributors
        expected: &'static str,
        /// Record kind of the offending realization
        found: &'static str,
    },

    /// Format hint missing or not one of the supported formats
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// No realization with this index
    #[error("Unknown realization index: {0}")]
    UnknownRealization(u32),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound { path } => Self::NotFound { path },
            LoadError::Decode { path, reason } => Self::Decode { path, reason },
            LoadError::Timeout { path, after } => Self::Timeout { path, after },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_converts_to_error() {
        let err: Error = LoadError::decode("/r/0/x.csv", "bad header").into();
        match err {
            Error::Decode { path, reason } => {
                assert_eq!(path, PathBuf::from("/r/0/x.csv"));
                assert_eq!(reason, "bad header");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_load_error_path() {
        let err = LoadError::Timeout {
            path: PathBuf::from("a/b"),
            after: Duration::from_millis(5),
        };
        assert_eq!(err.path(), std::path::Path::new("a/b"));
    }
}
