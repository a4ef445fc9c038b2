//! Tests for error types

use std::path::PathBuf;
use std::time::Duration;

use trueno_ensemble::{Error, LoadError, ValueKind};

#[test]
fn test_not_found_error() {
    let error: Error = LoadError::NotFound {
        path: PathBuf::from("/ens/realization-3/OK"),
    }
    .into();
    let error_str = format!("{error}");
    assert!(error_str.contains("Artifact not found"));
    assert!(error_str.contains("realization-3/OK"));
}

#[test]
fn test_decode_error() {
    let error = LoadError::decode("/ens/realization-0/unsmry.csv", "row 4: bad date");
    let error_str = format!("{error}");
    assert!(error_str.contains("Failed to decode"));
    assert!(error_str.contains("row 4: bad date"));
}

#[test]
fn test_timeout_error() {
    let error = Error::from(LoadError::Timeout {
        path: PathBuf::from("x.csv"),
        after: Duration::from_millis(250),
    });
    let error_str = format!("{error}");
    assert!(error_str.contains("timed out"));
    assert!(error_str.contains("250ms"));
}

#[test]
fn test_duplicate_index_error() {
    let error = Error::DuplicateIndex {
        ensemble: "iter-0".to_string(),
        index: 7,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Realization index 7"));
    assert!(error_str.contains("iter-0"));
}

#[test]
fn test_duplicate_ensemble_error() {
    let error = Error::DuplicateEnsemble {
        set: "case".to_string(),
        name: "iter-1".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("'iter-1'"));
    assert!(error_str.contains("set 'case'"));
}

#[test]
fn test_schema_conflict_error_carries_context() {
    let error = Error::SchemaConflict {
        artifact: "parameters".to_string(),
        column: "MODE".to_string(),
        first_realization: 0,
        realization: 4,
        expected: ValueKind::Integer,
        found: ValueKind::Text,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("'parameters'"));
    assert!(error_str.contains("'MODE'"));
    assert!(error_str.contains("integer in realization 0"));
    assert!(error_str.contains("text in realization 4"));
}

#[test]
fn test_record_kind_conflict_error() {
    let error = Error::RecordKindConflict {
        artifact: "npv".to_string(),
        realization: 2,
        expected: "key-value set",
        found: "time table",
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("realization 2 holds a time table"));
}

#[test]
fn test_unsupported_format_error() {
    let error = Error::UnsupportedFormat("no format registered for extension '.UNSMRY'".to_string());
    assert!(format!("{error}").contains("Unsupported file format"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error: Error = io_error.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_error_debug() {
    let error = Error::UnknownRealization(9);
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("UnknownRealization"));
}
