use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Malformed pair list. Fatal at load time, names the first offending row/column.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("failed to read pair list {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV in {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("missing required column '{column}'")]
    MissingColumn { column: String },

    #[error("empty value for '{column}' at row {row}")]
    EmptyValue { row: usize, column: String },

    #[error("non-numeric value for '{column}' at row {row}: {value:?}")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
}

/// Something the run needs before the first dispatch is missing.
#[derive(Debug, Error)]
pub enum PrerequisiteError {
    #[error("GNINA binary not found: {0:?}")]
    MissingBinary(PathBuf),

    #[error("container image not found: {0:?}")]
    MissingImage(PathBuf),

    #[error("required input not found: {0:?}")]
    MissingInput(PathBuf),

    #[error("required directory not found: {0:?}")]
    MissingDirectory(PathBuf),
}

/// Why a single dispatch did not produce a pose file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    NonZeroExit { code: Option<i32> },
    Timeout { secs: u64 },
    MissingInput { path: PathBuf },
    MissingOutput { path: PathBuf },
    SpawnFailed { message: String },
    WorkerCrashed { message: String },
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NonZeroExit { .. } => "error",
            FailureKind::Timeout { .. } => "timeout",
            FailureKind::MissingInput { .. } => "missing_input",
            FailureKind::MissingOutput { .. } => "missing_output",
            FailureKind::SpawnFailed { .. } => "spawn_failed",
            FailureKind::WorkerCrashed { .. } => "worker_crashed",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NonZeroExit { code: Some(c) } => write!(f, "exited with status {}", c),
            FailureKind::NonZeroExit { code: None } => write!(f, "terminated by signal"),
            FailureKind::Timeout { secs } => write!(f, "timeout after {}s", secs),
            FailureKind::MissingInput { path } => write!(f, "input not found: {:?}", path),
            FailureKind::MissingOutput { path } => {
                write!(f, "exited cleanly but produced no pose file: {:?}", path)
            }
            FailureKind::SpawnFailed { message } => write!(f, "failed to spawn: {}", message),
            FailureKind::WorkerCrashed { message } => write!(f, "worker crashed: {}", message),
        }
    }
}

/// Non-fatal quality problem found while aggregating a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum AggregationWarning {
    MissingScore { field: String },
    NonFiniteScore { field: String, value: String },
    NoPoses,
    UnreadablePoseFile { message: String },
}

impl std::fmt::Display for AggregationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationWarning::MissingScore { field } => write!(f, "missing {}", field),
            AggregationWarning::NonFiniteScore { field, value } => {
                write!(f, "non-finite {}={}", field, value)
            }
            AggregationWarning::NoPoses => write!(f, "no poses"),
            AggregationWarning::UnreadablePoseFile { message } => {
                write!(f, "unreadable pose file: {}", message)
            }
        }
    }
}
