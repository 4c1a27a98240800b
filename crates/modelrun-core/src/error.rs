//! Worker error taxonomy.
//!
//! Every failure a run can hit maps onto one [`ErrorKind`]. Lock contention
//! is deliberately absent: a busy gate is an outcome, not an error.

use std::path::PathBuf;

/// Coarse classification used by the task-queue adapter and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Malformed,
    Corruption,
    ComputationFailure,
    Configuration,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Corruption => "corruption",
            ErrorKind::ComputationFailure => "computation_failure",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while preparing, running or archiving an analysis.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("input archive not found: {0}")]
    InputNotFound(PathBuf),

    #[error("model data not found: {0}")]
    ModelDataNotFound(PathBuf),

    #[error("could not find {file} data file: {path}")]
    DataFileNotFound { file: &'static str, path: PathBuf },

    #[error("input archive is not a tar file: {0}")]
    MalformedArchive(PathBuf),

    #[error("unsafe archive entry {entry} in {archive}")]
    UnsafeArchiveEntry { archive: PathBuf, entry: String },

    #[error("input archive did not extract correctly: {0} is missing")]
    ExtractionIncomplete(PathBuf),

    #[error("computation module for supplier {supplier_id} failed: {source}")]
    Computation {
        supplier_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("analysis settings missing required key: {0}")]
    MissingSetting(String),

    #[error("invalid analysis settings: {0}")]
    InvalidSettings(String),

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error("resource gate error: {0}")]
    Gate(#[from] modelrun_gate::GateError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WorkerError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::InputNotFound(_)
            | WorkerError::ModelDataNotFound(_)
            | WorkerError::DataFileNotFound { .. } => ErrorKind::NotFound,
            WorkerError::MalformedArchive(_) | WorkerError::UnsafeArchiveEntry { .. } => {
                ErrorKind::Malformed
            }
            WorkerError::ExtractionIncomplete(_) => ErrorKind::Corruption,
            WorkerError::Computation { .. } => ErrorKind::ComputationFailure,
            WorkerError::MissingSetting(_)
            | WorkerError::InvalidSettings(_)
            | WorkerError::InvalidConfig(_) => ErrorKind::Configuration,
            WorkerError::Gate(_) | WorkerError::Io { .. } | WorkerError::Serialization(_) => {
                ErrorKind::Io
            }
        }
    }
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
