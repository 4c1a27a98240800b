//! Error types for modelrun-gate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while operating the resource gate.
///
/// Contention is not an error: a busy lock is reported as
/// [`Acquisition::Busy`](crate::Acquisition::Busy).
#[derive(Error, Debug)]
pub enum GateError {
    /// The lock file (or its parent directory) could not be opened
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS rejected the lock or unlock call for a reason other than contention
    #[error("lock operation on {path} failed: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Gate constructed with unusable parameters
    #[error("invalid gate configuration: {0}")]
    InvalidConfig(String),
}
