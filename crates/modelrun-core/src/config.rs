//! Worker configuration.
//!
//! Built once at startup (the `modelrund` binary fills it from flags and
//! environment) and injected into the dispatcher. [`WorkerConfig::validate`]
//! runs before the first task is accepted so that per-run code can trust the
//! roots exist.

use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default lock acquisition timeout (30 minutes).
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30 * 60;

/// Default countdown before a contended task is redelivered.
pub const DEFAULT_RETRY_COUNTDOWN_SECS: u64 = 10;

/// Default lock file shared by workers on one resource.
pub const DEFAULT_LOCK_FILE: &str = "/tmp/modelrun.lock";

/// Batch count meaning "let the computation module choose".
pub const AUTO_BATCH_COUNT: i32 = -1;

/// Configuration for a worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Store of input bundles (`{inputs_dir}/{id}.tar`).
    pub inputs_dir: PathBuf,
    /// Store of output bundles (`{outputs_dir}/{id}.tar`).
    pub outputs_dir: PathBuf,
    /// Model data (`{model_data_dir}/{supplier}/{version}/...`).
    pub model_data_dir: PathBuf,
    /// Root under which per-run workspaces are created.
    pub working_dir: PathBuf,
    /// Batch count passed to the computation module.
    pub batch_count: i32,
    /// Copy static model data instead of symlinking it (hosts without symlinks).
    pub copy_static_data: bool,
    /// Lock file serializing runs on this resource.
    pub lock_file: PathBuf,
    /// How long to wait for the resource lock before rescheduling.
    pub lock_timeout_secs: u64,
    /// Interval between lock attempts while waiting.
    pub lock_poll_interval_ms: u64,
    /// Countdown handed back to the task queue on contention.
    pub retry_countdown_secs: u64,
    /// Keep workspaces on disk after the run (debugging).
    pub retain_workspaces: bool,
    /// Run the computation module with the workspace as working directory.
    pub enter_workspace_dir: bool,
}

impl WorkerConfig {
    /// Configuration rooted at the four data directories, with defaults elsewhere.
    pub fn new(
        inputs_dir: impl Into<PathBuf>,
        outputs_dir: impl Into<PathBuf>,
        model_data_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inputs_dir: inputs_dir.into(),
            outputs_dir: outputs_dir.into(),
            model_data_dir: model_data_dir.into(),
            working_dir: working_dir.into(),
            batch_count: AUTO_BATCH_COUNT,
            copy_static_data: false,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            lock_poll_interval_ms: 250,
            retry_countdown_secs: DEFAULT_RETRY_COUNTDOWN_SECS,
            retain_workspaces: false,
            enter_workspace_dir: true,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn retry_countdown(&self) -> Duration {
        Duration::from_secs(self.retry_countdown_secs)
    }

    /// Check that every root exists and numeric settings are usable.
    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("inputs_dir", &self.inputs_dir),
            ("outputs_dir", &self.outputs_dir),
            ("model_data_dir", &self.model_data_dir),
            ("working_dir", &self.working_dir),
        ] {
            require_dir(name, dir)?;
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(WorkerError::InvalidConfig(
                "lock_poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.retry_countdown_secs == 0 {
            return Err(WorkerError::InvalidConfig(
                "retry_countdown_secs must be non-zero".to_string(),
            ));
        }
        if self.batch_count == 0 || self.batch_count < AUTO_BATCH_COUNT {
            return Err(WorkerError::InvalidConfig(format!(
                "batch_count must be positive or {AUTO_BATCH_COUNT}, got {}",
                self.batch_count
            )));
        }
        if self.lock_file.as_os_str().is_empty() {
            return Err(WorkerError::InvalidConfig("lock_file must be set".to_string()));
        }
        Ok(())
    }

    /// Validate, then resolve every root and the lock file to an absolute path.
    ///
    /// Workspaces symlink into the model data store and the process working
    /// directory moves during a run, so relative paths would resolve against
    /// the wrong base.
    pub fn into_absolute(mut self) -> Result<Self> {
        self.validate()?;
        for (name, dir) in [
            ("inputs_dir", &mut self.inputs_dir),
            ("outputs_dir", &mut self.outputs_dir),
            ("model_data_dir", &mut self.model_data_dir),
            ("working_dir", &mut self.working_dir),
        ] {
            *dir = dir.canonicalize().map_err(|e| {
                WorkerError::io(format!("resolving {name} {}", dir.display()), e)
            })?;
        }
        if self.lock_file.is_relative() {
            let cwd = std::env::current_dir()
                .map_err(|e| WorkerError::io("resolving lock_file", e))?;
            self.lock_file = cwd.join(&self.lock_file);
        }
        Ok(self)
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!(
            inputs_dir = %self.inputs_dir.display(),
            outputs_dir = %self.outputs_dir.display(),
            model_data_dir = %self.model_data_dir.display(),
            working_dir = %self.working_dir.display(),
            batch_count = self.batch_count,
            copy_static_data = self.copy_static_data,
            lock_file = %self.lock_file.display(),
            lock_timeout_secs = self.lock_timeout_secs,
            "worker configuration"
        );
    }
}

fn require_dir(name: &str, dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(WorkerError::InvalidConfig(format!("{name} must be set")));
    }
    if !dir.is_dir() {
        return Err(WorkerError::InvalidConfig(format!(
            "{name} is not a directory: {}",
            dir.display()
        )));
    }
    Ok(())
}
