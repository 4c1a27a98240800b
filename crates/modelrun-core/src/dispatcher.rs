//! Task handler: gate, prepare, compute, archive.
//!
//! [`RunDispatcher::handle`] is what the task-queue adapter calls once per
//! delivery. It never returns an error; the three possible results are
//! spelled out in [`TaskOutcome`] and the adapter maps them onto whatever
//! retry/failure primitive its queue offers:
//!
//! - `Completed`: an output bundle was published
//! - `Rescheduled`: the resource lock stayed busy; redeliver after the countdown
//! - `Failed`: a fatal error; do not retry
//!
//! Only contention is ever rescheduled. The lock is held from workspace
//! preparation through archival and released before `handle` returns.

use crate::archive::ArchiveSummary;
use crate::config::WorkerConfig;
use crate::error::{ErrorKind, Result, WorkerError};
use crate::module::{ModuleContext, ModuleRegistry, ModuleSource, ResolvedModule};
use crate::obs;
use crate::resolver::Resolution;
use crate::settings::SettingsDocument;
use crate::workspace::{ArchivedOutput, PreparedRun, ScopedWorkingDir, WorkspaceManager};
use chrono::{DateTime, Utc};
use modelrun_gate::{Acquisition, ResourceGate};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

/// Externally visible task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Completed,
    Rescheduled,
    Failed,
}

/// One state transition, as written to the status side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub task_id: String,
    pub state: TaskState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Side channel for task state transitions.
pub trait StatusReporter: Send + Sync {
    fn report(&self, update: &StatusUpdate);
}

/// Reporter that writes transitions to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, update: &StatusUpdate) {
        info!(
            task_id = %update.task_id,
            state = ?update.state,
            detail = update.detail.as_deref().unwrap_or(""),
            "task state"
        );
    }
}

/// Reporter that keeps every transition in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the transitions reported so far.
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    /// States reported for one task, in order.
    pub fn states_for(&self, task_id: &str) -> Vec<TaskState> {
        self.updates()
            .into_iter()
            .filter(|u| u.task_id == task_id)
            .map(|u| u.state)
            .collect()
    }
}

impl StatusReporter for MemoryReporter {
    fn report(&self, update: &StatusUpdate) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(update.clone());
        }
    }
}

/// Result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed {
        output_id: String,
        archive: ArchiveSummary,
    },
    Rescheduled {
        retry_after: Duration,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl TaskOutcome {
    pub fn output_id(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { output_id, .. } => Some(output_id),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn is_rescheduled(&self) -> bool {
        matches!(self, TaskOutcome::Rescheduled { .. })
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed { .. } => TaskState::Completed,
            TaskOutcome::Rescheduled { .. } => TaskState::Rescheduled,
            TaskOutcome::Failed { .. } => TaskState::Failed,
        }
    }
}

/// The task handler.
pub struct RunDispatcher {
    config: WorkerConfig,
    gate: ResourceGate,
    workspaces: WorkspaceManager,
    modules: ModuleRegistry,
    reporter: Arc<dyn StatusReporter>,
}

impl RunDispatcher {
    /// Build a dispatcher; the configuration is validated and made absolute
    /// here, once.
    pub fn new(
        config: WorkerConfig,
        modules: ModuleRegistry,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        let config = config.into_absolute()?;
        let gate = ResourceGate::new(config.lock_file.clone())
            .with_poll_interval(config.lock_poll_interval())?;
        let workspaces = WorkspaceManager::new(&config);
        Ok(Self {
            config,
            gate,
            workspaces,
            modules,
            reporter,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.gate
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Handle one delivery of `(input_id, settings)`.
    pub async fn handle(&self, task_id: &str, input_id: &str, settings: Value) -> TaskOutcome {
        self.handle_delivery(task_id, input_id, settings)
            .instrument(obs::run_span(task_id))
            .await
    }

    async fn handle_delivery(&self, task_id: &str, input_id: &str, settings: Value) -> TaskOutcome {
        // Settings errors are fatal and need no lock.
        let doc = match SettingsDocument::from_value(settings) {
            Ok(doc) => doc,
            Err(e) => return self.fail(task_id, e),
        };

        let lock = match self.gate.try_acquire(self.config.lock_timeout()).await {
            Ok(Acquisition::Held(lock)) => lock,
            Ok(Acquisition::Busy { waited }) => {
                let retry_after = self.config.retry_countdown();
                obs::emit_lock_busy(
                    task_id,
                    waited.as_millis() as u64,
                    retry_after.as_secs(),
                );
                self.report(task_id, TaskState::Rescheduled, None);
                return TaskOutcome::Rescheduled { retry_after };
            }
            Err(e) => return self.fail(task_id, e.into()),
        };
        info!(lock = %self.gate.lock_path().display(), "acquired resource lock");

        self.report(task_id, TaskState::Running, None);
        let start = Instant::now();
        let result = self.execute(task_id, input_id, &doc).await;

        if let Err(e) = lock.release() {
            warn!(err = %e, "failed to release resource lock cleanly");
        }

        match result {
            Ok(ArchivedOutput { output_id, archive }) => {
                obs::emit_run_finished(
                    task_id,
                    &output_id,
                    start.elapsed().as_millis() as u64,
                    archive.size_bytes,
                );
                self.report(task_id, TaskState::Completed, Some(output_id.clone()));
                TaskOutcome::Completed { output_id, archive }
            }
            Err(e) => self.fail(task_id, e),
        }
    }

    /// prepare → compute → archive. The caller holds the gate.
    async fn execute(
        &self,
        task_id: &str,
        input_id: &str,
        doc: &SettingsDocument,
    ) -> Result<ArchivedOutput> {
        let settings = doc.settings();
        let resolved = self.modules.resolve(&settings.module_supplier_id);
        if resolved.source == ModuleSource::Default {
            info!(supplier = %settings.module_supplier_id, "no supplier module registered, using default");
        }
        obs::emit_run_started(
            task_id,
            input_id,
            &settings.module_supplier_id,
            resolved.module.name(),
        );

        let prepared = self.workspaces.prepare(input_id, doc)?;
        let defaults_copied = prepared
            .resolved_inputs
            .iter()
            .filter(|r| matches!(r.resolution, Resolution::CopiedDefault { .. }))
            .count();
        obs::emit_workspace_ready(
            task_id,
            prepared.workspace.root(),
            prepared.static_mount.as_str(),
            defaults_copied,
        );

        let result = self.compute_and_archive(&resolved, &prepared, doc).await;
        self.workspaces.discard(&prepared.workspace);
        result
    }

    async fn compute_and_archive(
        &self,
        resolved: &ResolvedModule,
        prepared: &PreparedRun,
        doc: &SettingsDocument,
    ) -> Result<ArchivedOutput> {
        let workspace = &prepared.workspace;
        {
            let _cwd = if self.config.enter_workspace_dir {
                Some(ScopedWorkingDir::enter(workspace.root(), &self.config.working_dir)?)
            } else {
                None
            };
            let ctx = ModuleContext {
                settings: doc.analysis_map(),
                batch_count: self.config.batch_count,
                workspace,
            };
            resolved
                .module
                .run(&ctx)
                .await
                .map_err(|source| WorkerError::Computation {
                    supplier_id: doc.settings().module_supplier_id.clone(),
                    source,
                })?;
        }
        self.workspaces.archive_output(workspace)
    }

    fn fail(&self, task_id: &str, err: WorkerError) -> TaskOutcome {
        let kind = err.kind();
        obs::emit_run_failed(task_id, kind.as_str(), &format!("{err:#}"));
        let message = err.to_string();
        self.report(task_id, TaskState::Failed, Some(message.clone()));
        TaskOutcome::Failed { kind, message }
    }

    fn report(&self, task_id: &str, state: TaskState, detail: Option<String>) {
        self.reporter.report(&StatusUpdate {
            task_id: task_id.to_string(),
            state,
            at: Utc::now(),
            detail,
        });
    }
}
