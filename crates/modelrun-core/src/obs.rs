//! Structured observability hooks for the run lifecycle.
//!
//! Every lifecycle event carries a stable `event` field so log pipelines can
//! filter on it:
//! - `run.lock_busy`: the gate stayed busy, the task goes back to the queue
//! - `run.started`: the lock is held and the run begins
//! - `run.workspace_ready`: inputs extracted and resolved
//! - `run.finished` / `run.failed`
//! - `workspace.cleaned`
//!
//! Events are emitted at `info!` level except `run.failed` (`error!`).
//! For JSON output, start the worker with `--json`.

use std::path::Path;
use tracing::{error, info, Span};

/// Span tagging every record of one delivery with its task id.
///
/// Attach it with `tracing::Instrument` so the handler future stays `Send`.
pub fn run_span(task_id: &str) -> Span {
    tracing::info_span!("modelrun.task", task_id = %task_id)
}

/// Emit event: lock contention; the task will be redelivered.
pub fn emit_lock_busy(task_id: &str, waited_ms: u64, retry_after_secs: u64) {
    info!(
        event = "run.lock_busy",
        task_id = %task_id,
        waited_ms = waited_ms,
        retry_after_secs = retry_after_secs,
        "resource lock busy, rescheduling"
    );
}

/// Emit event: run started with its input bundle and module.
pub fn emit_run_started(task_id: &str, input_id: &str, supplier_id: &str, module: &str) {
    info!(
        event = "run.started",
        task_id = %task_id,
        input_id = %input_id,
        supplier_id = %supplier_id,
        module = %module,
    );
}

pub fn emit_workspace_ready(task_id: &str, workspace: &Path, static_mount: &str, defaults_copied: usize) {
    info!(
        event = "run.workspace_ready",
        task_id = %task_id,
        workspace = %workspace.display(),
        static_mount = %static_mount,
        defaults_copied = defaults_copied,
    );
}

/// Emit event: run finished and its output bundle is published.
pub fn emit_run_finished(task_id: &str, output_id: &str, duration_ms: u64, archive_bytes: u64) {
    info!(
        event = "run.finished",
        task_id = %task_id,
        output_id = %output_id,
        duration_ms = duration_ms,
        archive_bytes = archive_bytes,
    );
}

/// Emit event: run failed (error level, with the taxonomy kind).
pub fn emit_run_failed(task_id: &str, kind: &str, error: &dyn std::fmt::Display) {
    error!(event = "run.failed", task_id = %task_id, kind = %kind, error = %error);
}

pub fn emit_workspace_cleaned(workspace: &Path) {
    info!(event = "workspace.cleaned", workspace = %workspace.display());
}
