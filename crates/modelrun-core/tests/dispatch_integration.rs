//! Integration tests for task dispatch against on-disk stores.

use async_trait::async_trait;
use modelrun_core::{
    ArchiveCodec, ComputationModule, ErrorKind, MemoryReporter, ModuleContext, ModuleRegistry,
    RunDispatcher, TaskOutcome, TaskState, WorkerConfig,
};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Module that records what it saw and writes a result file.
#[derive(Default)]
struct RecordingModule {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    delay: Duration,
    fail: bool,
    seen_inputs: Mutex<Vec<(String, String)>>,
}

impl RecordingModule {
    fn sleeping(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ComputationModule for RecordingModule {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let mut seen = Vec::new();
        for entry in fs::read_dir(ctx.workspace.input_dir())? {
            let entry = entry?;
            let content = fs::read_to_string(entry.path()).unwrap_or_default();
            seen.push((entry.file_name().to_string_lossy().to_string(), content));
        }
        seen.sort();
        *self.seen_inputs.lock().unwrap() = seen;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("ktools pipeline exited with code 1");
        }
        let batches = ctx.batch_count.to_string();
        fs::write(ctx.workspace.output_dir().join("gul_summary.csv"), batches)?;
        Ok(())
    }
}

struct Stores {
    dir: TempDir,
    config: WorkerConfig,
}

impl Stores {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for d in ["inputs", "outputs", "model_data/acme/v1", "work"] {
            fs::create_dir_all(dir.path().join(d)).unwrap();
        }
        let model = dir.path().join("model_data/acme/v1");
        for (name, body) in [
            ("events.bin", "default events"),
            ("events_baseline.bin", "baseline events"),
            ("returnperiods.bin", "default return periods"),
            ("occurrence.bin", "default occurrence"),
        ] {
            fs::write(model.join(name), body).unwrap();
        }

        let mut config = WorkerConfig::new(
            dir.path().join("inputs"),
            dir.path().join("outputs"),
            dir.path().join("model_data"),
            dir.path().join("work"),
        );
        config.lock_file = dir.path().join("locks/resource.lock");
        config.lock_timeout_secs = 0;
        config.lock_poll_interval_ms = 20;
        config.enter_workspace_dir = false;
        Self { dir, config }
    }

    fn write_input(&self, id: &str, files: &[(&str, &str)]) {
        let file = File::create(self.config.inputs_dir.join(format!("{id}.tar"))).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    fn dispatcher(&self, module: Arc<RecordingModule>, reporter: Arc<MemoryReporter>) -> RunDispatcher {
        RunDispatcher::new(self.config.clone(), ModuleRegistry::with_default(module), reporter).unwrap()
    }

    fn count(&self, dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }
}

fn settings(event_set: &str) -> Value {
    json!({
        "analysis_settings": {
            "source_tag": "portfolio",
            "analysis_tag": "q3",
            "module_supplier_id": "acme",
            "model_version_id": "v1",
            "model_settings": {"event_set": event_set}
        }
    })
}

#[tokio::test]
async fn test_end_to_end_run() {
    let stores = Stores::new();
    stores.write_input(
        "abc123",
        &[("items.bin", "items"), ("occurrence.bin", "user occurrence")],
    );
    let module = Arc::new(RecordingModule::default());
    let reporter = Arc::new(MemoryReporter::new());
    let dispatcher = stores.dispatcher(module.clone(), reporter.clone());

    let outcome = dispatcher.handle("task-1", "abc123", settings("Baseline")).await;
    let output_id = match &outcome {
        TaskOutcome::Completed { output_id, archive } => {
            let outputs_dir = &dispatcher.config().outputs_dir;
            assert_eq!(archive.path, outputs_dir.join(format!("{output_id}.tar")));
            assert_eq!(archive.sha256.len(), 64);
            output_id.clone()
        }
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(module.calls.load(Ordering::SeqCst), 1);

    // Event set variant copied, user occurrence kept, return periods defaulted.
    let seen = module.seen_inputs.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("events.bin".to_string(), "baseline events".to_string()),
            ("items.bin".to_string(), "items".to_string()),
            ("occurrence.bin".to_string(), "user occurrence".to_string()),
            ("returnperiods.bin".to_string(), "default return periods".to_string()),
        ]
    );

    // Exactly one new bundle, rooted at `output`.
    assert_eq!(stores.count(&stores.config.outputs_dir), 1);
    let archive = stores.config.outputs_dir.join(format!("{output_id}.tar"));
    let entries = ArchiveCodec::list_entries(&archive).unwrap();
    assert!(entries.iter().all(|e| e == "output" || e.starts_with("output/")));
    assert!(entries.contains(&"output/gul_summary.csv".to_string()));

    // Workspace removed, model data intact, lock free.
    assert_eq!(stores.count(&stores.config.working_dir), 0);
    assert!(stores.dir.path().join("model_data/acme/v1/occurrence.bin").is_file());
    assert!(!dispatcher.gate().is_held().unwrap());

    assert_eq!(
        reporter.states_for("task-1"),
        vec![TaskState::Running, TaskState::Completed]
    );
    assert_eq!(
        reporter.updates().last().unwrap().detail.as_deref(),
        Some(output_id.as_str())
    );
}

#[tokio::test]
async fn test_concurrent_tasks_single_flight() {
    let stores = Stores::new();
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::sleeping(Duration::from_millis(500)));
    let reporter = Arc::new(MemoryReporter::new());
    let first = stores.dispatcher(module.clone(), reporter.clone());
    let second = stores.dispatcher(module.clone(), reporter.clone());

    let (a, b) = tokio::join!(
        first.handle("task-a", "abc123", settings("Baseline")),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            second.handle("task-b", "abc123", settings("Baseline")).await
        }
    );

    assert!(a.is_completed(), "first task should complete: {a:?}");
    assert_eq!(
        b,
        TaskOutcome::Rescheduled {
            retry_after: Duration::from_secs(10)
        }
    );
    assert_eq!(module.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stores.count(&stores.config.outputs_dir), 1);
    assert_eq!(reporter.states_for("task-b"), vec![TaskState::Rescheduled]);
    assert!(!first.gate().is_held().unwrap());
}

#[tokio::test]
async fn test_waiting_task_runs_after_holder() {
    let mut stores = Stores::new();
    stores.config.lock_timeout_secs = 10;
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::sleeping(Duration::from_millis(200)));
    let reporter = Arc::new(MemoryReporter::new());
    let first = stores.dispatcher(module.clone(), reporter.clone());
    let second = stores.dispatcher(module.clone(), reporter.clone());

    let (a, b) = tokio::join!(
        first.handle("task-a", "abc123", settings("Baseline")),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            second.handle("task-b", "abc123", settings("Baseline")).await
        }
    );

    assert!(a.is_completed());
    assert!(b.is_completed());
    assert_ne!(a.output_id(), b.output_id());
    assert_eq!(module.calls.load(Ordering::SeqCst), 2);
    assert_eq!(module.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(stores.count(&stores.config.outputs_dir), 2);
}

#[tokio::test]
async fn test_computation_failure_cleans_up() {
    let stores = Stores::new();
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::failing());
    let reporter = Arc::new(MemoryReporter::new());
    let dispatcher = stores.dispatcher(module.clone(), reporter.clone());

    let outcome = dispatcher.handle("task-f", "abc123", settings("Baseline")).await;
    match outcome {
        TaskOutcome::Failed { kind, message } => {
            assert_eq!(kind, ErrorKind::ComputationFailure);
            assert!(message.contains("acme"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(stores.count(&stores.config.outputs_dir), 0);
    assert_eq!(stores.count(&stores.config.working_dir), 0);
    assert!(!dispatcher.gate().is_held().unwrap());
    assert_eq!(
        reporter.states_for("task-f"),
        vec![TaskState::Running, TaskState::Failed]
    );
}

#[tokio::test]
async fn test_malformed_input_fails_before_workspace() {
    let stores = Stores::new();
    fs::write(stores.config.inputs_dir.join("junk.tar"), "this is not a tar archive").unwrap();
    let module = Arc::new(RecordingModule::default());
    let dispatcher = stores.dispatcher(module.clone(), Arc::new(MemoryReporter::new()));

    let outcome = dispatcher.handle("task-m", "junk", settings("Baseline")).await;
    assert_eq!(outcome.state(), TaskState::Failed);
    match outcome {
        TaskOutcome::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Malformed),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(module.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stores.count(&stores.config.working_dir), 0);
}

#[tokio::test]
async fn test_missing_settings_key_is_configuration_error() {
    let stores = Stores::new();
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::default());
    let dispatcher = stores.dispatcher(module.clone(), Arc::new(MemoryReporter::new()));

    let settings = json!({"analysis_settings": {
        "source_tag": "portfolio",
        "analysis_tag": "q3",
        "model_version_id": "v1"
    }});
    match dispatcher.handle("task-c", "abc123", settings).await {
        TaskOutcome::Failed { kind, message } => {
            assert_eq!(kind, ErrorKind::Configuration);
            assert!(message.contains("module_supplier_id"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(module.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stores.count(&stores.config.working_dir), 0);
}

#[tokio::test]
async fn test_missing_event_variant_names_path() {
    let stores = Stores::new();
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::default());
    let dispatcher = stores.dispatcher(module.clone(), Arc::new(MemoryReporter::new()));

    match dispatcher.handle("task-e", "abc123", settings("Stochastic Set")).await {
        TaskOutcome::Failed { kind, message } => {
            assert_eq!(kind, ErrorKind::NotFound);
            assert!(message.contains("events_stochastic_set.bin"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(module.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stores.count(&stores.config.working_dir), 0);
}

#[tokio::test]
async fn test_retained_workspace_kept_after_success() {
    let mut stores = Stores::new();
    stores.config.retain_workspaces = true;
    stores.write_input("abc123", &[("items.bin", "items")]);
    let module = Arc::new(RecordingModule::default());
    let dispatcher = stores.dispatcher(module, Arc::new(MemoryReporter::new()));

    let outcome = dispatcher.handle("task-r", "abc123", settings("Baseline")).await;
    assert!(outcome.is_completed());
    assert_eq!(stores.count(&stores.config.working_dir), 1);
}

#[tokio::test]
async fn test_path_like_tags_never_leave_working_dir() {
    let stores = Stores::new();
    stores.write_input("abc123", &[("items.bin", "items")]);
    let elsewhere = TempDir::new().unwrap();
    let module = Arc::new(RecordingModule::default());
    let dispatcher = stores.dispatcher(module.clone(), Arc::new(MemoryReporter::new()));

    let escape = elsewhere.path().join("x").to_string_lossy().to_string();
    for (key, value) in [("source_tag", escape.as_str()), ("analysis_tag", "../x")] {
        let mut doc = settings("Baseline");
        doc["analysis_settings"][key] = json!(value);
        match dispatcher.handle("task-p", "abc123", doc).await {
            TaskOutcome::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Configuration),
            other => panic!("expected failure for {key}={value}, got {other:?}"),
        }
    }
    assert_eq!(module.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stores.count(elsewhere.path()), 0);
    assert_eq!(stores.count(stores.dir.path()), 5);
    assert_eq!(stores.count(&stores.config.working_dir), 0);
}
