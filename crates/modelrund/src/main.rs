//! modelrund - runs one analysis delivery on behalf of a task queue
//!
//! The queue consumer invokes `modelrund run` once per delivery and maps the
//! exit status back onto its own primitives:
//!
//! - `0`: completed, the output id is printed on stdout
//! - `75`: resource busy, redeliver after the printed `retry-after=<secs>`
//! - `1`: failed, do not retry
//!
//! Logs go to stderr so stdout carries only the result line.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use modelrun_core::config::{
    DEFAULT_LOCK_FILE, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_RETRY_COUNTDOWN_SECS,
};
use modelrun_core::workspace::generate_unique_id;
use modelrun_core::{
    CommandModule, LogReporter, ModuleRegistry, RunDispatcher, TaskOutcome,
    WorkerConfig, AUTO_BATCH_COUNT,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

/// `EX_TEMPFAIL` from sysexits.h.
const EXIT_RESCHEDULE: u8 = 75;
const EXIT_FAILED: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "modelrund")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run analysis tasks against a shared model resource", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handle one analysis task
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        modules: ModuleArgs,

        /// Input bundle id (`{inputs_dir}/{id}.tar`)
        #[arg(long)]
        input: String,

        /// Path to the analysis settings JSON document
        #[arg(long)]
        settings: PathBuf,

        /// Task id used in logs and status updates (generated if omitted)
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Validate the configuration and print it as JSON
    CheckConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Input bundle store
    #[arg(long, env = "MODELRUN_INPUTS_DIR")]
    inputs_dir: PathBuf,

    /// Output bundle store
    #[arg(long, env = "MODELRUN_OUTPUTS_DIR")]
    outputs_dir: PathBuf,

    /// Model data root (`{supplier}/{version}/...`)
    #[arg(long, env = "MODELRUN_MODEL_DATA_DIR")]
    model_data_dir: PathBuf,

    /// Root for per-run workspaces
    #[arg(long, env = "MODELRUN_WORKING_DIR")]
    working_dir: PathBuf,

    /// Batch count passed to the computation module (-1 = module decides)
    #[arg(long, env = "MODELRUN_BATCH_COUNT", default_value_t = AUTO_BATCH_COUNT, allow_negative_numbers = true)]
    batch_count: i32,

    /// Copy model data into the workspace instead of symlinking it
    #[arg(long, env = "MODELRUN_COPY_STATIC_DATA")]
    copy_static_data: bool,

    /// Lock file shared by all workers on this resource
    #[arg(long, env = "MODELRUN_LOCK_FILE", default_value = DEFAULT_LOCK_FILE)]
    lock_file: PathBuf,

    /// Seconds to wait for the resource lock before rescheduling
    #[arg(long, env = "MODELRUN_LOCK_TIMEOUT_SECS", default_value_t = DEFAULT_LOCK_TIMEOUT_SECS)]
    lock_timeout_secs: u64,

    /// Countdown handed back to the queue when the lock is busy
    #[arg(long, env = "MODELRUN_RETRY_COUNTDOWN_SECS", default_value_t = DEFAULT_RETRY_COUNTDOWN_SECS)]
    retry_countdown_secs: u64,

    /// Keep workspaces on disk after the run
    #[arg(long, env = "MODELRUN_RETAIN_WORKSPACES")]
    retain_workspaces: bool,

    /// Do not switch the process working directory into the workspace
    #[arg(long, env = "MODELRUN_NO_ENTER_WORKSPACE")]
    no_enter_workspace: bool,
}

impl ConfigArgs {
    fn into_config(self) -> WorkerConfig {
        let mut config = WorkerConfig::new(
            self.inputs_dir,
            self.outputs_dir,
            self.model_data_dir,
            self.working_dir,
        );
        config.batch_count = self.batch_count;
        config.copy_static_data = self.copy_static_data;
        config.lock_file = self.lock_file;
        config.lock_timeout_secs = self.lock_timeout_secs;
        config.retry_countdown_secs = self.retry_countdown_secs;
        config.retain_workspaces = self.retain_workspaces;
        config.enter_workspace_dir = !self.no_enter_workspace;
        config
    }
}

#[derive(Args, Debug, Clone)]
struct ModuleArgs {
    /// Default computation command, split on whitespace
    #[arg(long, env = "MODELRUN_MODULE_COMMAND")]
    module_command: String,

    /// Supplier-specific command as SUPPLIER=COMMAND (repeatable)
    #[arg(long = "supplier-module", value_name = "SUPPLIER=COMMAND")]
    supplier_modules: Vec<String>,

    /// Kill the computation after this many seconds (0 = no limit)
    #[arg(long, env = "MODELRUN_MODULE_TIMEOUT_SECS", default_value_t = 0)]
    module_timeout_secs: u64,
}

impl ModuleArgs {
    fn build_registry(&self) -> Result<ModuleRegistry> {
        let default = CommandModule::new("default", split_command(&self.module_command), self.module_timeout_secs)?;
        let mut registry = ModuleRegistry::with_default(Arc::new(default));
        for spec in &self.supplier_modules {
            let (supplier, command) = parse_supplier_spec(spec)?;
            let module = CommandModule::new(supplier.clone(), command, self.module_timeout_secs)?;
            if registry.register(supplier.clone(), Arc::new(module)).is_some() {
                anyhow::bail!("supplier module {} given more than once", supplier);
            }
        }
        Ok(registry)
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Parse `SUPPLIER=COMMAND`.
fn parse_supplier_spec(spec: &str) -> Result<(String, Vec<String>)> {
    let (supplier, command) = spec
        .split_once('=')
        .with_context(|| format!("supplier module must be SUPPLIER=COMMAND, got {spec:?}"))?;
    let supplier = supplier.trim();
    if supplier.is_empty() {
        anyhow::bail!("supplier module {spec:?} has an empty supplier id");
    }
    let command = split_command(command);
    if command.is_empty() {
        anyhow::bail!("supplier module {supplier} has an empty command");
    }
    Ok((supplier.to_string(), command))
}

fn load_settings(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing settings file {}", path.display()))
}

/// Result line for stdout and the process exit status.
fn render_outcome(outcome: &TaskOutcome) -> (String, u8) {
    match outcome {
        TaskOutcome::Completed { output_id, .. } => (output_id.clone(), 0),
        TaskOutcome::Rescheduled { retry_after } => (
            format!("retry-after={}", retry_after.as_secs()),
            EXIT_RESCHEDULE,
        ),
        TaskOutcome::Failed { kind, message } => (format!("failed kind={kind}: {message}"), EXIT_FAILED),
    }
}

async fn cmd_run(
    config: WorkerConfig,
    modules: &ModuleArgs,
    input: &str,
    settings: &Path,
    task_id: Option<String>,
) -> Result<TaskOutcome> {
    config.log_summary();
    let registry = modules.build_registry()?;
    for supplier in registry.suppliers() {
        info!(supplier = %supplier, "registered supplier module");
    }
    let settings = load_settings(settings)?;
    let dispatcher = RunDispatcher::new(config, registry, Arc::new(LogReporter))?;
    let task_id = task_id.unwrap_or_else(generate_unique_id);
    Ok(dispatcher.handle(&task_id, input, settings).await)
}

fn cmd_check_config(config: &WorkerConfig) -> Result<String> {
    let config = config.clone().into_absolute()?;
    Ok(serde_json::to_string_pretty(&config)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    modelrun_core::telemetry::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run {
            config,
            modules,
            input,
            settings,
            task_id,
        } => cmd_run(config.into_config(), &modules, &input, &settings, task_id)
            .await
            .map(|outcome| render_outcome(&outcome)),
        Commands::CheckConfig { config } => cmd_check_config(&config.into_config()).map(|json| (json, 0)),
    };

    match result {
        Ok((line, code)) => {
            println!("{line}");
            ExitCode::from(code)
        }
        Err(e) => {
            error!(err = %format!("{e:#}"), "modelrund failed");
            println!("failed: {e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}
