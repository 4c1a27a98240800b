//! Computation modules and their registry.
//!
//! A computation module performs the actual simulation against a prepared
//! workspace. Modules are looked up by supplier id: a supplier-specific
//! module if one was registered at startup, the built-in default otherwise.

use crate::workspace::RunWorkspace;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// Everything a module gets to see of the run.
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext<'a> {
    /// The analysis settings object, as received.
    pub settings: &'a Map<String, Value>,
    /// Batch count tuning parameter (`-1` lets the module decide).
    pub batch_count: i32,
    /// Prepared workspace; results go to `workspace.output_dir()`.
    pub workspace: &'a RunWorkspace,
}

/// A pluggable simulation engine.
#[async_trait]
pub trait ComputationModule: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the computation. Returning an error fails the task.
    async fn run(&self, ctx: &ModuleContext<'_>) -> anyhow::Result<()>;
}

/// Where a resolved module came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    Supplier,
    Default,
}

/// A module picked for one run.
#[derive(Clone)]
pub struct ResolvedModule {
    pub module: Arc<dyn ComputationModule>,
    pub source: ModuleSource,
}

impl std::fmt::Debug for ResolvedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModule")
            .field("module", &self.module.name())
            .field("source", &self.source)
            .finish()
    }
}

/// Static set of modules known to this worker.
#[derive(Clone)]
pub struct ModuleRegistry {
    default: Arc<dyn ComputationModule>,
    suppliers: HashMap<String, Arc<dyn ComputationModule>>,
}

impl ModuleRegistry {
    /// Registry with only the built-in default.
    pub fn with_default(default: Arc<dyn ComputationModule>) -> Self {
        Self {
            default,
            suppliers: HashMap::new(),
        }
    }

    /// Register a supplier-specific module, returning any module it replaced.
    pub fn register(
        &mut self,
        supplier_id: impl Into<String>,
        module: Arc<dyn ComputationModule>,
    ) -> Option<Arc<dyn ComputationModule>> {
        self.suppliers.insert(supplier_id.into(), module)
    }

    /// Pick the module for `supplier_id`, falling back to the default.
    pub fn resolve(&self, supplier_id: &str) -> ResolvedModule {
        match self.suppliers.get(supplier_id) {
            Some(module) => ResolvedModule {
                module: Arc::clone(module),
                source: ModuleSource::Supplier,
            },
            None => ResolvedModule {
                module: Arc::clone(&self.default),
                source: ModuleSource::Default,
            },
        }
    }

    /// Registered supplier ids, sorted.
    pub fn suppliers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.suppliers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Environment variable carrying the batch count to command modules.
pub const ENV_BATCH_COUNT: &str = "MODELRUN_BATCH_COUNT";
/// Environment variable carrying the persisted settings file path.
pub const ENV_SETTINGS_FILE: &str = "MODELRUN_SETTINGS_FILE";
/// Environment variable carrying the workspace root.
pub const ENV_WORKSPACE: &str = "MODELRUN_WORKSPACE";

const STDERR_TAIL_BYTES: usize = 2048;

/// Module that runs an external command inside the workspace.
///
/// The command runs with the workspace root as working directory and learns
/// about the run from `MODELRUN_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandModule {
    name: String,
    command: Vec<String>,
    timeout_secs: u64,
}

impl CommandModule {
    /// `command[0]` is the executable. A `timeout_secs` of 0 disables the timeout.
    pub fn new(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let name = name.into();
        if command.is_empty() {
            anyhow::bail!("module {} has empty command", name);
        }
        Ok(Self {
            name,
            command,
            timeout_secs,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl ComputationModule for CommandModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
        let start = Instant::now();
        let exe = &self.command[0];
        let args = &self.command[1..];
        let workspace = ctx.workspace;

        info!(module = %self.name, command = ?self.command, "starting computation module");
        let child = Command::new(exe)
            .args(args)
            .current_dir(workspace.root())
            .env(ENV_BATCH_COUNT, ctx.batch_count.to_string())
            .env(ENV_SETTINGS_FILE, workspace.settings_file())
            .env(ENV_WORKSPACE, workspace.root())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", exe, e))?;

        let output = if self.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "module {} timed out after {} seconds",
                    self.name,
                    self.timeout_secs
                )
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            module = %self.name,
            duration_ms,
            stdout_bytes = output.stdout.len(),
            "computation module exited"
        );

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "module {} exited with code {}: {}",
                self.name,
                exit_code,
                stderr_tail(&output.stderr)
            );
        }
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
