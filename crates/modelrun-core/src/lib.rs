//! modelrun core library
//!
//! Worker-side handling of analysis-run tasks: gate on the shared resource,
//! build an isolated workspace from an input bundle and model data, run a
//! computation module, publish the output bundle and clean up.

pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod module;
pub mod obs;
pub mod resolver;
pub mod settings;
pub mod telemetry;
pub mod workspace;

pub use archive::{ArchiveCodec, ArchiveSummary, ARCHIVE_SUFFIX};
pub use config::{WorkerConfig, AUTO_BATCH_COUNT};
pub use dispatcher::{
    LogReporter, MemoryReporter, RunDispatcher, StatusReporter, StatusUpdate, TaskOutcome,
    TaskState,
};
pub use error::{ErrorKind, Result, WorkerError};
pub use module::{CommandModule, ComputationModule, ModuleContext, ModuleRegistry, ModuleSource};
pub use resolver::{DataResolver, OptionalInput, Resolution, ResolvedInput};
pub use settings::{AnalysisSettings, ModelSettings, SettingsDocument};
pub use workspace::{ArchivedOutput, PreparedRun, RunWorkspace, StaticMount, WorkspaceManager};

pub use modelrun_gate::{Acquisition, ResourceGate, ResourceLock};

/// Crate version, reported by the worker binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
