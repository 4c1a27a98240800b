//! Per-run workspace lifecycle.
//!
//! # Directory Layout
//!
//! ```text
//! {working_dir}/{source_tag}_{analysis_tag}_{unique}/
//! ├── static/   model data (symlink, or a full copy on hosts without symlinks)
//! ├── input/    extracted input bundle plus resolved defaults
//! ├── output/   written by the computation module, archived afterwards
//! ├── work/     scratch for intermediate files
//! ├── fifo/     scratch for named pipes
//! └── analysis_settings.json
//! ```
//!
//! Every check that can fail without touching the filesystem (input bundle
//! present and well-formed, model data present) runs before the workspace
//! root is created. Once it exists, a failure anywhere in preparation
//! removes it again unless workspaces are retained for debugging.

use crate::archive::{ArchiveCodec, ArchiveSummary, ARCHIVE_SUFFIX};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::resolver::{DataResolver, ResolvedInput};
use crate::settings::{AnalysisSettings, SettingsDocument};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const STATIC_DIR: &str = "static";
pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const WORK_DIR: &str = "work";
pub const FIFO_DIR: &str = "fifo";

/// File the settings document is persisted to, in the workspace root.
pub const SETTINGS_FILE: &str = "analysis_settings.json";

/// Top-level entry name inside every output bundle.
pub const OUTPUT_ARCHIVE_ENTRY: &str = "output";

/// Generate a fresh bundle/workspace suffix.
pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Paths of one run's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    root: PathBuf,
    created_at: DateTime<Utc>,
}

impl RunWorkspace {
    /// Layout view over `root`. Does not touch the filesystem.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created_at: Utc::now(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the workspace.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn static_dir(&self) -> PathBuf {
        self.root.join(STATIC_DIR)
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join(WORK_DIR)
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join(FIFO_DIR)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }
}

/// How the static model data was made visible in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticMount {
    Symlink,
    Copy,
}

impl StaticMount {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaticMount::Symlink => "symlink",
            StaticMount::Copy => "copy",
        }
    }
}

/// A workspace ready for the computation module.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub workspace: RunWorkspace,
    pub input_archive: PathBuf,
    pub model_data: PathBuf,
    pub static_mount: StaticMount,
    pub resolved_inputs: Vec<ResolvedInput>,
}

/// An output bundle published to the outputs store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedOutput {
    pub output_id: String,
    pub archive: ArchiveSummary,
}

/// Creates, populates, archives and removes run workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    inputs_dir: PathBuf,
    outputs_dir: PathBuf,
    model_data_dir: PathBuf,
    working_dir: PathBuf,
    copy_static_data: bool,
    retain_workspaces: bool,
}

impl WorkspaceManager {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            inputs_dir: config.inputs_dir.clone(),
            outputs_dir: config.outputs_dir.clone(),
            model_data_dir: config.model_data_dir.clone(),
            working_dir: config.working_dir.clone(),
            copy_static_data: config.copy_static_data,
            retain_workspaces: config.retain_workspaces,
        }
    }

    pub fn input_archive_path(&self, input_id: &str) -> PathBuf {
        self.inputs_dir.join(format!("{input_id}{ARCHIVE_SUFFIX}"))
    }

    pub fn output_archive_path(&self, output_id: &str) -> PathBuf {
        self.outputs_dir.join(format!("{output_id}{ARCHIVE_SUFFIX}"))
    }

    pub fn model_data_path(&self, settings: &AnalysisSettings) -> PathBuf {
        self.model_data_dir
            .join(&settings.module_supplier_id)
            .join(&settings.model_version_id)
    }

    /// Prepare a fresh workspace for `input_id`.
    pub fn prepare(&self, input_id: &str, doc: &SettingsDocument) -> Result<PreparedRun> {
        let settings = doc.settings();

        let input_archive = self.input_archive_path(input_id);
        if !input_archive.exists() {
            return Err(WorkerError::InputNotFound(input_archive));
        }
        if !ArchiveCodec::validate(&input_archive) {
            return Err(WorkerError::MalformedArchive(input_archive));
        }
        info!(source_tag = %settings.source_tag, analysis_tag = %settings.analysis_tag, "analysis tags");

        let model_data = self.model_data_path(settings);
        if !model_data.is_dir() {
            return Err(WorkerError::ModelDataNotFound(model_data));
        }
        info!(
            supplier = %settings.module_supplier_id,
            version = %settings.model_version_id,
            "model data located"
        );

        let workspace = self.create_tree(settings)?;
        match self.populate(&workspace, &input_archive, &model_data, doc) {
            Ok((static_mount, resolved_inputs)) => {
                info!(workspace = %workspace.root().display(), "analysis working directory ready");
                Ok(PreparedRun {
                    workspace,
                    input_archive,
                    model_data,
                    static_mount,
                    resolved_inputs,
                })
            }
            Err(e) => {
                self.discard(&workspace);
                Err(e)
            }
        }
    }

    /// Archive `output/` into a new bundle in the outputs store.
    pub fn archive_output(&self, workspace: &RunWorkspace) -> Result<ArchivedOutput> {
        let output_id = generate_unique_id();
        let dest = self.output_archive_path(&output_id);
        let archive = ArchiveCodec::create(&workspace.output_dir(), &dest, OUTPUT_ARCHIVE_ENTRY)?;
        info!(output_id = %output_id, archive = %dest.display(), sha256 = %archive.sha256, "output archived");
        Ok(ArchivedOutput { output_id, archive })
    }

    /// Remove a workspace from disk. A `static` symlink is removed, never followed.
    pub fn remove(&self, workspace: &RunWorkspace) -> Result<()> {
        let root = workspace.root();
        if !root.starts_with(&self.working_dir) || root == self.working_dir {
            return Err(WorkerError::InvalidConfig(format!(
                "refusing to remove {} outside working directory {}",
                root.display(),
                self.working_dir.display()
            )));
        }
        // Unlink static first so a symlinked model data store is never walked.
        let static_dir = workspace.static_dir();
        if let Ok(meta) = fs::symlink_metadata(&static_dir) {
            if meta.file_type().is_symlink() {
                remove_symlink(&static_dir)
                    .map_err(|e| WorkerError::io(format!("unlinking {}", static_dir.display()), e))?;
            }
        }
        fs::remove_dir_all(root)
            .map_err(|e| WorkerError::io(format!("removing workspace {}", root.display()), e))?;
        Ok(())
    }

    /// Remove a workspace unless retention is enabled. Failures are logged only.
    pub fn discard(&self, workspace: &RunWorkspace) {
        if self.retain_workspaces {
            info!(workspace = %workspace.root().display(), "retaining workspace");
            return;
        }
        match self.remove(workspace) {
            Ok(()) => crate::obs::emit_workspace_cleaned(workspace.root()),
            Err(e) => {
                warn!(workspace = %workspace.root().display(), err = %e, "failed to remove workspace")
            }
        }
    }

    fn create_tree(&self, settings: &AnalysisSettings) -> Result<RunWorkspace> {
        let name = format!(
            "{}_{}_{}",
            settings.source_tag,
            settings.analysis_tag,
            generate_unique_id()
        );
        let workspace = RunWorkspace::at(self.working_dir.join(&name));
        if workspace.root().parent() != Some(self.working_dir.as_path()) {
            return Err(WorkerError::InvalidSettings(format!(
                "workspace name {name:?} escapes the working directory"
            )));
        }
        // create_dir (not create_dir_all) so a name collision is an error.
        fs::create_dir(workspace.root()).map_err(|e| {
            WorkerError::io(format!("creating workspace {}", workspace.root().display()), e)
        })?;
        for dir in [workspace.work_dir(), workspace.fifo_dir(), workspace.output_dir()] {
            if let Err(e) = fs::create_dir(&dir) {
                self.discard(&workspace);
                return Err(WorkerError::io(format!("creating {}", dir.display()), e));
            }
        }
        debug!(workspace = %workspace.root().display(), "workspace tree created");
        Ok(workspace)
    }

    fn populate(
        &self,
        workspace: &RunWorkspace,
        input_archive: &Path,
        model_data: &Path,
        doc: &SettingsDocument,
    ) -> Result<(StaticMount, Vec<ResolvedInput>)> {
        let input_dir = workspace.input_dir();
        ArchiveCodec::extract(input_archive, &input_dir)?;
        if !input_dir.is_dir() {
            return Err(WorkerError::ExtractionIncomplete(input_dir));
        }
        unwrap_nested_input(&input_dir)?;

        let static_mount = self.mount_static(model_data, &workspace.static_dir())?;

        let resolver = DataResolver::new(&input_dir, workspace.static_dir());
        let resolved = resolver.resolve_all(&doc.settings().model_settings)?;

        let settings_json = serde_json::to_vec(doc.raw())?;
        fs::write(workspace.settings_file(), settings_json).map_err(|e| {
            WorkerError::io(format!("writing {}", workspace.settings_file().display()), e)
        })?;

        Ok((static_mount, resolved))
    }

    fn mount_static(&self, model_data: &Path, static_dir: &Path) -> Result<StaticMount> {
        if self.copy_static_data {
            copy_tree(model_data, static_dir)?;
            debug!(source = %model_data.display(), "static model data copied");
            Ok(StaticMount::Copy)
        } else {
            symlink_dir(model_data, static_dir).map_err(|e| {
                WorkerError::io(
                    format!("linking {} to {}", static_dir.display(), model_data.display()),
                    e,
                )
            })?;
            debug!(source = %model_data.display(), "static model data linked");
            Ok(StaticMount::Symlink)
        }
    }
}

/// Bundles may wrap their files in a top-level `input/` directory; hoist
/// its contents so `input/` always holds the files directly.
fn unwrap_nested_input(input_dir: &Path) -> Result<()> {
    let io_err = |e| WorkerError::io(format!("reading {}", input_dir.display()), e);
    let entries: Vec<_> = fs::read_dir(input_dir)
        .map_err(io_err)?
        .collect::<std::io::Result<_>>()
        .map_err(io_err)?;
    if entries.len() != 1 || entries[0].file_name() != INPUT_DIR {
        return Ok(());
    }
    let nested = entries[0].path();
    if !nested.is_dir() {
        return Ok(());
    }
    for child in fs::read_dir(&nested).map_err(io_err)? {
        let child = child.map_err(io_err)?;
        let target = input_dir.join(child.file_name());
        fs::rename(child.path(), &target)
            .map_err(|e| WorkerError::io(format!("moving {}", child.path().display()), e))?;
    }
    fs::remove_dir(&nested)
        .map_err(|e| WorkerError::io(format!("removing {}", nested.display()), e))?;
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| {
            WorkerError::io(
                format!("walking {}", source.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| WorkerError::io(format!("creating {}", target.display()), e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                WorkerError::io(format!("copying {}", entry.path().display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn remove_symlink(link: &Path) -> std::io::Result<()> {
    fs::remove_file(link)
}

#[cfg(windows)]
fn remove_symlink(link: &Path) -> std::io::Result<()> {
    fs::remove_dir(link)
}

/// Switches the process working directory for the lifetime of the guard.
///
/// On drop the working directory is set to `restore_to` (the worker's global
/// working root), whatever happened in between.
#[derive(Debug)]
pub struct ScopedWorkingDir {
    restore_to: PathBuf,
}

impl ScopedWorkingDir {
    pub fn enter(dir: &Path, restore_to: &Path) -> Result<Self> {
        std::env::set_current_dir(dir)
            .map_err(|e| WorkerError::io(format!("entering {}", dir.display()), e))?;
        debug!(cwd = %dir.display(), "entered workspace");
        Ok(Self {
            restore_to: restore_to.to_path_buf(),
        })
    }
}

impl Drop for ScopedWorkingDir {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.restore_to) {
            warn!(cwd = %self.restore_to.display(), err = %e, "failed to restore working directory");
        }
    }
}
