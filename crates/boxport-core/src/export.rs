//! Export orchestrator for VM to box conversion.
//!
//! This module sequences the full pipeline:
//! 1. Optionally clean up the guest disk so it compacts well
//! 2. Halt the machine and extract its provider artifacts into staging
//! 3. Add metadata, template files and configuration fragments
//! 4. Package staging into a gzip-compressed tar archive
//! 5. Publish the archive under the machine's sanitized name
//!
//! Staging state lives in a [`Workspace`] that is torn down on every exit
//! path.
//!
//! # Example
//!
//! ```no_run
//! use boxport_core::{ExportOptions, ExportPipeline, Machine, ProcessRunner, Ui};
//!
//! fn export(machine: &mut dyn Machine, ui: &dyn Ui) -> boxport_core::Result<()> {
//!     let runner = ProcessRunner::new();
//!     let pipeline = ExportPipeline::new(ExportOptions::fast(), &runner, ui);
//!     let outcome = pipeline.run(machine)?;
//!     println!("{} -> {}", outcome.status.code(), outcome.box_path.display());
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::assemble;
use crate::compress;
use crate::error::{Error, Result};
use crate::extract;
use crate::finalize;
use crate::machine::{Machine, MachineState, ProviderKind};
use crate::package;
use crate::progress::Ui;
use crate::runner::ToolRunner;
use crate::workspace::Workspace;

/// Names of the host executables the pipeline invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// VirtualBox management CLI, used for OVF export.
    pub vboxmanage: String,
    /// VMware disk utility, used for defragment and shrink passes.
    pub vdiskmanager: String,
    /// POSIX shell that runs the packaging monitor script.
    pub shell: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            vboxmanage: "VBoxManage".to_string(),
            vdiskmanager: "vmware-vdiskmanager".to_string(),
            shell: "sh".to_string(),
        }
    }
}

/// Options for the export process.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Skip the in-guest cleanup step.
    pub fast: bool,
    /// Do not merge the box template's files into the export.
    pub bare: bool,
    /// Directory the staging directory is created in.
    pub scratch_dir: PathBuf,
    /// Directory the finished box is published to.
    pub output_dir: PathBuf,
    /// External tool names.
    pub tools: ToolPaths,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            fast: false,
            bare: false,
            scratch_dir: std::env::temp_dir(),
            output_dir: PathBuf::from("."),
            tools: ToolPaths::default(),
        }
    }
}

impl ExportOptions {
    /// Create export options with the given flags and default locations.
    pub fn new(fast: bool, bare: bool) -> Self {
        Self {
            fast,
            bare,
            ..Self::default()
        }
    }

    /// Options that skip the guest cleanup step.
    pub fn fast() -> Self {
        Self::new(true, false)
    }

    /// Set the scratch directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

/// Phase of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    /// Cleaning up the guest disk.
    Compressing,
    /// Halting the machine and extracting artifacts.
    Extracting,
    /// Assembling and archiving the staging directory.
    Packaging,
    /// Moving the archive to its final name.
    Finalizing,
    /// Export complete.
    Complete,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportPhase::Compressing => write!(f, "Compressing"),
            ExportPhase::Extracting => write!(f, "Extracting"),
            ExportPhase::Packaging => write!(f, "Packaging"),
            ExportPhase::Finalizing => write!(f, "Finalizing"),
            ExportPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Whether an export run produced a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    /// The box was published.
    Success,
    /// The run stopped early after reporting why.
    Failure,
}

impl ExportStatus {
    /// Process exit code for this status.
    pub fn code(&self) -> i32 {
        match self {
            ExportStatus::Success => 0,
            ExportStatus::Failure => 1,
        }
    }
}

/// Result of an export run that did not hit a fatal error.
///
/// `box_path` is always the computed target name, even when `status` is
/// [`ExportStatus::Failure`] and nothing was written there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub status: ExportStatus,
    pub box_path: PathBuf,
}

/// Runs the export stages against one machine.
pub struct ExportPipeline<'a> {
    options: ExportOptions,
    runner: &'a dyn ToolRunner,
    ui: &'a dyn Ui,
}

impl<'a> ExportPipeline<'a> {
    /// Create a pipeline using `runner` for host tools and `ui` for output.
    pub fn new(options: ExportOptions, runner: &'a dyn ToolRunner, ui: &'a dyn Ui) -> Self {
        Self {
            options,
            runner,
            ui,
        }
    }

    /// The options this pipeline runs with.
    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Export `machine` to a box.
    ///
    /// Fails with [`Error::NotCreated`] before touching the disk if the
    /// machine does not exist. Every other path, successful or not, removes
    /// the staging directory and any unpublished archive before returning.
    pub fn run(&self, machine: &mut dyn Machine) -> Result<ExportOutcome> {
        if machine.state()? == MachineState::NotCreated {
            return Err(Error::NotCreated);
        }

        let kind = ProviderKind::from_provider(machine.provider());
        let box_path = finalize::target_path(machine.name(), &self.options.output_dir);
        info!(
            provider = machine.provider(),
            ?kind,
            fast = self.options.fast,
            bare = self.options.bare,
            target = %box_path.display(),
            "starting export"
        );

        let mut workspace = Workspace::new(&self.options.scratch_dir);
        let result = self.run_stages(machine, kind, &mut workspace, &box_path);
        workspace.teardown();

        let status = result?;
        Ok(ExportOutcome { status, box_path })
    }

    fn run_stages(
        &self,
        machine: &mut dyn Machine,
        kind: ProviderKind,
        workspace: &mut Workspace,
        box_path: &Path,
    ) -> Result<ExportStatus> {
        let tools = &self.options.tools;

        if !self.options.fast {
            info!(phase = %ExportPhase::Compressing, "entering phase");
            if !compress::supported(machine, self.ui)? {
                self.ui.error(
                    "Disk cleanup is not supported for this guest. Rerun with --fast to skip it.",
                );
                return Ok(ExportStatus::Failure);
            }
            compress::compress(machine, self.ui)?;
        }

        info!(phase = %ExportPhase::Extracting, "entering phase");
        extract::extract(machine, workspace, kind, tools, self.runner, self.ui)?;
        if workspace.manifest()?.is_empty() {
            warn!("extraction produced no files");
            self.ui.error("The provider exported no files for this machine.");
            return Ok(ExportStatus::Failure);
        }

        info!(phase = %ExportPhase::Packaging, "entering phase");
        let staging = workspace.require_staging_dir()?.to_path_buf();
        assemble::assemble(machine, &staging, kind, self.options.bare)?;
        package::package(workspace, tools, self.runner, self.ui)?;

        info!(phase = %ExportPhase::Finalizing, "entering phase");
        finalize::finalize(workspace, box_path, self.ui)?;

        info!(phase = %ExportPhase::Complete, "export finished");
        Ok(ExportStatus::Success)
    }
}
