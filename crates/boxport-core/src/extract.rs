//! Provider artifact extraction into the staging directory.
//!
//! VMware machines are harvested straight from their bundle directory and
//! their disks compacted in place; everything else goes through the
//! provider's OVF export.

use std::path::Path;

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::export::ToolPaths;
use crate::machine::{Flow, Machine, ProviderKind, StreamKind};
use crate::progress::{parse_percent, ProgressReporter, Ui};
use crate::runner::{RunOutcome, ToolRunner};
use crate::workspace::{copy_relative, list_files, Workspace};

/// Extensions of the VMware bundle files that make up an exported machine.
pub const VMWARE_DATA_EXTENSIONS: &[&str] = &["vmdk", "nvram", "vmtm", "vmx", "vmxf"];

/// Name of the OVF descriptor written by the OVF export.
pub const OVF_FILE_NAME: &str = "box.ovf";

/// Halt the machine and write its provider artifacts into a new staging
/// directory.
pub fn extract(
    machine: &mut dyn Machine,
    workspace: &mut Workspace,
    kind: ProviderKind,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<()> {
    if machine.state()?.is_running() {
        ui.info("Halting the machine...");
        machine.halt()?;
    }

    let staging = workspace.create_staging_dir()?;
    let result = match kind {
        ProviderKind::VmwareFamily => {
            harvest_vmware(machine.id(), &staging, tools, runner, ui)
        }
        ProviderKind::VirtualBox | ProviderKind::Other => {
            export_ovf(machine.id(), &staging, tools, runner, ui)
        }
    };
    ui.clear_line();
    result
}

/// Whether `path` carries one of the given extensions, ignoring case.
pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Copy the VMware data files next to the `.vmx` into staging, then
/// defragment and shrink every disk.
fn harvest_vmware(
    vmx: &str,
    staging: &Path,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<()> {
    let vm_dir = Path::new(vmx)
        .parent()
        .ok_or_else(|| Error::vmx_parse(format!("'{}' has no parent directory", vmx)))?;

    ui.info("Copying machine files...");
    let files: Vec<_> = list_files(vm_dir)?
        .into_iter()
        .filter(|f| has_extension(f, VMWARE_DATA_EXTENSIONS))
        .collect();
    for file in &files {
        debug!(file = %file.display(), "harvesting");
        copy_relative(vm_dir, staging, file)?;
    }

    let disks: Vec<_> = list_files(staging)?
        .into_iter()
        .filter(|f| has_extension(f, &["vmdk"]))
        .collect();
    for disk in disks {
        let disk_path = staging.join(&disk);
        let name = disk.display().to_string();
        compact_disk(&disk_path, "-d", &format!("Defragmenting {}", name), tools, runner, ui)?;
        compact_disk(&disk_path, "-k", &format!("Shrinking {}", name), tools, runner, ui)?;
    }
    Ok(())
}

/// Run one `vmware-vdiskmanager` pass over a disk.
fn compact_disk(
    disk: &Path,
    flag: &str,
    label: &str,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<()> {
    let mut reporter = ProgressReporter::new(ui, label);
    let mut sink = |_: StreamKind, text: &str| {
        if let Some(percent) = parse_percent(text) {
            reporter.render(percent);
        }
        Flow::Continue
    };
    let args = vec![flag.to_string(), disk.display().to_string()];
    runner
        .run(&tools.vdiskmanager, &args, None, &mut sink)?
        .require_success(&tools.vdiskmanager)
}

/// Export the machine as OVF into staging.
///
/// Any error-stream chunk without a percentage aborts the export. The tool
/// writes its progress ticks to stderr too, so those are shown, not fatal.
fn export_ovf(
    id: &str,
    staging: &Path,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<()> {
    let ovf = staging.join(OVF_FILE_NAME);
    info!(id, ovf = %ovf.display(), "exporting machine");
    ui.info("Exporting the machine...");

    let mut reporter = ProgressReporter::new(ui, "Exporting");
    let mut sink = |stream: StreamKind, text: &str| {
        if let Some(percent) = parse_percent(text) {
            reporter.render(percent);
            return Flow::Continue;
        }
        let message = text.trim();
        if stream == StreamKind::Stderr && !message.is_empty() {
            error!(output = message, "export tool reported an error");
            return Flow::Abort(message.to_string());
        }
        if !message.is_empty() {
            debug!(output = message, "export tool output");
        }
        Flow::Continue
    };

    let args = vec![
        "export".to_string(),
        id.to_string(),
        "--output".to_string(),
        ovf.display().to_string(),
    ];
    match runner.run(&tools.vboxmanage, &args, None, &mut sink)? {
        RunOutcome::Aborted(message) => Err(Error::export_tool(message)),
        outcome => outcome.require_success(&tools.vboxmanage),
    }
}
