//! Packaging the staging directory into a gzip-compressed tar archive.
//!
//! When `sh`, `pv`, `tar` and `gzip` are all on the host, a helper script
//! pipes the files through `pv` so real byte progress can be shown. Otherwise
//! the archive is built in-process.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::export::ToolPaths;
use crate::machine::{Flow, StreamKind};
use crate::progress::{parse_digits, ProgressReporter, Ui};
use crate::runner::{RunOutcome, ToolRunner};
use crate::workspace::{Manifest, Workspace};

const MONITOR_SCRIPT: &str = include_str!("../scripts/tar-cf-monitor.sh");

/// Programs the monitor script pipes through, besides the shell itself.
pub const MONITOR_TOOLS: &[&str] = &["pv", "tar", "gzip"];

/// How the archive will be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingStrategy {
    /// Run the monitor script with this shell.
    Monitored { shell: PathBuf },
    /// Build the archive in-process.
    Portable,
}

/// Pick the monitored strategy if every tool it needs resolves.
pub fn choose_strategy(tools: &ToolPaths, runner: &dyn ToolRunner) -> PackagingStrategy {
    let Some(shell) = runner.resolve(&tools.shell) else {
        return PackagingStrategy::Portable;
    };
    if MONITOR_TOOLS.iter().all(|t| runner.resolve(t).is_some()) {
        PackagingStrategy::Monitored { shell }
    } else {
        PackagingStrategy::Portable
    }
}

/// Archive the staging directory to `<staging>.box` and return its path.
///
/// Fails with [`Error::TarFailed`] if no archive exists afterwards.
pub fn package(
    workspace: &mut Workspace,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<PathBuf> {
    let archive = workspace.assign_archive_path()?;
    let staging = workspace.require_staging_dir()?.to_path_buf();
    let manifest = workspace.manifest()?;
    info!(
        files = manifest.entries.len(),
        total_size = manifest.total_size,
        archive = %archive.display(),
        "packaging box"
    );
    ui.info("Packaging the box...");

    match choose_strategy(tools, runner) {
        PackagingStrategy::Monitored { shell } => {
            package_monitored(&shell, &staging, &manifest, &archive, runner, ui)?
        }
        PackagingStrategy::Portable => package_portable(&staging, &manifest, &archive, ui)?,
    }

    if !archive.is_file() {
        return Err(Error::tar_failed(&archive));
    }
    Ok(archive)
}

/// Archive through the `tar | pv | gzip` helper script.
fn package_monitored(
    shell: &Path,
    staging: &Path,
    manifest: &Manifest,
    archive: &Path,
    runner: &dyn ToolRunner,
    ui: &dyn Ui,
) -> Result<()> {
    let mut script = tempfile::Builder::new()
        .prefix("boxport-tar-cf-monitor")
        .suffix(".sh")
        .tempfile()
        .map_err(Error::io_simple)?;
    script
        .write_all(MONITOR_SCRIPT.as_bytes())
        .and_then(|()| script.flush())
        .map_err(|e| Error::io(e, script.path()))?;

    let mut args = vec![
        script.path().display().to_string(),
        staging.display().to_string(),
        manifest.total_size.to_string(),
        archive.display().to_string(),
    ];
    args.extend(manifest.paths().iter().map(|p| p.display().to_string()));

    let program = shell.display().to_string();
    let mut reporter = ProgressReporter::new(ui, "Packaging");
    let mut sink = |_: StreamKind, text: &str| {
        if let Some(digits) = parse_digits(text) {
            reporter.render(digits);
        }
        Flow::Continue
    };

    let outcome = runner.run(&program, &args, Some(staging), &mut sink)?;
    if !matches!(outcome, RunOutcome::Exited(0)) {
        warn!(?outcome, "packaging script failed, discarding partial archive");
        if archive.is_file() {
            fs::remove_file(archive).map_err(|e| Error::io(e, archive))?;
        }
    }
    Ok(())
}

/// Archive with the `tar` and `flate2` crates, containing exactly the
/// manifest's paths.
fn package_portable(
    staging: &Path,
    manifest: &Manifest,
    archive: &Path,
    ui: &dyn Ui,
) -> Result<()> {
    debug!("packaging in-process");
    let file = File::create(archive).map_err(|e| Error::io(e, archive))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut reporter = ProgressReporter::new(ui, "Packaging");
    let mut written = 0u64;
    for entry in &manifest.entries {
        let source = staging.join(&entry.path);
        builder
            .append_path_with_name(&source, &entry.path)
            .map_err(|e| Error::io(e, &source))?;
        written += entry.size;
        if manifest.total_size > 0 {
            reporter.render(&(written * 100 / manifest.total_size).to_string());
        }
    }

    let encoder = builder.into_inner().map_err(|e| Error::io(e, archive))?;
    let mut writer = encoder.finish().map_err(|e| Error::io(e, archive))?;
    writer.flush().map_err(|e| Error::io(e, archive))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_script_is_embedded() {
        assert!(MONITOR_SCRIPT.contains("pv -n -s"));
        assert!(MONITOR_SCRIPT.contains("shift 3"));
    }
}
