//! Publishing the packaged box under its final name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::progress::Ui;
use crate::workspace::Workspace;

static UNSAFE_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Safety: this is a compile-time constant pattern, so it cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"[^a-z0-9-]+").expect("valid regex")
});

/// Box file name for a machine display name.
///
/// Lowercases the name and collapses every run of characters outside
/// `[a-z0-9-]` into one `_`.
pub fn box_file_name(display_name: &str) -> String {
    let lowered = display_name.to_lowercase();
    format!("{}.box", UNSAFE_CHARS_RE.replace_all(&lowered, "_"))
}

/// Where the box for `display_name` is published inside `output_dir`.
pub fn target_path(display_name: &str, output_dir: &Path) -> PathBuf {
    output_dir.join(box_file_name(display_name))
}

/// Move the temporary archive to `target`.
///
/// Returns the published path, or `None` if there was no archive to move.
pub fn finalize(workspace: &Workspace, target: &Path, ui: &dyn Ui) -> Result<Option<PathBuf>> {
    let Some(archive) = workspace.archive_path().filter(|a| a.is_file()) else {
        debug!("no temporary archive, nothing to publish");
        return Ok(None);
    };

    move_file(archive, target)?;
    info!(path = %target.display(), "published box");
    ui.info(&format!("Box created: {}", target.display()));
    Ok(Some(target.to_path_buf()))
}

/// Rename `from` to `to`, copying across filesystems when a rename is not
/// possible.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Err(rename_err) = fs::rename(from, to) {
        debug!(error = %rename_err, "rename failed, copying instead");
        fs::copy(from, to).map_err(|e| Error::io(e, to))?;
        fs::remove_file(from).map_err(|e| Error::io(e, from))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_file_name() {
        assert_eq!(box_file_name("My VM/2"), "my_vm_2.box");
        assert_eq!(box_file_name("ubuntu-22.04"), "ubuntu-22_04.box");
        assert_eq!(box_file_name("Dev  Box!!"), "dev_box_.box");
        assert_eq!(box_file_name("plain"), "plain.box");
    }

    #[test]
    fn test_target_path_joins_output_dir() {
        assert_eq!(
            target_path("My VM/2", Path::new("/work")),
            PathBuf::from("/work/my_vm_2.box")
        );
    }
}
