//! In-guest disk cleanup before export.
//!
//! On guests whose distribution we know how to clean, a shell script is
//! uploaded and run as root to drop caches and zero free space, which lets
//! the exported disk images compress far better.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::machine::{Communicator, Flow, Machine, StreamKind};
use crate::progress::Ui;

/// Command that prints the guest's distribution identifier.
pub const DISTRO_PROBE: &str = "lsb_release -i -s";

/// Distribution families the cleanup script supports. Matched as
/// case-insensitive substrings of the probe output.
pub const SUPPORTED_DISTROS: &[&str] = &["debian", "ubuntu", "mint"];

const CLEANUP_SCRIPT: &str = include_str!("../scripts/cleanup.sh");

/// Whether `probe_output` names a supported distribution family.
pub fn matches_supported_distro(probe_output: &str) -> bool {
    let lowered = probe_output.to_lowercase();
    SUPPORTED_DISTROS.iter().any(|d| lowered.contains(d))
}

/// Check whether the guest can be cleaned up before export.
///
/// Boots the machine if it is not running and refreshes its SSH
/// descriptor. Guests managed over WinRM, guests that cannot be reached
/// and unknown distributions are all unsupported.
pub fn supported(machine: &mut dyn Machine, ui: &dyn Ui) -> Result<bool> {
    if !machine.state()?.is_running() {
        ui.info("Booting the machine to clean up its disk...");
        machine.up()?;
    }

    let ssh = machine.ssh_info()?;
    if machine.communicator() == Communicator::WinRm {
        debug!("guest uses WinRM, skipping distribution probe");
        return Ok(false);
    }
    if ssh.is_none() {
        warn!("no SSH connection details for the guest");
        return Ok(false);
    }

    let mut output = String::new();
    let mut sink = |stream: StreamKind, text: &str| {
        if stream == StreamKind::Stdout {
            output.push_str(text);
        }
        Flow::Continue
    };

    if let Err(e) = machine.channel().execute(DISTRO_PROBE, &mut sink) {
        warn!(error = %e, "guest unreachable for distribution probe");
        return Ok(false);
    }
    let found = matches_supported_distro(&output);
    debug!(distro = output.trim(), found, "distribution probe finished");
    Ok(found)
}

/// Upload the cleanup script to the guest and run it as root.
///
/// Failures of the script itself, including a session that drops while it
/// runs, are shown to the user but do not abort the export. Returns the
/// script's exit status, or `None` when the channel failed.
pub fn compress(machine: &dyn Machine, ui: &dyn Ui) -> Result<Option<i32>> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let remote = format!("/tmp/boxport-cleanup-{}.sh", stamp);

    let mut local = tempfile::NamedTempFile::new().map_err(Error::io_simple)?;
    local
        .write_all(CLEANUP_SCRIPT.as_bytes())
        .and_then(|()| local.flush())
        .map_err(|e| Error::io(e, local.path()))?;

    ui.info("Cleaning up the guest disk, this may take a while...");
    let channel = machine.channel();
    channel.upload(local.path(), &remote)?;

    let mut sink = |stream: StreamKind, text: &str| {
        let line = text.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        match stream {
            StreamKind::Stdout => ui.progress(line),
            StreamKind::Stderr => debug!(output = line, "cleanup stderr"),
        }
        Flow::Continue
    };

    match channel.sudo(&format!("chmod +x {}", remote), &mut sink) {
        Ok(0) => {}
        Ok(status) => ui.error(&format!(
            "Could not mark the cleanup script executable (status {})",
            status
        )),
        Err(e) => {
            warn!(error = %e, "chmod of cleanup script failed");
            ui.error(&format!("Could not mark the cleanup script executable: {}", e));
        }
    }

    let result = channel.sudo(&remote, &mut sink);
    ui.clear_line();
    match result {
        Ok(0) => {
            info!("guest cleanup finished");
            Ok(Some(0))
        }
        Ok(status) => {
            ui.error(&format!("Guest cleanup exited with status {}", status));
            Ok(Some(status))
        }
        Err(e) => {
            warn!(error = %e, "guest cleanup did not complete");
            ui.error(&format!("Guest cleanup did not complete: {}", e));
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_supported_distro() {
        assert!(matches_supported_distro("Ubuntu\n"));
        assert!(matches_supported_distro("Debian"));
        assert!(matches_supported_distro("LinuxMint"));
        assert!(!matches_supported_distro("CentOS"));
        assert!(!matches_supported_distro(""));
    }

    #[test]
    fn test_cleanup_script_is_embedded() {
        assert!(CLEANUP_SCRIPT.starts_with("#!/bin/sh"));
        assert!(CLEANUP_SCRIPT.contains("/dev/zero"));
    }
}
