//! Machine handle and guest command channel interfaces.
//!
//! The export pipeline never owns the VM. It reads state through [`Machine`],
//! requests lifecycle transitions through it, and runs guest commands through
//! the [`CommandChannel`] the machine hands out.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Provider identifier VMware exports are published under, whichever VMware
/// product produced them.
pub const VMWARE_PROVIDER: &str = "vmware_desktop";

/// Provider identifier for VirtualBox.
pub const VIRTUALBOX_PROVIDER: &str = "virtualbox";

/// Lifecycle state of a machine as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    /// The provider has no record of the machine.
    NotCreated,
    /// The machine is powered on.
    Running,
    /// The machine is powered off.
    PowerOff,
    /// The machine state was saved to disk.
    Saved,
    /// Any other provider-specific state (e.g. "aborted", "paused").
    Other(String),
}

impl MachineState {
    /// Whether the machine is currently powered on.
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::NotCreated => write!(f, "not created"),
            MachineState::Running => write!(f, "running"),
            MachineState::PowerOff => write!(f, "poweroff"),
            MachineState::Saved => write!(f, "saved"),
            MachineState::Other(state) => write!(f, "{}", state),
        }
    }
}

/// Virtualization backend family, derived once per export run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Oracle VirtualBox.
    VirtualBox,
    /// Any VMware product (Fusion, Workstation, the desktop plugin).
    VmwareFamily,
    /// Anything else; exported through the OVF path.
    Other,
}

impl ProviderKind {
    /// Classify a provider identifier.
    pub fn from_provider(provider: &str) -> Self {
        if provider == VIRTUALBOX_PROVIDER {
            ProviderKind::VirtualBox
        } else if provider.to_ascii_lowercase().starts_with("vmware") {
            ProviderKind::VmwareFamily
        } else {
            ProviderKind::Other
        }
    }

    /// The provider label written into `metadata.json`.
    ///
    /// All VMware variants collapse to [`VMWARE_PROVIDER`].
    pub fn normalize<'a>(&self, provider: &'a str) -> &'a str {
        match self {
            ProviderKind::VmwareFamily => VMWARE_PROVIDER,
            _ => provider,
        }
    }
}

/// Remote access transport configured for the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Communicator {
    /// SSH-class shell access.
    Ssh,
    /// Out-of-band Windows management; no shell commands are issued over it.
    WinRm,
}

/// Connection details for reaching the guest over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInfo {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Private key used to authenticate, if any.
    pub private_key_path: Option<PathBuf>,
}

/// Which output stream a chunk of text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Decision returned by an output sink after seeing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep streaming.
    Continue,
    /// Stop the command; the reason is handed back to the caller.
    Abort(String),
}

/// Callback receiving streamed output chunks as they arrive.
pub type OutputSink<'a> = dyn FnMut(StreamKind, &str) -> Flow + 'a;

/// Executes commands inside the guest.
///
/// Calls block until the remote command exits. Output is delivered to the
/// sink on the calling thread.
pub trait CommandChannel {
    /// Run `command` as the login user and return its exit status.
    fn execute(&self, command: &str, sink: &mut OutputSink<'_>) -> Result<i32>;

    /// Run `command` with elevated privilege and return its exit status.
    fn sudo(&self, command: &str, sink: &mut OutputSink<'_>) -> Result<i32>;

    /// Copy a local file to `remote` inside the guest.
    fn upload(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Handle on the VM being exported.
///
/// Implemented by the host runtime; the pipeline only reads from it and
/// requests `up`/`halt` transitions.
pub trait Machine {
    /// Current lifecycle state.
    fn state(&self) -> Result<MachineState>;

    /// Provider identifier (e.g. "virtualbox", "vmware_fusion").
    fn provider(&self) -> &str;

    /// Stable identity token the provider tools address the VM by.
    fn id(&self) -> &str;

    /// Human-facing display name.
    fn name(&self) -> &str;

    /// Directory holding the files of the box this VM was created from.
    fn box_dir(&self) -> Option<&Path>;

    /// Per-machine data directory (holds the generated `private_key`).
    fn data_dir(&self) -> Option<&Path>;

    /// Configured remote access transport.
    fn communicator(&self) -> Communicator;

    /// Refresh and return the SSH connection descriptor.
    fn ssh_info(&mut self) -> Result<Option<SshInfo>>;

    /// Boot the machine and block until it is up.
    fn up(&mut self) -> Result<()>;

    /// Halt the machine and block until it is off.
    fn halt(&mut self) -> Result<()>;

    /// The MAC address of the first network adapter, as the provider reports it.
    fn read_mac_address(&self) -> Result<Option<String>>;

    /// Command channel into the guest.
    fn channel(&self) -> &dyn CommandChannel;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_classification() {
        assert_eq!(ProviderKind::from_provider("virtualbox"), ProviderKind::VirtualBox);
        assert_eq!(ProviderKind::from_provider("vmware_fusion"), ProviderKind::VmwareFamily);
        assert_eq!(ProviderKind::from_provider("vmware_workstation"), ProviderKind::VmwareFamily);
        assert_eq!(ProviderKind::from_provider("vmware_desktop"), ProviderKind::VmwareFamily);
        assert_eq!(ProviderKind::from_provider("libvirt"), ProviderKind::Other);
    }

    #[test]
    fn test_vmware_variants_normalize_to_one_label() {
        for provider in ["vmware_fusion", "vmware_workstation", "vmware_desktop"] {
            let kind = ProviderKind::from_provider(provider);
            assert_eq!(kind.normalize(provider), VMWARE_PROVIDER);
        }
        assert_eq!(ProviderKind::VirtualBox.normalize("virtualbox"), "virtualbox");
        assert_eq!(ProviderKind::Other.normalize("parallels"), "parallels");
    }

    #[test]
    fn test_machine_state_display() {
        assert_eq!(MachineState::NotCreated.to_string(), "not created");
        assert_eq!(MachineState::Running.to_string(), "running");
        assert_eq!(MachineState::Other("aborted".into()).to_string(), "aborted");
        assert!(MachineState::Running.is_running());
        assert!(!MachineState::Saved.is_running());
    }
}
