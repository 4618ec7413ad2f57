//! Machine handles backed by the VirtualBox and VMware command-line tools.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use boxport_core::vmx::{parse_key_values, parse_vmx};
use boxport_core::{
    CommandChannel, Communicator, Error, Flow, Machine, MachineState, ProcessRunner, RunOutcome,
    SshInfo, StreamKind, ToolRunner,
};
use tracing::{debug, info, warn};

use crate::ssh::SshChannel;

/// Delay between state and SSH polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls allowed for a graceful shutdown before forcing power off.
const HALT_POLLS: u32 = 30;

/// Polls allowed for SSH to come up after boot.
const BOOT_POLLS: u32 = 60;

/// Settings shared by every machine handle, straight from the command line.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub box_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub communicator: Communicator,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_user: String,
    pub ssh_key: Option<PathBuf>,
}

impl HostSettings {
    fn ssh_info(&self, default_host: &str, default_port: u16) -> SshInfo {
        SshInfo {
            host: self
                .ssh_host
                .clone()
                .unwrap_or_else(|| default_host.to_string()),
            port: self.ssh_port.unwrap_or(default_port),
            username: self.ssh_user.clone(),
            private_key_path: self.ssh_key.clone(),
        }
    }
}

/// Run `program` and collect its stdout.
fn capture(
    runner: &ProcessRunner,
    program: &str,
    args: &[&str],
) -> boxport_core::Result<(i32, String)> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let mut stdout = String::new();
    let mut sink = |stream: StreamKind, text: &str| {
        if stream == StreamKind::Stdout {
            stdout.push_str(text);
        }
        Flow::Continue
    };
    let code = match runner.run(program, &args, None, &mut sink)? {
        RunOutcome::Exited(code) => code,
        RunOutcome::Aborted(_) => -1,
    };
    Ok((code, stdout))
}

/// Run `program` and fail on a non-zero exit.
fn run_checked(runner: &ProcessRunner, program: &str, args: &[&str]) -> boxport_core::Result<()> {
    let (code, _) = capture(runner, program, args)?;
    if code == 0 {
        Ok(())
    } else {
        Err(Error::tool_failed(program, code))
    }
}

/// Block until the guest answers a no-op command over `channel`.
fn wait_for_ssh(channel: &dyn CommandChannel) -> boxport_core::Result<()> {
    let mut sink = |_: StreamKind, _: &str| Flow::Continue;
    for attempt in 1..=BOOT_POLLS {
        match channel.execute("true", &mut sink) {
            Ok(0) => return Ok(()),
            Ok(status) => debug!(attempt, status, "guest not ready"),
            Err(e) => debug!(attempt, error = %e, "guest not reachable yet"),
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(Error::channel("timed out waiting for the guest to accept SSH"))
}

// =============================================================================
// VirtualBox
// =============================================================================

/// A VirtualBox VM addressed by UUID or name.
pub struct VirtualBoxMachine {
    provider: String,
    id: String,
    name: String,
    vboxmanage: String,
    settings: HostSettings,
    channel: SshChannel,
    runner: ProcessRunner,
}

impl VirtualBoxMachine {
    /// Look the VM up through `vboxmanage`.
    ///
    /// The display name falls back to the VM's registered name, then `id`.
    pub fn open(
        provider: &str,
        id: &str,
        name: Option<String>,
        vboxmanage: &str,
        settings: HostSettings,
    ) -> boxport_core::Result<Self> {
        let mut machine = Self {
            provider: provider.to_string(),
            id: id.to_string(),
            name: id.to_string(),
            vboxmanage: vboxmanage.to_string(),
            settings,
            channel: SshChannel::new(),
            runner: ProcessRunner::new(),
        };
        let registered = machine.showvminfo()?.and_then(|info| info.get("name").cloned());
        if let Some(name) = name.or(registered) {
            machine.name = name;
        }
        Ok(machine)
    }

    fn showvminfo(&self) -> boxport_core::Result<Option<HashMap<String, String>>> {
        let (code, stdout) = capture(
            &self.runner,
            &self.vboxmanage,
            &["showvminfo", &self.id, "--machinereadable"],
        )?;
        if code != 0 {
            debug!(id = %self.id, code, "showvminfo failed, treating machine as not created");
            return Ok(None);
        }
        Ok(Some(parse_key_values(&stdout)))
    }
}

impl Machine for VirtualBoxMachine {
    fn state(&self) -> boxport_core::Result<MachineState> {
        let Some(info) = self.showvminfo()? else {
            return Ok(MachineState::NotCreated);
        };
        Ok(match info.get("VMState").map(String::as_str) {
            Some("running") => MachineState::Running,
            Some("poweroff") => MachineState::PowerOff,
            Some("saved") => MachineState::Saved,
            Some(other) => MachineState::Other(other.to_string()),
            None => MachineState::Other("unknown".to_string()),
        })
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn box_dir(&self) -> Option<&Path> {
        self.settings.box_dir.as_deref()
    }

    fn data_dir(&self) -> Option<&Path> {
        self.settings.data_dir.as_deref()
    }

    fn communicator(&self) -> Communicator {
        self.settings.communicator
    }

    fn ssh_info(&mut self) -> boxport_core::Result<Option<SshInfo>> {
        let info = self.settings.ssh_info("127.0.0.1", 2222);
        self.channel.set_info(Some(info.clone()));
        Ok(Some(info))
    }

    fn up(&mut self) -> boxport_core::Result<()> {
        info!(id = %self.id, "starting machine");
        run_checked(
            &self.runner,
            &self.vboxmanage,
            &["startvm", &self.id, "--type", "headless"],
        )?;
        self.ssh_info()?;
        wait_for_ssh(&self.channel)
    }

    fn halt(&mut self) -> boxport_core::Result<()> {
        info!(id = %self.id, "halting machine");
        run_checked(
            &self.runner,
            &self.vboxmanage,
            &["controlvm", &self.id, "acpipowerbutton"],
        )?;
        for _ in 0..HALT_POLLS {
            if !self.state()?.is_running() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!(id = %self.id, "graceful shutdown timed out, powering off");
        run_checked(&self.runner, &self.vboxmanage, &["controlvm", &self.id, "poweroff"])
    }

    fn read_mac_address(&self) -> boxport_core::Result<Option<String>> {
        Ok(self
            .showvminfo()?
            .and_then(|info| info.get("macaddress1").cloned()))
    }

    fn channel(&self) -> &dyn CommandChannel {
        &self.channel
    }
}

// =============================================================================
// VMware
// =============================================================================

/// A VMware VM addressed by the path of its `.vmx` file.
pub struct VmwareMachine {
    provider: String,
    vmx: String,
    name: String,
    vmrun: String,
    settings: HostSettings,
    channel: SshChannel,
    runner: ProcessRunner,
}

impl VmwareMachine {
    /// Open the VM at `vmx`, reading its display name unless one is given.
    ///
    /// An existing `vmx` is made absolute, since `vmrun` reports running
    /// machines by absolute path.
    pub fn open(
        provider: &str,
        vmx: &str,
        name: Option<String>,
        vmrun: &str,
        settings: HostSettings,
    ) -> boxport_core::Result<Self> {
        let vmx = &canonical_vmx(vmx);
        let name = match name {
            Some(name) => name,
            None if Path::new(vmx).is_file() => parse_vmx(Path::new(vmx))?.display_name,
            None => vmx.to_string(),
        };
        Ok(Self {
            provider: provider.to_string(),
            vmx: vmx.to_string(),
            name,
            vmrun: vmrun.to_string(),
            settings,
            channel: SshChannel::new(),
            runner: ProcessRunner::new(),
        })
    }

    fn guest_ip(&self) -> boxport_core::Result<Option<String>> {
        let (code, stdout) = capture(
            &self.runner,
            &self.vmrun,
            &["getGuestIPAddress", &self.vmx, "-wait"],
        )?;
        let ip = stdout.trim();
        Ok((code == 0 && !ip.is_empty()).then(|| ip.to_string()))
    }
}

impl Machine for VmwareMachine {
    fn state(&self) -> boxport_core::Result<MachineState> {
        if !Path::new(&self.vmx).is_file() {
            return Ok(MachineState::NotCreated);
        }
        let (code, stdout) = capture(&self.runner, &self.vmrun, &["list"])?;
        if code != 0 {
            return Err(Error::tool_failed(&self.vmrun, code));
        }
        let running = lists_vmx(&stdout, &self.vmx);
        Ok(if running {
            MachineState::Running
        } else {
            MachineState::PowerOff
        })
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn id(&self) -> &str {
        &self.vmx
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn box_dir(&self) -> Option<&Path> {
        self.settings.box_dir.as_deref()
    }

    fn data_dir(&self) -> Option<&Path> {
        self.settings.data_dir.as_deref()
    }

    fn communicator(&self) -> Communicator {
        self.settings.communicator
    }

    fn ssh_info(&mut self) -> boxport_core::Result<Option<SshInfo>> {
        let host = match &self.settings.ssh_host {
            Some(host) => Some(host.clone()),
            None => self.guest_ip()?,
        };
        let info = host.map(|host| self.settings.ssh_info(&host, 22));
        self.channel.set_info(info.clone());
        Ok(info)
    }

    fn up(&mut self) -> boxport_core::Result<()> {
        info!(vmx = %self.vmx, "starting machine");
        run_checked(&self.runner, &self.vmrun, &["start", &self.vmx, "nogui"])?;
        self.ssh_info()?;
        wait_for_ssh(&self.channel)
    }

    fn halt(&mut self) -> boxport_core::Result<()> {
        info!(vmx = %self.vmx, "halting machine");
        if let Err(e) = run_checked(&self.runner, &self.vmrun, &["stop", &self.vmx, "soft"]) {
            warn!(error = %e, "soft stop failed, forcing");
            run_checked(&self.runner, &self.vmrun, &["stop", &self.vmx, "hard"])?;
        }
        Ok(())
    }

    // Only VirtualBox boxes pin a base MAC.
    fn read_mac_address(&self) -> boxport_core::Result<Option<String>> {
        Ok(None)
    }

    fn channel(&self) -> &dyn CommandChannel {
        &self.channel
    }
}

/// Resolve `vmx` to an absolute path, leaving it as given if it cannot be.
fn canonical_vmx(vmx: &str) -> String {
    fs::canonicalize(vmx)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| vmx.to_string())
}

/// Whether `vmrun list` output names the machine at `vmx`.
fn lists_vmx(listing: &str, vmx: &str) -> bool {
    let wanted = canonical_vmx(vmx);
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .any(|line| line == vmx || canonical_vmx(line) == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> HostSettings {
        HostSettings {
            box_dir: None,
            data_dir: None,
            communicator: Communicator::Ssh,
            ssh_host: None,
            ssh_port: None,
            ssh_user: "vagrant".to_string(),
            ssh_key: None,
        }
    }

    #[test]
    fn test_ssh_info_defaults_and_overrides() {
        let info = settings().ssh_info("127.0.0.1", 2222);
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.port, 2222);
        assert_eq!(info.username, "vagrant");

        let mut custom = settings();
        custom.ssh_host = Some("192.168.56.10".to_string());
        custom.ssh_port = Some(22);
        let info = custom.ssh_info("127.0.0.1", 2222);
        assert_eq!(info.host, "192.168.56.10");
        assert_eq!(info.port, 22);
    }

    #[test]
    fn test_lists_vmx_matches_equivalent_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("vms")).unwrap();
        let vmx = dir.path().join("vms/dev.vmx");
        fs::write(&vmx, "displayName = \"dev\"\n").unwrap();
        let absolute = fs::canonicalize(&vmx).unwrap().display().to_string();

        let listing = format!("Total running VMs: 1\n{}\n", absolute);
        let roundabout = dir.path().join("vms/../vms/dev.vmx").display().to_string();
        assert!(lists_vmx(&listing, &roundabout));
        assert!(lists_vmx(&listing, &absolute));
        assert!(!lists_vmx("Total running VMs: 0\n", &absolute));

        let other = dir.path().join("vms/other.vmx").display().to_string();
        assert!(!lists_vmx(&listing, &other));
    }

    #[test]
    fn test_vmware_open_makes_vmx_absolute() {
        let dir = TempDir::new().unwrap();
        let vmx = dir.path().join("dev.vmx");
        fs::write(&vmx, "displayName = \"dev\"\n").unwrap();
        let roundabout = dir.path().join(".").join("dev.vmx").display().to_string();

        let machine =
            VmwareMachine::open("vmware_desktop", &roundabout, None, "vmrun", settings()).unwrap();
        assert_eq!(machine.id(), fs::canonicalize(&vmx).unwrap().display().to_string());
        assert_eq!(machine.name(), "dev");
        assert_eq!(machine.read_mac_address().unwrap(), None);
    }

    #[test]
    fn test_vmware_missing_vmx_is_not_created() {
        let machine = VmwareMachine::open(
            "vmware_desktop",
            "/nonexistent/dev.vmx",
            None,
            "vmrun",
            settings(),
        )
        .unwrap();
        assert_eq!(machine.name(), "/nonexistent/dev.vmx");
        assert_eq!(machine.state().unwrap(), MachineState::NotCreated);
    }
}
