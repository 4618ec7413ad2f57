//! boxport CLI - Export VirtualBox and VMware VMs to box archives.

mod console;
mod host;
mod ssh;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use boxport_core::finalize::target_path;
use boxport_core::{
    Communicator, ExportOptions, ExportPipeline, ExportStatus, Machine, ProcessRunner,
    ProviderKind, ToolPaths, Ui,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::console::ConsoleUi;
use crate::host::{HostSettings, VirtualBoxMachine, VmwareMachine};

/// Package a VirtualBox or VMware VM as a reusable box.
#[derive(Parser)]
#[command(name = "boxport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log debug output to stderr.
    #[arg(short, long, global = true, env = "BOXPORT_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a VM to a box archive.
    Export {
        #[command(flatten)]
        machine: MachineArgs,

        /// Skip the in-guest disk cleanup.
        #[arg(long, env = "BOXPORT_FAST")]
        fast: bool,

        /// Do not merge the box template's files into the box.
        #[arg(long, env = "BOXPORT_BARE")]
        bare: bool,

        /// Scratch directory for staging. Defaults to the OS temp dir.
        #[arg(long, env = "BOXPORT_TMP_DIR")]
        tmp_dir: Option<PathBuf>,

        /// Directory the box is written to. Defaults to the current directory.
        #[arg(short, long, env = "BOXPORT_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Show what an export of a VM would use, without touching it.
    Info {
        #[command(flatten)]
        machine: MachineArgs,
    },
}

/// Options that identify the VM and how to reach it.
#[derive(Args)]
struct MachineArgs {
    /// Provider name (virtualbox, vmware_desktop, vmware_workstation, ...).
    #[arg(short, long, env = "BOXPORT_PROVIDER", default_value = "virtualbox")]
    provider: String,

    /// VM UUID or name for VirtualBox, path to the .vmx file for VMware.
    #[arg(long, env = "BOXPORT_ID")]
    id: String,

    /// Display name used for the box file. Looked up from the provider when omitted.
    #[arg(short, long, env = "BOXPORT_NAME")]
    name: Option<String>,

    /// Box template directory whose files are merged into the box.
    #[arg(long, env = "BOXPORT_BOX_DIR")]
    box_dir: Option<PathBuf>,

    /// Machine data directory holding the generated `private_key`.
    #[arg(long, env = "BOXPORT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// How the guest is reached.
    #[arg(long, value_enum, env = "BOXPORT_COMMUNICATOR", default_value = "ssh")]
    communicator: CommunicatorArg,

    /// Guest SSH host.
    #[arg(long, env = "BOXPORT_SSH_HOST")]
    ssh_host: Option<String>,

    /// Guest SSH port.
    #[arg(long, env = "BOXPORT_SSH_PORT")]
    ssh_port: Option<u16>,

    /// Guest SSH user.
    #[arg(long, env = "BOXPORT_SSH_USER", default_value = "vagrant")]
    ssh_user: String,

    /// Private key for the guest SSH user.
    #[arg(long, env = "BOXPORT_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// VirtualBox management CLI.
    #[arg(long, env = "BOXPORT_VBOXMANAGE", default_value = "VBoxManage")]
    vboxmanage: String,

    /// VMware control CLI.
    #[arg(long, env = "BOXPORT_VMRUN", default_value = "vmrun")]
    vmrun: String,
}

/// Communicator argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CommunicatorArg {
    Ssh,
    Winrm,
}

impl From<CommunicatorArg> for Communicator {
    fn from(arg: CommunicatorArg) -> Self {
        match arg {
            CommunicatorArg::Ssh => Communicator::Ssh,
            CommunicatorArg::Winrm => Communicator::WinRm,
        }
    }
}

impl MachineArgs {
    fn settings(&self) -> HostSettings {
        HostSettings {
            box_dir: self.box_dir.clone(),
            data_dir: self.data_dir.clone(),
            communicator: self.communicator.into(),
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            ssh_user: self.ssh_user.clone(),
            ssh_key: self.ssh_key.clone(),
        }
    }

    fn open(&self) -> Result<Box<dyn Machine>> {
        let machine: Box<dyn Machine> = match ProviderKind::from_provider(&self.provider) {
            ProviderKind::VmwareFamily => Box::new(
                VmwareMachine::open(
                    &self.provider,
                    &self.id,
                    self.name.clone(),
                    &self.vmrun,
                    self.settings(),
                )
                .with_context(|| format!("failed to open VMware machine {}", self.id))?,
            ),
            ProviderKind::VirtualBox | ProviderKind::Other => Box::new(
                VirtualBoxMachine::open(
                    &self.provider,
                    &self.id,
                    self.name.clone(),
                    &self.vboxmanage,
                    self.settings(),
                )
                .with_context(|| format!("failed to open VirtualBox machine {}", self.id))?,
            ),
        };
        Ok(machine)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ui = ConsoleUi::new();
    let result = match cli.command {
        Commands::Export {
            machine,
            fast,
            bare,
            tmp_dir,
            output_dir,
        } => run_export(&machine, fast, bare, tmp_dir, output_dir, &ui),
        Commands::Info { machine } => show_info(&machine).map(|()| ExportStatus::Success),
    };

    match result {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(e) => {
            ui.clear_line();
            ui.error(&format!("Error: {:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run_export(
    args: &MachineArgs,
    fast: bool,
    bare: bool,
    tmp_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    ui: &ConsoleUi,
) -> Result<ExportStatus> {
    let mut machine = args.open()?;

    let output_dir = match output_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    let mut options = ExportOptions::new(fast, bare).with_output_dir(output_dir);
    if let Some(dir) = tmp_dir {
        options = options.with_scratch_dir(dir);
    }
    options.tools = ToolPaths {
        vboxmanage: args.vboxmanage.clone(),
        ..ToolPaths::default()
    };

    let runner = ProcessRunner::new();
    let pipeline = ExportPipeline::new(options, &runner, ui);
    let outcome = pipeline
        .run(machine.as_mut())
        .with_context(|| format!("failed to export {}", machine.name()))?;

    if outcome.status == ExportStatus::Success {
        if let Ok(metadata) = std::fs::metadata(&outcome.box_path) {
            ui.info(&format!("Box size: {}", format_bytes(metadata.len())));
        }
    }
    Ok(outcome.status)
}

fn show_info(args: &MachineArgs) -> Result<()> {
    let machine = args.open()?;
    let state = machine
        .state()
        .with_context(|| format!("failed to read the state of {}", args.id))?;
    let output_dir = std::env::current_dir().context("failed to read the current directory")?;

    println!("Machine Information");
    println!("===================");
    println!();
    println!("Name:      {}", machine.name());
    println!("Id:        {}", machine.id());
    println!("Provider:  {}", machine.provider());
    println!("State:     {}", state);
    println!();
    println!(
        "Box:       {}",
        target_path(machine.name(), &output_dir).display()
    );

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_parse_export_flags() {
        let cli = Cli::try_parse_from([
            "boxport",
            "export",
            "--provider",
            "vmware_desktop",
            "--id",
            "/vms/dev.vmx",
            "--fast",
            "--communicator",
            "winrm",
        ])
        .unwrap();
        match cli.command {
            Commands::Export { machine, fast, bare, .. } => {
                assert!(fast);
                assert!(!bare);
                assert_eq!(machine.provider, "vmware_desktop");
                assert_eq!(machine.ssh_user, "vagrant");
                assert_eq!(Communicator::from(machine.communicator), Communicator::WinRm);
            }
            Commands::Info { .. } => panic!("expected export"),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
