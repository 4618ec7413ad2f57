//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use boxport_core::{
    CommandChannel, Communicator, Flow, Machine, MachineState, OutputSink, RunOutcome, SshInfo,
    StreamKind, ToolRunner, Ui,
};
use flate2::read::GzDecoder;

/// Guest channel that answers the distribution probe and records commands.
#[derive(Default)]
pub struct FakeChannel {
    pub probe_output: String,
    /// When non-empty, sent instead of `probe_output`, one chunk per entry.
    pub probe_chunks: Vec<String>,
    pub unreachable: bool,
    pub sudo_status: i32,
    /// When set, every privileged command fails with this channel error.
    pub sudo_error: Option<String>,
    pub commands: RefCell<Vec<String>>,
    pub uploads: RefCell<Vec<(String, String)>>,
}

impl CommandChannel for FakeChannel {
    fn execute(&self, command: &str, sink: &mut OutputSink<'_>) -> boxport_core::Result<i32> {
        if self.unreachable {
            return Err(boxport_core::Error::channel("connection refused"));
        }
        self.commands.borrow_mut().push(format!("execute: {}", command));
        if self.probe_chunks.is_empty() {
            sink(StreamKind::Stdout, &self.probe_output);
        } else {
            for chunk in &self.probe_chunks {
                sink(StreamKind::Stdout, chunk);
            }
        }
        Ok(0)
    }

    fn sudo(&self, command: &str, sink: &mut OutputSink<'_>) -> boxport_core::Result<i32> {
        self.commands.borrow_mut().push(format!("sudo: {}", command));
        if let Some(message) = &self.sudo_error {
            return Err(boxport_core::Error::channel(message.clone()));
        }
        sink(StreamKind::Stdout, "working\n");
        Ok(self.sudo_status)
    }

    fn upload(&self, local: &Path, remote: &str) -> boxport_core::Result<()> {
        let content = fs::read_to_string(local).map_err(boxport_core::Error::io_simple)?;
        self.uploads.borrow_mut().push((content, remote.to_string()));
        Ok(())
    }
}

/// Machine handle with scripted state and recorded lifecycle calls.
pub struct FakeMachine {
    pub state: MachineState,
    pub provider: String,
    pub id: String,
    pub name: String,
    pub box_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub communicator: Communicator,
    pub ssh: Option<SshInfo>,
    pub mac: Option<String>,
    pub channel: FakeChannel,
    pub ups: usize,
    pub halts: usize,
    pub ssh_refreshes: usize,
}

impl FakeMachine {
    pub fn new(provider: &str, id: &str, name: &str) -> Self {
        Self {
            state: MachineState::Running,
            provider: provider.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            box_dir: None,
            data_dir: None,
            communicator: Communicator::Ssh,
            ssh: Some(SshInfo {
                host: "127.0.0.1".to_string(),
                port: 2222,
                username: "vagrant".to_string(),
                private_key_path: None,
            }),
            mac: None,
            channel: FakeChannel::default(),
            ups: 0,
            halts: 0,
            ssh_refreshes: 0,
        }
    }
}

impl Machine for FakeMachine {
    fn state(&self) -> boxport_core::Result<MachineState> {
        Ok(self.state.clone())
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
        self.box_dir.as_deref()
    }

    fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn communicator(&self) -> Communicator {
        self.communicator
    }

    fn ssh_info(&mut self) -> boxport_core::Result<Option<SshInfo>> {
        self.ssh_refreshes += 1;
        Ok(self.ssh.clone())
    }

    fn up(&mut self) -> boxport_core::Result<()> {
        self.ups += 1;
        self.state = MachineState::Running;
        Ok(())
    }

    fn halt(&mut self) -> boxport_core::Result<()> {
        self.halts += 1;
        self.state = MachineState::PowerOff;
        Ok(())
    }

    fn read_mac_address(&self) -> boxport_core::Result<Option<String>> {
        Ok(self.mac.clone())
    }

    fn channel(&self) -> &dyn CommandChannel {
        &self.channel
    }
}

/// Tool runner that fakes `VBoxManage export` and records every call.
///
/// The export writes `box.ovf` and `box-disk001.vmdk` beside the requested
/// output path after streaming `export_chunks`. Other tools exit 0 silently.
pub struct ScriptedRunner {
    pub calls: RefCell<Vec<(String, Vec<String>)>>,
    pub export_chunks: Vec<(StreamKind, String)>,
    pub export_writes_files: bool,
    pub available: Vec<String>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            export_chunks: vec![(StreamKind::Stderr, "0%...10%...50%...100%\n".to_string())],
            export_writes_files: true,
            available: Vec::new(),
        }
    }
}

impl ScriptedRunner {
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<&Path>,
        sink: &mut OutputSink<'_>,
    ) -> boxport_core::Result<RunOutcome> {
        self.calls
            .borrow_mut()
            .push((program.to_string(), args.to_vec()));

        if program == "VBoxManage" && args.first().map(String::as_str) == Some("export") {
            for (stream, text) in &self.export_chunks {
                if let Flow::Abort(reason) = sink(*stream, text) {
                    return Ok(RunOutcome::Aborted(reason));
                }
            }
            if self.export_writes_files {
                let ovf = PathBuf::from(&args[3]);
                let dir = ovf.parent().unwrap();
                fs::write(&ovf, "<Envelope/>").unwrap();
                fs::write(dir.join("box-disk001.vmdk"), vec![7u8; 4096]).unwrap();
            }
        }
        Ok(RunOutcome::Exited(0))
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        self.available
            .iter()
            .any(|p| p == program)
            .then(|| PathBuf::from(program))
    }
}

/// UI that records everything it is asked to show.
#[derive(Default)]
pub struct RecordingUi {
    pub infos: RefCell<Vec<String>>,
    pub errors: RefCell<Vec<String>>,
    pub progress: RefCell<Vec<String>>,
    pub clears: RefCell<usize>,
}

impl Ui for RecordingUi {
    fn info(&self, message: &str) {
        self.infos.borrow_mut().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.borrow_mut().push(message.to_string());
    }

    fn progress(&self, message: &str) {
        self.progress.borrow_mut().push(message.to_string());
    }

    fn clear_line(&self) {
        *self.clears.borrow_mut() += 1;
    }
}

/// Read a gzip-compressed tar into a map of entry path to contents.
pub fn read_box(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let file = File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        entries.insert(name, data);
    }
    entries
}

/// Whether `dir` has no entries.
pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

/// Whether every named program is on `PATH`.
pub fn host_has(programs: &[&str]) -> bool {
    programs
        .iter()
        .all(|p| boxport_core::runner::find_executable(p).is_some())
}
