//! Guest command channel over the host's `ssh` and `scp` binaries.

use std::path::Path;

use boxport_core::{
    CommandChannel, Error, OutputSink, ProcessRunner, RunOutcome, SshInfo, ToolRunner,
};
use tracing::debug;

/// Exit status `ssh` uses for its own connection failures.
const SSH_CONNECTION_FAILED: i32 = 255;

/// [`CommandChannel`] that shells out to OpenSSH.
///
/// The connection descriptor is refreshed by the owning machine handle
/// through [`SshChannel::set_info`].
#[derive(Debug, Default)]
pub struct SshChannel {
    info: Option<SshInfo>,
    runner: ProcessRunner,
}

impl SshChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached connection descriptor.
    pub fn set_info(&mut self, info: Option<SshInfo>) {
        self.info = info;
    }

    fn info(&self) -> boxport_core::Result<&SshInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| Error::channel("no SSH connection details for the guest"))
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(info: &SshInfo) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(key) = &info.private_key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn destination(info: &SshInfo) -> String {
        format!("{}@{}", info.username, info.host)
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl CommandChannel for SshChannel {
    fn execute(&self, command: &str, sink: &mut OutputSink<'_>) -> boxport_core::Result<i32> {
        let info = self.info()?;
        let mut args = Self::common_options(info);
        args.push("-p".to_string());
        args.push(info.port.to_string());
        args.push(Self::destination(info));
        args.push(command.to_string());

        debug!(host = %info.host, port = info.port, command, "running guest command");
        match self.runner.run("ssh", &args, None, sink)? {
            RunOutcome::Exited(SSH_CONNECTION_FAILED) => Err(Error::channel(format!(
                "could not connect to {}:{}",
                info.host, info.port
            ))),
            RunOutcome::Exited(status) => Ok(status),
            RunOutcome::Aborted(reason) => Err(Error::channel(reason)),
        }
    }

    fn sudo(&self, command: &str, sink: &mut OutputSink<'_>) -> boxport_core::Result<i32> {
        self.execute(&format!("sudo -H sh -c {}", shell_quote(command)), sink)
    }

    fn upload(&self, local: &Path, remote: &str) -> boxport_core::Result<()> {
        let info = self.info()?;
        let mut args = Self::common_options(info);
        args.push("-P".to_string());
        args.push(info.port.to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", Self::destination(info), remote));

        let mut sink = |_: boxport_core::StreamKind, _: &str| boxport_core::Flow::Continue;
        self.runner
            .run("scp", &args, None, &mut sink)?
            .require_success("scp")
    }
}
