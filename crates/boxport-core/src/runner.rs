//! Host-local external tool execution.
//!
//! Tools such as `VBoxManage`, `vmware-vdiskmanager` and the packaging helper
//! write progress to their output streams while they run. [`ProcessRunner`]
//! reads both streams on worker threads, funnels the chunks through a channel
//! and hands them to the caller's sink in arrival order on the calling thread.

use std::env;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::machine::{Flow, OutputSink, StreamKind};

/// Size of a single read from a child's output pipe.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How a tool invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own with this status code.
    Exited(i32),
    /// The sink asked to stop; the process was killed.
    Aborted(String),
}

impl RunOutcome {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Exited(0))
    }

    /// Turn anything but a clean exit into an error for `program`.
    pub fn require_success(self, program: &str) -> Result<()> {
        match self {
            RunOutcome::Exited(0) => Ok(()),
            RunOutcome::Exited(status) => Err(Error::tool_failed(program, status)),
            RunOutcome::Aborted(reason) => Err(Error::tool_failed(
                format!("{} ({})", program, reason),
                -1,
            )),
        }
    }
}

/// Runs host executables and streams their output.
pub trait ToolRunner {
    /// Run `program` with `args`, optionally inside `cwd`, feeding every
    /// output chunk to `sink`.
    ///
    /// A missing executable is [`Error::ToolNotFound`]; a non-zero exit is
    /// reported as [`RunOutcome::Exited`] and left for the caller to judge.
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        sink: &mut OutputSink<'_>,
    ) -> Result<RunOutcome>;

    /// Locate `program` on the host, returning its full path.
    fn resolve(&self, program: &str) -> Option<PathBuf>;
}

/// [`ToolRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a new process runner.
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        sink: &mut OutputSink<'_>,
    ) -> Result<RunOutcome> {
        debug!(program, ?args, "spawning tool");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::tool_not_found(program));
            }
            Err(e) => return Err(Error::io(e, program)),
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let mut aborted = None;
        for (stream, text) in rx.iter() {
            if let Flow::Abort(reason) = sink(stream, &text) {
                aborted = Some(reason);
                break;
            }
        }

        if let Some(reason) = aborted {
            warn!(program, %reason, "aborting tool");
            if let Err(e) = child.kill() {
                debug!(program, error = %e, "kill after abort failed");
            }
            child.wait().map_err(|e| Error::io(e, program))?;
            // Readers finish on their own once the pipes close.
            return Ok(RunOutcome::Aborted(reason));
        }

        for reader in readers {
            let _ = reader.join();
        }
        let status = child.wait().map_err(|e| Error::io(e, program))?;
        let code = status.code().unwrap_or(-1);
        debug!(program, code, "tool exited");
        Ok(RunOutcome::Exited(code))
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        find_executable(program)
    }
}

/// Search `PATH` for `program`. Paths containing a separator are checked as-is.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var).find_map(|dir| {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = full.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

fn spawn_reader<R>(
    mut reader: R,
    stream: StreamKind,
    tx: Sender<(StreamKind, String)>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send((stream, text)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_run_outcome_success() {
        assert!(RunOutcome::Exited(0).success());
        assert!(!RunOutcome::Exited(1).success());
        assert!(!RunOutcome::Aborted("stop".into()).success());
    }

    #[test]
    fn test_require_success_maps_status() {
        assert!(RunOutcome::Exited(0).require_success("tar").is_ok());
        let err = RunOutcome::Exited(3).require_success("tar").unwrap_err();
        assert!(matches!(err, Error::ToolFailed { status: 3, .. }));
    }

    #[test]
    fn test_missing_tool_is_distinct_error() {
        let runner = ProcessRunner::new();
        let mut sink = |_: StreamKind, _: &str| Flow::Continue;
        let result = runner.run("boxport-definitely-not-a-tool", &[], None, &mut sink);
        assert!(matches!(result, Err(Error::ToolNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_both_channels() {
        let runner = ProcessRunner::new();
        let mut seen = Vec::new();
        let mut sink = |stream: StreamKind, text: &str| {
            seen.push((stream, text.to_string()));
            Flow::Continue
        };
        let outcome = runner
            .run("sh", &args(&["-c", "echo out; echo err 1>&2; exit 4"]), None, &mut sink)
            .unwrap();

        assert_eq!(outcome, RunOutcome::Exited(4));
        let stdout: String = seen
            .iter()
            .filter(|(s, _)| *s == StreamKind::Stdout)
            .map(|(_, t)| t.as_str())
            .collect();
        let stderr: String = seen
            .iter()
            .filter(|(s, _)| *s == StreamKind::Stderr)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(stdout.trim(), "out");
        assert_eq!(stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_sink_abort_kills_process() {
        let runner = ProcessRunner::new();
        let mut sink = |_: StreamKind, _: &str| Flow::Abort("bad output".into());
        let outcome = runner
            .run("sh", &args(&["-c", "echo boom; exec sleep 30"]), None, &mut sink)
            .unwrap();
        assert_eq!(outcome, RunOutcome::Aborted("bad output".into()));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_finds_shell() {
        assert!(ProcessRunner::new().resolve("sh").is_some());
        assert!(ProcessRunner::new()
            .resolve("boxport-definitely-not-a-tool")
            .is_none());
    }
}
