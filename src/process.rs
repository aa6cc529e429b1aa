//! Supervision of the external builder and importer.
//!
//! Children run in the foreground with stdout and stderr merged into one
//! pipe, which is forwarded line by line as it arrives. A SIGINT received
//! meanwhile is forwarded to the child; its remaining output is drained and
//! the child reaped before [`BuildError::Interrupted`] is returned.

use std::env;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, Pid};
use tracing::{debug, info, warn};

use crate::error::{BuildError, Result, ToolStage};

/// Set by the SIGINT handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Longest a silent child can delay interrupt forwarding.
const POLL_INTERVAL_MS: u16 = 100;

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT to a flag instead of terminating the process.
///
/// Installed without `SA_RESTART` so a blocked wait returns `EINTR` and the
/// runner looks at the flag right away.
pub fn install_interrupt_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .map_err(|e| BuildError::io("installing SIGINT handler", e.into()))?;
    debug!("SIGINT handler installed");
    Ok(())
}

pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Restore the default SIGINT disposition and deliver SIGINT to ourselves.
///
/// Only returns if the signal could not be delivered.
pub fn reraise_interrupt() {
    // SAFETY: resetting to the default disposition.
    if let Err(e) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigDfl) } {
        warn!(error = %e, "failed to restore default SIGINT handler");
    }
    if let Err(e) = signal::raise(Signal::SIGINT) {
        warn!(error = %e, "failed to re-raise SIGINT");
    }
}

/// An external program that may be installed under several names.
#[derive(Debug, Clone, Copy)]
pub struct ExternalTool {
    pub name: &'static str,
    /// Probed in order; the first one on `PATH` wins.
    pub candidates: &'static [&'static str],
    pub hint: &'static str,
}

pub const PACKER: ExternalTool = ExternalTool {
    name: "packer",
    candidates: &["packer", "packer-io"],
    hint: "Make sure packer is installed and on your PATH",
};

pub const VAGRANT: ExternalTool = ExternalTool {
    name: "vagrant",
    candidates: &["vagrant"],
    hint: "Make sure vagrant is installed and on your PATH",
};

impl ExternalTool {
    /// Find the first candidate on `PATH`.
    pub fn locate(&self) -> Result<PathBuf> {
        self.find(|candidate| which::which(candidate).ok())
    }

    /// Find the first candidate in an explicit search path.
    pub fn locate_in(&self, paths: &OsStr) -> Result<PathBuf> {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        self.find(|candidate| which::which_in(candidate, Some(paths), &cwd).ok())
    }

    fn find(&self, probe: impl Fn(&str) -> Option<PathBuf>) -> Result<PathBuf> {
        for candidate in self.candidates {
            if let Some(path) = probe(candidate) {
                debug!(tool = self.name, path = %path.display(), "located");
                return Ok(path);
            }
        }
        Err(BuildError::ToolMissing {
            tool: self.name,
            candidates: self.candidates.iter().map(|c| c.to_string()).collect(),
            hint: self.hint,
        })
    }
}

/// Switches the process working directory and restores it on drop.
#[derive(Debug)]
pub struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    pub fn enter(dir: &Path) -> Result<Self> {
        let previous = env::current_dir()
            .map_err(|e| BuildError::io("reading current directory", e))?;
        env::set_current_dir(dir)
            .map_err(|e| BuildError::io(format!("changing directory to '{}'", dir.display()), e))?;
        debug!(dir = %dir.display(), "entered working directory");
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.previous) {
            warn!(dir = %self.previous.display(), error = %e, "failed to restore working directory");
        }
    }
}

/// Run `f` with `dir` as the working directory.
pub fn with_working_dir<T>(dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = WorkingDirGuard::enter(dir)?;
    f()
}

/// Runs children in the foreground, streaming their merged output.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    interrupt: &'static AtomicBool,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            interrupt: &INTERRUPTED,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner watching `flag` instead of the SIGINT flag.
    pub fn with_interrupt_flag(flag: &'static AtomicBool) -> Self {
        Self { interrupt: flag }
    }

    /// Run `command` to completion and return its exit code.
    ///
    /// A child killed by a signal reports `128 + signal`, like a shell.
    pub fn run(
        &self,
        mut command: Command,
        stage: ToolStage,
        sink: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| BuildError::io("creating output pipe", e.into()))?;
        let writer_err = writer
            .try_clone()
            .map_err(|e| BuildError::io("duplicating output pipe", e))?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        debug!(?command, "spawning");
        let spawned = command.spawn();
        // The command owns the write ends; the pipe only reaches EOF once
        // they are closed here.
        drop(command);
        let mut child = spawned.map_err(|e| BuildError::io(format!("spawning {stage}"), e))?;
        let pid = Pid::from_raw(child.id() as i32);

        let mut output = File::from(reader);
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        let mut forwarded = false;
        let mut read_error: Option<io::Error> = None;

        loop {
            if !forwarded && self.interrupt.load(Ordering::SeqCst) {
                forwarded = true;
                info!(%stage, pid = pid.as_raw(), "interrupt received, forwarding to child");
                match signal::kill(pid, Signal::SIGINT) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!(error = %e, "failed to forward SIGINT"),
                }
            }

            match wait_readable(&output) {
                Ok(true) => {}
                Ok(false) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    read_error = Some(e.into());
                    break;
                }
            }

            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    emit_lines(&mut pending, sink);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }
        if !pending.is_empty() {
            sink(&String::from_utf8_lossy(&pending));
        }

        let status = child
            .wait()
            .map_err(|e| BuildError::io(format!("waiting for {stage}"), e))?;
        debug!(%stage, ?status, "child exited");

        if forwarded || self.interrupt.load(Ordering::SeqCst) {
            return Err(BuildError::Interrupted { stage });
        }
        if let Some(e) = read_error {
            return Err(BuildError::io(format!("reading {stage} output"), e));
        }

        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        })
    }
}

/// Wait up to one poll interval for output or hangup on `output`.
fn wait_readable(output: &File) -> nix::Result<bool> {
    let mut fds = [PollFd::new(output.as_fd(), PollFlags::POLLIN)];
    Ok(poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS))? > 0)
}

/// Pass every complete line in `pending` to `sink`, keeping the remainder.
fn emit_lines(pending: &mut Vec<u8>, sink: &mut dyn FnMut(&str)) {
    let mut start = 0;
    while let Some(pos) = pending[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        let line = &pending[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        sink(&String::from_utf8_lossy(line));
        start = end + 1;
    }
    pending.drain(..start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn collect(runner: &ProcessRunner, cmd: Command) -> (Result<i32>, Vec<String>) {
        let mut lines = Vec::new();
        let result = runner.run(cmd, ToolStage::Builder, &mut |l| lines.push(l.to_string()));
        (result, lines)
    }

    #[test]
    fn merges_stdout_and_stderr_in_order() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let runner = ProcessRunner::with_interrupt_flag(&FLAG);
        let (result, lines) = collect(&runner, sh("echo one; echo two >&2; printf three"));
        assert_eq!(result.unwrap(), 0);
        assert_eq!(lines, ["one", "two", "three"]);
    }

    #[test]
    fn reports_exit_code() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let runner = ProcessRunner::with_interrupt_flag(&FLAG);
        let (result, _) = collect(&runner, sh("exit 3"));
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn interrupt_is_forwarded_and_output_drained() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let runner = ProcessRunner::with_interrupt_flag(&FLAG);
        let cmd = sh(
            "trap 'echo caught; exit 7' INT; echo ready; \
             for i in 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20; do sleep 0.1; done; \
             echo finished",
        );

        let mut lines = Vec::new();
        let result = runner.run(cmd, ToolStage::Builder, &mut |l| {
            if l == "ready" {
                FLAG.store(true, Ordering::SeqCst);
            }
            lines.push(l.to_string());
        });

        assert!(matches!(
            result,
            Err(BuildError::Interrupted {
                stage: ToolStage::Builder
            })
        ));
        assert_eq!(lines, ["ready", "caught"]);
    }

    #[test]
    fn interrupt_reaches_a_silent_child() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let runner = ProcessRunner::with_interrupt_flag(&FLAG);
        let cmd = sh(
            "trap 'echo caught; exit 7' INT; \
             for i in 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 \
                      21 22 23 24 25 26 27 28 29 30; do sleep 0.1; done; \
             echo finished",
        );

        let setter = std::thread::spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            FLAG.store(true, Ordering::SeqCst);
        });
        let (result, lines) = collect(&runner, cmd);
        setter.join().unwrap();

        assert!(matches!(result, Err(BuildError::Interrupted { .. })));
        assert_eq!(lines, ["caught"]);
    }

    #[test]
    fn crlf_output_is_split_into_lines() {
        let mut pending = b"a\r\nb\nc".to_vec();
        let mut lines = Vec::new();
        emit_lines(&mut pending, &mut |l| lines.push(l.to_string()));
        assert_eq!(lines, ["a", "b"]);
        assert_eq!(pending, b"c");
    }

    #[test]
    fn first_installed_candidate_wins() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("packer-io");
        fs::write(&bin, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let found = PACKER.locate_in(tmp.path().as_os_str()).unwrap();
        assert_eq!(found, bin);
    }

    #[test]
    fn missing_tool_reports_candidates() {
        let tmp = TempDir::new().unwrap();
        let err = PACKER.locate_in(tmp.path().as_os_str()).unwrap_err();
        assert_eq!(err.exit_code(), 254);
        assert!(err.to_string().contains("packer, packer-io"));
    }

    #[test]
    #[serial]
    fn working_dir_is_restored_after_failure() {
        let before = env::current_dir().unwrap();
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().canonicalize().unwrap();

        let result: Result<()> = with_working_dir(&target, || {
            assert_eq!(env::current_dir().unwrap(), target);
            Err(BuildError::parse("test", "boom"))
        });

        assert!(result.is_err());
        assert_eq!(env::current_dir().unwrap(), before);
    }
}
