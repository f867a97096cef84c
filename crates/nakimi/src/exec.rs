//! Bounded subprocess execution
//!
//! Secret input is handed to tools on stdin and results are read from
//! stdout, so nothing sensitive ever appears on a command line. Every
//! child is tracked in the cleanup registry while it runs.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cleanup::CleanupRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished tool
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Zeroizing<Vec<u8>>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    /// First non-empty stderr line, for diagnostics
    pub fn stderr_summary(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("(no output)")
            .to_string()
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be found
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),
    /// The program outlived its time budget and was killed
    #[error("timed out after {}s", .0.as_secs_f32())]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run a tool to completion.
///
/// `input` is written to the child's stdin (stdin is closed when absent).
/// With `timeout` set the child is killed once the budget is spent; without
/// it the call blocks until the child exits or a signal purges it.
pub fn run(
    program: &Path,
    args: &[&std::ffi::OsStr],
    input: Option<&[u8]>,
    timeout: Option<Duration>,
    registry: &CleanupRegistry,
) -> Result<ToolOutput, ExecError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if timeout.is_some() {
        // Own process group, so a timeout also reaches grandchildren holding the pipes.
        // Untimed runs stay in the foreground group to keep tty prompts working.
        command.process_group(0);
    }

    debug!("Running {}", program.display());

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ExecError::NotFound(program.to_path_buf()),
        _ => ExecError::Io(e),
    })?;

    let pid = child.id();
    registry.track_child(pid);
    let result = drive(&mut child, input, timeout);
    registry.untrack_child(pid);

    result
}

fn drive(
    child: &mut Child,
    input: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<ToolOutput, ExecError> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    thread::scope(|scope| {
        if let (Some(mut pipe), Some(data)) = (stdin, input) {
            scope.spawn(move || {
                // EPIPE just means the tool stopped reading
                let _ = pipe.write_all(data);
            });
        }

        let out = scope.spawn(move || read_stdout(stdout));
        let err = scope.spawn(move || read_stderr(stderr));

        let status = wait_bounded(child, timeout)?;

        let stdout = out.join().unwrap_or_default();
        let stderr = err.join().unwrap_or_default();

        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    })
}

fn read_stdout(pipe: Option<ChildStdout>) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(Vec::new());
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn read_stderr(pipe: Option<ChildStderr>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn wait_bounded(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, ExecError> {
    let Some(limit) = timeout else {
        return Ok(child.wait()?);
    };

    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if Instant::now() >= deadline {
            debug!("Killing child {} after {:?}", child.id(), limit);
            if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
                // SAFETY: signals only the process group created for this child
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecError::TimedOut(limit));
        }

        thread::sleep(POLL_INTERVAL);
    }
}
