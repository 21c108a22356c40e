//! Command execution.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// Exited with status 0.
    Success,
    /// Could not be started; carries an `errno` value.
    Errno(i32),
    /// Exited with a non-zero status.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// The runner itself failed.
    Crashed,
}

impl Status {
    /// Error string reported to the client, empty on success.
    pub fn message(self) -> String {
        match self {
            Self::Success => String::new(),
            Self::Errno(code) => Errno::from_raw(code).desc().to_owned(),
            Self::Exited(code) => format!("Exited with status {code}."),
            Self::Signaled(signal) => format!("Killed by signal {signal}."),
            Self::Crashed => "Command runner crashed.".to_owned(),
        }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    /// Termination status.
    pub status: Status,
}

impl CommandOutput {
    /// Successful result carrying `output`.
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            status: Status::Success,
        }
    }

    /// Result without output.
    pub const fn status(status: Status) -> Self {
        Self {
            output: Vec::new(),
            status,
        }
    }
}

/// Runs one command to completion. Called from worker threads.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `command` and captures its output.
    fn run(&self, command: &str) -> CommandOutput;
}

impl<F> CommandRunner for F
where
    F: Fn(&str) -> CommandOutput + Send + Sync + 'static,
{
    fn run(&self, command: &str) -> CommandOutput {
        self(command)
    }
}

/// Runs commands through `sh -c`, stderr appended to stdout.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Shell binary.
    shell: PathBuf,
}

impl ShellRunner {
    /// Uses `shell` instead of `/bin/sh`.
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> CommandOutput {
        let out = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
        {
            Ok(out) => out,
            Err(e) => return CommandOutput::status(Status::Errno(e.raw_os_error().unwrap_or(libc::EIO))),
        };

        let status = if out.status.success() {
            Status::Success
        } else if let Some(code) = out.status.code() {
            Status::Exited(code)
        } else {
            out.status.signal().map_or(Status::Crashed, Status::Signaled)
        };

        let mut output = out.stdout;
        output.extend_from_slice(&out.stderr);
        CommandOutput { output, status }
    }
}
