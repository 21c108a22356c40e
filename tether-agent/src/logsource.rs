//! Per-connection log streams.
//!
//! Every connecting client gets its own stream from the configured
//! [`LogSource`]. The reactor polls the stream's descriptor and forwards
//! complete lines as log indications.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Longest line kept; the excess of a longer line is dropped.
pub const MAX_LINE: usize = 4096;

/// A non-blocking, pollable byte stream of log lines.
pub trait LogStream: Read + AsRawFd + Send {}

impl<T: Read + AsRawFd + Send> LogStream for T {}

/// Opens one log stream per connection.
pub trait LogSource: Send {
    /// Opens a stream for a new client. `Ok(None)` means no log is
    /// available, which is not an error.
    fn open(&self) -> io::Result<Option<Box<dyn LogStream>>>;
}

/// The kernel ring buffer, read through `/dev/kmsg`.
#[derive(Debug, Clone)]
pub struct KernelLog {
    /// Device path.
    path: PathBuf,
}

impl KernelLog {
    /// Reads records from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for KernelLog {
    fn default() -> Self {
        Self::new("/dev/kmsg")
    }
}

impl LogSource for KernelLog {
    fn open(&self) -> io::Result<Option<Box<dyn LogStream>>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path)?;
        Ok(Some(Box::new(file)))
    }
}

/// Disables log forwarding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLog;

impl LogSource for NoLog {
    fn open(&self) -> io::Result<Option<Box<dyn LogStream>>> {
        Ok(None)
    }
}

/// Splits a log stream into lines, carrying partial lines across reads.
pub struct LogReader {
    /// Underlying stream.
    stream: Box<dyn LogStream>,
    /// Bytes of an unterminated line.
    partial: Vec<u8>,
}

impl fmt::Debug for LogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogReader")
            .field("fd", &self.stream.as_raw_fd())
            .field("partial", &self.partial.len())
            .finish()
    }
}

impl LogReader {
    /// Wraps a stream.
    pub fn new(stream: Box<dyn LogStream>) -> Self {
        Self {
            stream,
            partial: Vec::new(),
        }
    }

    /// Descriptor to register for readiness.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Reads until the stream would block, appending complete lines to
    /// `lines`. Returns `Ok(false)` once the stream has ended.
    pub fn read_lines(&mut self, lines: &mut Vec<String>) -> io::Result<bool> {
        let mut buf = [0u8; 2048];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.split(&buf[..n], lines),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // kmsg: the reader fell behind and records were overwritten.
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Appends `bytes`, emitting every line they complete.
    fn split(&mut self, bytes: &[u8], lines: &mut Vec<String>) {
        for piece in bytes.split_inclusive(|&b| b == b'\n') {
            let (body, complete) = match piece.split_last() {
                Some((b'\n', body)) => (body, true),
                _ => (piece, false),
            };
            let room = MAX_LINE.saturating_sub(self.partial.len());
            self.partial.extend_from_slice(&body[..body.len().min(room)]);
            if complete {
                lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                self.partial.clear();
            }
        }
    }
}
