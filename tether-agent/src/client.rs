//! Per-connection state.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use mio::net::TcpStream;
use mio::unix::SourceFd;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::framer::Framer;
use crate::handler::Session;
use crate::logsource::LogReader;

/// One-shot keep-alive timer backed by a `timerfd`.
#[derive(Debug)]
pub struct KeepAlive {
    /// Timer descriptor, readable once expired.
    timer: TimerFd,
    /// Period re-armed on every ping.
    timeout: Duration,
}

impl KeepAlive {
    /// Creates an armed timer.
    pub fn new(timeout: Duration) -> io::Result<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        let keep_alive = Self { timer, timeout };
        keep_alive.arm()?;
        Ok(keep_alive)
    }

    /// Restarts the countdown.
    pub fn arm(&self) -> io::Result<()> {
        self.timer.set(
            Expiration::OneShot(TimeSpec::from_duration(self.timeout)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(())
    }

    /// Whether the countdown has run out. A readiness event can outlive a
    /// re-arm made later in the same poll pass; this reports `false` then.
    pub fn expired(&self) -> io::Result<bool> {
        Ok(self.timer.get()?.is_none())
    }

    /// Descriptor to register for readiness.
    pub fn raw_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }
}

/// Pending bytes of one frame.
#[derive(Debug)]
struct OutputItem {
    /// Frame bytes.
    buf: Vec<u8>,
    /// Bytes of `buf` already written.
    offset: usize,
}

/// FIFO of frames the socket could not take yet.
#[derive(Debug, Default)]
pub struct OutputQueue {
    /// Queued frames, oldest first.
    items: VecDeque<OutputItem>,
}

impl OutputQueue {
    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drops everything queued.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Writes `bytes` directly when the queue is empty, queueing whatever
    /// the socket does not take. Returns `true` when write interest must be
    /// armed.
    pub fn write<W: Write>(&mut self, w: &mut W, bytes: &[u8]) -> io::Result<bool> {
        if !self.items.is_empty() {
            self.push(bytes.to_vec());
            return Ok(false);
        }
        let mut written = 0;
        while written < bytes.len() {
            match w.write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if written == bytes.len() {
            return Ok(false);
        }
        self.push(bytes[written..].to_vec());
        Ok(true)
    }

    /// Writes queued frames front to back. Returns `true` once the queue is
    /// empty.
    pub fn flush<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while let Some(item) = self.items.front_mut() {
            match w.write(&item.buf[item.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    item.offset += n;
                    if item.offset == item.buf.len() {
                        self.items.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Appends a frame.
    fn push(&mut self, buf: Vec<u8>) {
        self.items.push_back(OutputItem { buf, offset: 0 });
    }
}

/// One registry slot.
#[derive(Debug)]
pub struct Client {
    /// Peer socket, `None` once disconnected.
    pub stream: Option<TcpStream>,
    /// Peer address.
    pub peer: Option<SocketAddr>,
    /// Input frame assembly.
    pub framer: Framer,
    /// Output backlog.
    pub output: OutputQueue,
    /// Keep-alive timer.
    pub keep_alive: Option<KeepAlive>,
    /// Forwarded log stream.
    pub log: Option<LogReader>,
    /// Get/put file state.
    pub session: Session,
}

impl Client {
    /// An empty slot with a `capacity`-byte input buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            stream: None,
            peer: None,
            framer: Framer::new(capacity),
            output: OutputQueue::default(),
            keep_alive: None,
            log: None,
            session: Session::default(),
        }
    }

    /// Starts serving a freshly accepted peer.
    pub fn attach(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        keep_alive: KeepAlive,
        log: Option<LogReader>,
    ) {
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.keep_alive = Some(keep_alive);
        self.log = log;
        self.framer.reset();
        self.output.clear();
        self.session = Session::default();
    }

    /// Closes the socket and drops pending output.
    pub fn close(&mut self, registry: &mio::Registry) {
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
        }
        self.output.clear();
    }

    /// Releases everything the connection held.
    pub fn finish(&mut self, registry: &mio::Registry) {
        self.close(registry);
        if let Some(keep_alive) = self.keep_alive.take() {
            let _ = registry.deregister(&mut SourceFd(&keep_alive.raw_fd()));
        }
        self.stop_log(registry);
        self.session = Session::default();
        self.framer.reset();
        self.peer = None;
    }

    /// Stops log forwarding.
    pub fn stop_log(&mut self, registry: &mio::Registry) {
        if let Some(log) = self.log.take() {
            let _ = registry.deregister(&mut SourceFd(&log.raw_fd()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts up to `budget` bytes, then would-block.
    #[derive(Default)]
    struct Choked {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for Choked {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn direct_write_when_idle() {
        let mut queue = OutputQueue::default();
        let mut w = Choked {
            budget: 100,
            ..Choked::default()
        };
        assert!(!queue.write(&mut w, b"frame").unwrap());
        assert!(queue.is_empty());
        assert_eq!(w.written, b"frame");
    }

    #[test]
    fn backpressure_preserves_order() {
        let mut queue = OutputQueue::default();
        let mut w = Choked {
            budget: 3,
            ..Choked::default()
        };

        assert!(queue.write(&mut w, b"first").unwrap());
        // Queued behind the remainder even though nothing is writable.
        assert!(!queue.write(&mut w, b"second").unwrap());
        assert_eq!(queue.len(), 2);

        w.budget = 4;
        assert!(!queue.flush(&mut w).unwrap());
        assert_eq!(queue.len(), 1);

        w.budget = 100;
        assert!(queue.flush(&mut w).unwrap());
        assert!(queue.is_empty());
        assert_eq!(w.written, b"firstsecond");
    }

    #[test]
    fn write_errors_are_fatal() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut queue = OutputQueue::default();
        assert!(queue.write(&mut Broken, b"x").is_err());
    }

    #[test]
    fn keep_alive_expires_and_rearms() {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let keep_alive = KeepAlive::new(Duration::from_millis(20)).unwrap();
        let wait = |ms: u16| {
            let mut fds = [PollFd::new(keep_alive.timer.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(ms)).unwrap()
        };
        assert_eq!(wait(500), 1);
        assert!(keep_alive.expired().unwrap());

        // Re-arming clears the expiry and restarts the countdown.
        keep_alive.arm().unwrap();
        assert!(!keep_alive.expired().unwrap());
        assert_eq!(wait(0), 0);
        assert_eq!(wait(500), 1);
        assert!(keep_alive.expired().unwrap());
    }

    #[test]
    fn rearmed_timer_is_not_expired() {
        let keep_alive = KeepAlive::new(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // A ping handled after the expiry but before the timer event.
        keep_alive.arm().unwrap();
        assert!(!keep_alive.expired().unwrap());
    }
}
