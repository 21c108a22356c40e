//! Incremental frame reassembly over a non-blocking byte stream.
//!
//! A [`Framer`] owns one fixed input buffer sized to the largest accepted
//! message. Each call to [`Framer::read_from`] pulls whatever bytes are
//! available into the current target (header, then payload) and returns as
//! soon as a frame is complete, the source would block, or the peer closed.

use std::io::{self, Read};

use tether_proto::{HEADER_SIZE, Header};

/// Fatal framing errors. The connection cannot be resynchronized after any
/// of these.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    /// The declared payload does not fit the input buffer.
    #[error("frame of {size} bytes exceeds the {capacity}-byte input buffer")]
    Oversized {
        /// Declared payload size.
        size: usize,
        /// Input buffer capacity, header included.
        capacity: usize,
    },

    /// The header named an unknown frame type.
    #[error(transparent)]
    Header(#[from] tether_proto::Error),

    /// The underlying read failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a [`Framer::read_from`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete frame is available through [`Framer::payload`].
    Frame(Header),
    /// No more bytes are available right now.
    WouldBlock,
    /// The peer closed the stream.
    Closed,
}

/// Framing cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the 4-byte header.
    AwaitingHeader,
    /// Reading the payload announced by the header.
    AwaitingPayload(Header),
    /// A frame is assembled and has not been consumed yet.
    Complete(Header),
}

/// Per-connection frame assembler.
#[derive(Debug)]
pub struct Framer {
    /// Header and payload of the frame being assembled.
    buf: Box<[u8]>,
    /// Bytes of `buf` filled so far.
    filled: usize,
    /// Cursor.
    state: State,
}

impl Framer {
    /// Creates a framer accepting messages of at most `capacity` bytes,
    /// header included.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(HEADER_SIZE)].into_boxed_slice(),
            filled: 0,
            state: State::AwaitingHeader,
        }
    }

    /// Discards any partially assembled frame.
    pub const fn reset(&mut self) {
        self.filled = 0;
        self.state = State::AwaitingHeader;
    }

    /// Payload of the frame returned by the last [`ReadEvent::Frame`].
    pub fn payload(&self) -> &[u8] {
        match self.state {
            State::Complete(header) => &self.buf[HEADER_SIZE..HEADER_SIZE + header.size],
            State::AwaitingHeader | State::AwaitingPayload(_) => &[],
        }
    }

    /// Reads from `src` until a frame completes, the source would block, or
    /// the peer closes. A previously returned frame is discarded first.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<ReadEvent, FramingError> {
        if matches!(self.state, State::Complete(_)) {
            self.reset();
        }
        loop {
            let target = match self.state {
                State::AwaitingHeader if self.filled == HEADER_SIZE => {
                    let header = Header::parse([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])?;
                    if HEADER_SIZE + header.size > self.buf.len() {
                        return Err(FramingError::Oversized {
                            size: header.size,
                            capacity: self.buf.len(),
                        });
                    }
                    self.state = State::AwaitingPayload(header);
                    continue;
                }
                State::AwaitingHeader => HEADER_SIZE,
                State::AwaitingPayload(header) if self.filled == HEADER_SIZE + header.size => {
                    self.state = State::Complete(header);
                    return Ok(ReadEvent::Frame(header));
                }
                State::AwaitingPayload(header) => HEADER_SIZE + header.size,
                State::Complete(header) => return Ok(ReadEvent::Frame(header)),
            };

            match src.read(&mut self.buf[self.filled..target]) {
                Ok(0) => return Ok(ReadEvent::Closed),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadEvent::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
