//! Wire protocol for tether device control.
//!
//! A connection carries frames with a 4-byte header (`u8` type, `u24`
//! big-endian payload size). User frames carry a [`postcard`]-encoded
//! envelope, control frames (ping/pong) carry nothing.

pub mod codec;
pub mod frame;
mod message;

pub use codec::{decode, decode_request, decode_response, encode, encode_user, recv, send, send_control};
pub use frame::{HEADER_SIZE, Header, MAX_PAYLOAD, MessageType, encode_frame};
pub use message::{
    ClientToServer, ConnectReq, ConnectRsp, DEFAULT_PORT, ExecuteCommandReq, ExecuteCommandRsp,
    GetFileReq, GetFileRsp, LogEntryInd, PutFileReq, PutFileRsp, ServerToClient,
};

/// Alias for `Result<T, tether_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while framing or decoding messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The header carried a type tag outside the known set.
    #[error("unknown frame type {0}")]
    UnknownType(u8),

    /// A payload does not fit the 24-bit size field or the receiver's limit.
    #[error("payload of {0} bytes is too large")]
    TooLarge(usize),

    /// postcard rejected the payload.
    #[error("codec: {0}")]
    Codec(#[from] postcard::Error),

    /// The envelope decoded but did not consume the whole payload.
    #[error("{0} trailing bytes after envelope")]
    Trailing(usize),

    /// An I/O error on the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
