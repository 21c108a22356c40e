//! Envelope message types carried in user frames.
//!
//! Each direction is a one-of: the client sends a [`ClientToServer`], the
//! server answers with [`ServerToClient`]. Variant order is part of the wire
//! format (postcard encodes the variant index as a varint), so new variants
//! may only be appended.

use serde::{Deserialize, Serialize};

/// Default TCP port of the device agent.
pub const DEFAULT_PORT: u16 = 28000;

/// Envelope sent from the management client to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ClientToServer {
    /// Capability handshake.
    ConnectReq(ConnectReq),
    /// Run a shell command on the device.
    ExecuteCommandReq(ExecuteCommandReq),
    /// Open a file for download, or acknowledge received chunks.
    GetFileReq(GetFileReq),
    /// Open a file for upload, append a chunk, or close it.
    PutFileReq(PutFileReq),
}

impl ClientToServer {
    /// Number of variants this build understands.
    pub const VARIANTS: u32 = 4;
}

/// Envelope sent from the device to the management client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerToClient {
    /// Reply to [`ConnectReq`].
    ConnectRsp(ConnectRsp),
    /// Output fragment or terminal status of a command.
    ExecuteCommandRsp(ExecuteCommandRsp),
    /// Unsolicited log line.
    LogEntryInd(LogEntryInd),
    /// Download metadata and data chunks.
    GetFileRsp(GetFileRsp),
    /// Upload acknowledgement.
    PutFileRsp(PutFileRsp),
}

impl ServerToClient {
    /// Number of variants this build understands.
    pub const VARIANTS: u32 = 5;
}

/// Handshake request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReq {
    /// Ping interval the client intends to use, in seconds.
    pub keep_alive_timeout: u32,
    /// Largest message the client accepts, header included.
    pub maximum_message_size: u32,
}

/// Handshake reply carrying the server's limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRsp {
    /// Interval, in seconds, within which the client must ping.
    pub keep_alive_timeout: u32,
    /// Largest message the server accepts, header included.
    pub maximum_message_size: u32,
}

/// Command execution request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommandReq {
    /// Command line handed to the device shell.
    pub command: String,
}

/// Command execution response.
///
/// A command produces zero or more fragments (non-empty `output`, empty
/// `error`) followed by exactly one terminal response with empty `output`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommandRsp {
    /// Output fragment.
    pub output: Vec<u8>,
    /// Empty on success.
    pub error: String,
}

/// Log indication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntryInd {
    /// Text fragments to be concatenated, typically `[timestamp, message]`.
    pub text: Vec<String>,
}

/// Download request.
///
/// A non-empty `path` opens a new download. An empty `path` acknowledges
/// `acknowledge_count` chunks of the current download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFileReq {
    /// Remote path, or empty for an acknowledgement.
    pub path: String,
    /// Requested number of unacknowledged chunks, `0` for the server default.
    pub window_size: u32,
    /// Number of chunks acknowledged.
    pub acknowledge_count: u32,
}

/// Download response.
///
/// The first response carries the file `size`. A response with empty `data`
/// ends the download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFileRsp {
    /// Total file size in bytes (first response only).
    pub size: u64,
    /// Data chunk.
    pub data: Vec<u8>,
    /// Empty on success.
    pub error: String,
}

/// Upload request.
///
/// A non-empty `path` opens the file, non-empty `data` appends to it, and a
/// request with both empty closes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFileReq {
    /// Remote path, or empty for data and close requests.
    pub path: String,
    /// Total upload size (informational).
    pub size: u64,
    /// Data chunk.
    pub data: Vec<u8>,
}

/// Upload response, one per [`PutFileReq`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFileRsp {
    /// Maximum number of unacknowledged data chunks (open response only).
    pub window_size: u32,
    /// Empty on success.
    pub error: String,
    /// Number of requests acknowledged by this response.
    pub acknowledge_count: u32,
}
