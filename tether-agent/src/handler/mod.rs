//! Per-message protocol handlers.
//!
//! Handlers run on the reactor thread. They mutate the client's
//! [`Session`] and push replies into an [`Outbox`]; the reactor writes the
//! outbox through the backpressure-aware path once the handler returns.

mod connect;
pub mod exec;
pub mod files;
pub mod log;

use std::io;

use nix::errno::Errno;
use tether_proto::{ClientToServer, ServerToClient};
use tracing::debug;

use crate::bridge::SubmitError;
use crate::config::Config;
use crate::registry::ClientId;

/// Replies produced by one handler invocation, in send order.
pub type Outbox = Vec<ServerToClient>;

/// Accepts commands for asynchronous execution.
pub trait JobQueue {
    /// Queues `command` on behalf of `client` without blocking.
    fn submit(&self, client: ClientId, command: String) -> Result<(), SubmitError>;
}

/// Per-connection protocol state.
#[derive(Debug, Default)]
pub struct Session {
    /// Download in progress.
    pub get: files::GetStream,
    /// Upload in progress.
    pub put: files::PutStream,
}

/// Everything a handler may touch besides the session.
pub struct Context<'a> {
    /// Client the request came from.
    pub client: ClientId,
    /// Server configuration.
    pub config: &'a Config,
    /// Command submission.
    pub jobs: &'a dyn JobQueue,
    /// Replies to send.
    pub outbox: &'a mut Outbox,
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("client", &self.client)
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

/// Routes one decoded request to its handler.
pub fn dispatch(session: &mut Session, request: ClientToServer, cx: &mut Context<'_>) {
    match request {
        ClientToServer::ConnectReq(req) => connect::handle(&req, cx),
        ClientToServer::ExecuteCommandReq(req) => exec::handle(req, cx),
        ClientToServer::GetFileReq(req) => files::get(&mut session.get, &req, cx),
        ClientToServer::PutFileReq(req) => files::put(&mut session.put, &req, cx),
        other => debug!(client = %cx.client, request = ?other, "ignoring unhandled request"),
    }
}

/// System description of an I/O error, without the `(os error N)` suffix.
pub fn describe(e: &io::Error) -> String {
    e.raw_os_error()
        .map_or_else(|| e.to_string(), |code| Errno::from_raw(code).desc().to_owned())
}
