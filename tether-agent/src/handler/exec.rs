//! Execute-command protocol.
//!
//! A request is handed to the work bridge and answered later, on the
//! reactor thread, with zero or more output fragments followed by exactly
//! one terminal response whose `output` is empty.

use tether_proto::{ExecuteCommandReq, ExecuteCommandRsp, ServerToClient};
use tracing::{debug, warn};

use super::{Context, Outbox};
use crate::runner::CommandOutput;

/// Queues the command. A refused submission is answered immediately.
pub fn handle(req: ExecuteCommandReq, cx: &mut Context<'_>) {
    debug!(client = %cx.client, command = %req.command, "execute");
    if let Err(e) = cx.jobs.submit(cx.client, req.command) {
        warn!(client = %cx.client, error = %e, "command refused");
        cx.outbox.push(terminal(e.to_string()));
    }
}

/// Splits a finished command into fragments plus the terminal response.
pub fn completion(result: &CommandOutput, chunk_size: usize, outbox: &mut Outbox) {
    outbox.extend(result.output.chunks(chunk_size.max(1)).map(|chunk| {
        ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp {
            output: chunk.to_vec(),
            error: String::new(),
        })
    }));
    outbox.push(terminal(result.status.message()));
}

/// The response that ends a command.
fn terminal(error: String) -> ServerToClient {
    ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp {
        output: Vec::new(),
        error,
    })
}
