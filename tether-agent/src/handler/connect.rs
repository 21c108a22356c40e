//! Capability handshake.

use tether_proto::{ConnectReq, ConnectRsp, ServerToClient};
use tracing::debug;

use super::Context;

/// Answers with the server's ping interval and message size limit. Session
/// state is left untouched, so a repeated handshake is harmless.
pub fn handle(req: &ConnectReq, cx: &mut Context<'_>) {
    debug!(
        client = %cx.client,
        keep_alive = req.keep_alive_timeout,
        max_message_size = req.maximum_message_size,
        "handshake"
    );
    cx.outbox.push(ServerToClient::ConnectRsp(ConnectRsp {
        keep_alive_timeout: cx.config.ping_interval_secs,
        maximum_message_size: u32::try_from(cx.config.max_message_size).unwrap_or(u32::MAX),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handler::testing::{Jobs, client_id};
    use crate::handler::{Outbox, Session, dispatch};
    use tether_proto::ClientToServer;

    #[test]
    fn replies_with_limits_and_keeps_session() {
        let config = Config::default();
        let jobs = Jobs::default();
        let mut outbox = Outbox::new();
        let mut session = Session::default();
        session.get.window = 7;

        let mut cx = Context {
            client: client_id(),
            config: &config,
            jobs: &jobs,
            outbox: &mut outbox,
        };
        dispatch(
            &mut session,
            ClientToServer::ConnectReq(ConnectReq::default()),
            &mut cx,
        );
        dispatch(
            &mut session,
            ClientToServer::ConnectReq(ConnectReq {
                keep_alive_timeout: 5,
                maximum_message_size: 1024,
            }),
            &mut cx,
        );

        let expected = ServerToClient::ConnectRsp(ConnectRsp {
            keep_alive_timeout: 2,
            maximum_message_size: 512,
        });
        assert_eq!(outbox, vec![expected.clone(), expected]);
        assert_eq!(session.get.window, 7);
    }
}
