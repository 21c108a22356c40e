//! Blocking connection to a device agent.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tether_proto::{
    ClientToServer, ConnectReq, ConnectRsp, ExecuteCommandReq, GetFileReq, HEADER_SIZE, MAX_PAYLOAD,
    MessageType, PutFileReq, PutFileRsp, ServerToClient,
};
use tracing::debug;

use crate::{Error, Result};

/// Message size assumed until the handshake reports a larger one.
const MIN_MESSAGE_SIZE: u32 = 64;

/// Bytes of an upload request reserved for framing and envelope fields.
const PUT_OVERHEAD: usize = 16;

/// One inbound frame, classified.
#[derive(Debug)]
enum Event {
    /// Keep-alive answer.
    Pong,
    /// Forwarded log line, fragments joined.
    Log(String),
    /// Any other envelope.
    Message(ServerToClient),
}

/// Write half shared with the keep-alive thread.
type Writer = Arc<Mutex<TcpStream>>;

/// Sends a ping every interval until dropped.
#[derive(Debug)]
struct Pinger {
    /// Dropping the sender wakes and ends the thread.
    stop: Option<mpsc::Sender<()>>,
    /// Pinger thread.
    thread: Option<thread::JoinHandle<()>>,
}

impl Pinger {
    /// Spawns the pinger thread.
    fn start(writer: Writer, interval: Duration) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("tether-keepalive".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    if let Err(e) = send_ping(&writer) {
                        debug!(error = %e, "keep-alive ping failed");
                        return;
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A connection to a device agent.
///
/// After the handshake a background thread pings at the interval reported
/// in [`limits`](Client::limits), so the agent keeps the connection open
/// while a long command runs or a transfer stalls.
#[derive(Debug)]
pub struct Client {
    /// Read half of the TCP stream.
    stream: TcpStream,
    /// Write half, shared with the pinger.
    writer: Writer,
    /// Limits reported by the handshake.
    limits: ConnectRsp,
    /// Log lines received while waiting for other replies.
    logs: VecDeque<String>,
    /// Background keep-alive, `None` if the device reports no interval.
    pinger: Option<Pinger>,
}

impl Client {
    /// Connects to `addr` and performs the handshake.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::handshake(TcpStream::connect(addr)?)
    }

    /// Performs the handshake on an established stream.
    pub fn handshake(stream: TcpStream) -> Result<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "TCP_NODELAY not set");
        }
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let mut client = Self {
            stream,
            writer,
            limits: ConnectRsp::default(),
            logs: VecDeque::new(),
            pinger: None,
        };
        client.request(&ClientToServer::ConnectReq(ConnectReq {
            keep_alive_timeout: 0,
            maximum_message_size: u32::try_from(HEADER_SIZE + MAX_PAYLOAD).unwrap_or(u32::MAX),
        }))?;
        match client.next_message()? {
            ServerToClient::ConnectRsp(rsp) => client.limits = rsp,
            other => return Err(unexpected(&other)),
        }
        debug!(
            keep_alive = client.limits.keep_alive_timeout,
            max_message_size = client.limits.maximum_message_size,
            "connected"
        );
        if client.limits.keep_alive_timeout > 0 {
            let interval = Duration::from_secs(client.limits.keep_alive_timeout.into());
            client.pinger = Some(Pinger::start(Arc::clone(&client.writer), interval)?);
        }
        Ok(client)
    }

    /// Limits reported by the device.
    pub const fn limits(&self) -> ConnectRsp {
        self.limits
    }

    /// Sets a read timeout for every reply; `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Sends a keep-alive ping and waits for the pong.
    pub fn ping(&mut self) -> Result<()> {
        send_ping(&self.writer)?;
        loop {
            match self.next_event()? {
                Event::Pong => return Ok(()),
                Event::Log(line) => self.logs.push_back(line),
                Event::Message(other) => return Err(unexpected(&other)),
            }
        }
    }

    /// Runs `command` on the device and returns its combined output.
    ///
    /// A failing command yields [`Error::Command`] carrying whatever output
    /// it produced.
    pub fn execute(&mut self, command: &str) -> Result<Vec<u8>> {
        self.request(&ClientToServer::ExecuteCommandReq(ExecuteCommandReq {
            command: command.to_owned(),
        }))?;
        let mut output = Vec::new();
        loop {
            let rsp = match self.next_message()? {
                ServerToClient::ExecuteCommandRsp(rsp) => rsp,
                other => return Err(unexpected(&other)),
            };
            if !rsp.output.is_empty() {
                output.extend(rsp.output);
            } else if rsp.error.is_empty() {
                return Ok(output);
            } else {
                return Err(Error::Command {
                    output,
                    error: rsp.error,
                });
            }
        }
    }

    /// Downloads `remote` into `out`, acknowledging every chunk. Returns the
    /// number of bytes written.
    pub fn get_file(&mut self, remote: &str, out: &mut impl Write) -> Result<u64> {
        self.request(&ClientToServer::GetFileReq(GetFileReq {
            path: remote.to_owned(),
            ..GetFileReq::default()
        }))?;
        let mut written = 0;
        loop {
            let rsp = match self.next_message()? {
                ServerToClient::GetFileRsp(rsp) => rsp,
                other => return Err(unexpected(&other)),
            };
            if rsp.data.is_empty() {
                if !rsp.error.is_empty() {
                    return Err(Error::Remote {
                        path: remote.to_owned(),
                        error: rsp.error,
                    });
                }
                return Ok(written);
            }
            out.write_all(&rsp.data)?;
            written += rsp.data.len() as u64;
            self.request(&ClientToServer::GetFileReq(GetFileReq {
                acknowledge_count: 1,
                ..GetFileReq::default()
            }))?;
        }
    }

    /// Uploads `size` bytes from `input` to `remote`, keeping at most the
    /// device's advertised window of chunks unacknowledged.
    pub fn put_file(&mut self, input: &mut impl Read, size: u64, remote: &str) -> Result<()> {
        self.request(&ClientToServer::PutFileReq(PutFileReq {
            path: remote.to_owned(),
            size,
            data: Vec::new(),
        }))?;
        let window = self.put_response(remote)?.window_size.max(1);

        let max_message = self.limits.maximum_message_size.max(MIN_MESSAGE_SIZE) as usize;
        let chunk = (max_message - PUT_OVERHEAD) as u64;
        let mut outstanding = 0u32;
        let mut eof = false;
        loop {
            while !eof && outstanding < window {
                let mut data = Vec::new();
                Read::by_ref(input).take(chunk).read_to_end(&mut data)?;
                if data.is_empty() {
                    eof = true;
                    break;
                }
                self.request(&ClientToServer::PutFileReq(PutFileReq {
                    data,
                    ..PutFileReq::default()
                }))?;
                outstanding += 1;
            }
            if outstanding == 0 {
                break;
            }
            let acknowledged = self.put_response(remote)?.acknowledge_count;
            outstanding = outstanding.saturating_sub(acknowledged);
        }

        self.request(&ClientToServer::PutFileReq(PutFileReq::default()))?;
        self.put_response(remote)?;
        Ok(())
    }

    /// Next forwarded log line. Lines received during other exchanges are
    /// returned first, in arrival order.
    pub fn next_log_entry(&mut self) -> Result<String> {
        if let Some(line) = self.logs.pop_front() {
            return Ok(line);
        }
        loop {
            match self.next_event()? {
                Event::Log(line) => return Ok(line),
                Event::Pong => {}
                Event::Message(other) => return Err(unexpected(&other)),
            }
        }
    }

    /// Waits for a [`PutFileRsp`], failing on a reported error.
    fn put_response(&mut self, remote: &str) -> Result<PutFileRsp> {
        match self.next_message()? {
            ServerToClient::PutFileRsp(rsp) if rsp.error.is_empty() => Ok(rsp),
            ServerToClient::PutFileRsp(rsp) => Err(Error::Remote {
                path: remote.to_owned(),
                error: rsp.error,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends one envelope.
    fn request(&self, msg: &ClientToServer) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        tether_proto::send(&mut *writer, MessageType::ClientToServerUser, msg)?;
        Ok(())
    }

    /// Next envelope that is not a log line; log lines are buffered and
    /// stray pongs skipped.
    fn next_message(&mut self) -> Result<ServerToClient> {
        loop {
            match self.next_event()? {
                Event::Message(msg) => return Ok(msg),
                Event::Log(line) => self.logs.push_back(line),
                Event::Pong => {}
            }
        }
    }

    /// Reads and classifies the next frame, skipping unknown envelopes.
    fn next_event(&mut self) -> Result<Event> {
        loop {
            let (kind, payload) = tether_proto::recv(&mut self.stream, MAX_PAYLOAD)?;
            match kind {
                MessageType::Pong => return Ok(Event::Pong),
                MessageType::ServerToClientUser => match tether_proto::decode_response(&payload)? {
                    Some(ServerToClient::LogEntryInd(ind)) => return Ok(Event::Log(ind.text.concat())),
                    Some(msg) => return Ok(Event::Message(msg)),
                    None => debug!("skipping unknown envelope"),
                },
                other => return Err(Error::Unexpected(format!("{other} frame"))),
            }
        }
    }
}

/// Writes one ping frame through the shared writer.
fn send_ping(writer: &Writer) -> tether_proto::Result<()> {
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    tether_proto::send_control(&mut *writer, MessageType::Ping)
}

/// Error for an envelope that does not fit the current exchange.
fn unexpected(msg: &ServerToClient) -> Error {
    let name = match msg {
        ServerToClient::ConnectRsp(_) => "ConnectRsp",
        ServerToClient::ExecuteCommandRsp(_) => "ExecuteCommandRsp",
        ServerToClient::LogEntryInd(_) => "LogEntryInd",
        ServerToClient::GetFileRsp(_) => "GetFileRsp",
        ServerToClient::PutFileRsp(_) => "PutFileRsp",
        _ => "message",
    };
    Error::Unexpected(name.to_owned())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use tether_proto::{ExecuteCommandRsp, LogEntryInd};

    use super::*;

    /// Runs `device` against one accepted connection.
    fn fake_device(device: impl FnOnce(TcpStream) + Send + 'static) -> (Client, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (kind, payload) = tether_proto::recv(&mut stream, 512).unwrap();
            assert_eq!(kind, MessageType::ClientToServerUser);
            assert!(matches!(
                tether_proto::decode_request(&payload).unwrap(),
                Some(ClientToServer::ConnectReq(_))
            ));
            reply(
                &mut stream,
                ServerToClient::ConnectRsp(ConnectRsp {
                    keep_alive_timeout: 0,
                    maximum_message_size: 512,
                }),
            );
            device(stream);
        });
        (Client::connect(addr).unwrap(), handle)
    }

    fn reply(stream: &mut TcpStream, msg: ServerToClient) {
        tether_proto::send(stream, MessageType::ServerToClientUser, &msg).unwrap();
    }

    fn log(text: &str) -> ServerToClient {
        ServerToClient::LogEntryInd(LogEntryInd {
            text: vec!["[    0.000001] ".into(), text.into()],
        })
    }

    #[test]
    fn buffers_logs_received_during_execute() {
        let (mut client, device) = fake_device(|mut stream| {
            let _ = tether_proto::recv(&mut stream, 512).unwrap();
            reply(&mut stream, log("one"));
            reply(
                &mut stream,
                ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp {
                    output: b"Today!".to_vec(),
                    error: String::new(),
                }),
            );
            reply(&mut stream, log("two"));
            reply(
                &mut stream,
                ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp::default()),
            );
            reply(&mut stream, log("three"));
        });

        assert_eq!(client.limits().maximum_message_size, 512);
        assert_eq!(client.execute("date").unwrap(), b"Today!");
        assert_eq!(client.next_log_entry().unwrap(), "[    0.000001] one");
        assert_eq!(client.next_log_entry().unwrap(), "[    0.000001] two");
        assert_eq!(client.next_log_entry().unwrap(), "[    0.000001] three");
        device.join().unwrap();
    }

    #[test]
    fn command_error_keeps_partial_output() {
        let (mut client, device) = fake_device(|mut stream| {
            let _ = tether_proto::recv(&mut stream, 512).unwrap();
            reply(
                &mut stream,
                ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp {
                    output: b"partial".to_vec(),
                    error: String::new(),
                }),
            );
            reply(
                &mut stream,
                ServerToClient::ExecuteCommandRsp(ExecuteCommandRsp {
                    output: Vec::new(),
                    error: "Exited with status 1.".into(),
                }),
            );
        });

        match client.execute("false") {
            Err(Error::Command { output, error }) => {
                assert_eq!(output, b"partial");
                assert_eq!(error, "Exited with status 1.");
            }
            other => panic!("unexpected {other:?}"),
        }
        device.join().unwrap();
    }

    #[test]
    fn ping_skips_unknown_envelopes() {
        let (mut client, device) = fake_device(|mut stream| {
            let (kind, _) = tether_proto::recv(&mut stream, 512).unwrap();
            assert_eq!(kind, MessageType::Ping);
            // An envelope variant from a newer device.
            stream
                .write_all(&tether_proto::encode_frame(MessageType::ServerToClientUser, &[9]).unwrap())
                .unwrap();
            tether_proto::send_control(&mut stream, MessageType::Pong).unwrap();
        });
        client.ping().unwrap();
        device.join().unwrap();
    }

    #[test]
    fn upload_respects_window() {
        let (mut client, device) = fake_device(|mut stream| {
            let next = |stream: &mut TcpStream| -> PutFileReq {
                let (_, payload) = tether_proto::recv(stream, 512).unwrap();
                match tether_proto::decode_request(&payload).unwrap() {
                    Some(ClientToServer::PutFileReq(req)) => req,
                    other => panic!("unexpected {other:?}"),
                }
            };
            let ack = |stream: &mut TcpStream, window_size: u32| {
                reply(
                    stream,
                    ServerToClient::PutFileRsp(PutFileRsp {
                        window_size,
                        error: String::new(),
                        acknowledge_count: 1,
                    }),
                );
            };

            let open = next(&mut stream);
            assert_eq!(open.path, "/tmp/upload");
            assert_eq!(open.size, 1000);
            ack(&mut stream, 2);

            // 1000 bytes in 496-byte chunks, at most two in flight.
            let mut received = Vec::new();
            let first = next(&mut stream);
            let second = next(&mut stream);
            assert_eq!(first.data.len(), 496);
            received.extend(first.data);
            received.extend(second.data);
            stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
            let mut byte = [0u8; 1];
            assert!(stream.read(&mut byte).is_err(), "window exceeded");
            stream.set_read_timeout(None).unwrap();

            ack(&mut stream, 0);
            let third = next(&mut stream);
            received.extend(third.data);
            ack(&mut stream, 0);
            ack(&mut stream, 0);

            let close = next(&mut stream);
            assert!(close.path.is_empty() && close.data.is_empty());
            ack(&mut stream, 0);
            assert_eq!(received, vec![5u8; 1000]);
        });

        let data = vec![5u8; 1000];
        client
            .put_file(&mut data.as_slice(), 1000, "/tmp/upload")
            .unwrap();
        device.join().unwrap();
    }

    #[test]
    fn pings_in_the_background() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let device = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = tether_proto::recv(&mut stream, 512).unwrap();
            reply(
                &mut stream,
                ServerToClient::ConnectRsp(ConnectRsp {
                    keep_alive_timeout: 1,
                    maximum_message_size: 512,
                }),
            );
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let started = std::time::Instant::now();
            for _ in 0..2 {
                let (kind, payload) = tether_proto::recv(&mut stream, 512).unwrap();
                assert_eq!(kind, MessageType::Ping);
                assert!(payload.is_empty());
            }
            assert!(started.elapsed() >= Duration::from_millis(1500));
        });

        let client = Client::connect(addr).unwrap();
        device.join().unwrap();
        drop(client);
    }
}
