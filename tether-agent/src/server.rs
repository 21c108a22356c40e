//! The readiness reactor.
//!
//! One thread owns the listener, the client registry and every client's
//! state. Readiness tokens carry the slot index, the low bits of the slot
//! generation and the source kind, so events for a recycled slot are
//! recognized as stale and dropped.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tether_proto::{ClientToServer, MessageType, ServerToClient};
use tracing::{debug, info, warn};

use crate::bridge::WorkBridge;
use crate::client::{Client, KeepAlive};
use crate::config::Config;
use crate::framer::ReadEvent;
use crate::handler::{self, Context, Outbox};
use crate::logsource::{KernelLog, LogReader, LogSource, NoLog};
use crate::registry::{ClientId, Registry};
use crate::runner::{CommandRunner, ShellRunner};
use crate::{Error, Result};

/// Listener readiness.
const LISTENER: Token = Token(0);
/// Work completions and shutdown requests.
const WAKER: Token = Token(1);
/// First token value used for client sources.
const FIRST_CLIENT: usize = 2;
/// Client sources per slot.
const SOURCES: usize = 3;
/// Bits of the token holding the slot and source.
const SLOT_BITS: u32 = 16;

/// What a client token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// The peer socket.
    Socket = 0,
    /// The keep-alive timer.
    KeepAlive = 1,
    /// The forwarded log stream.
    Log = 2,
}

/// Token for one of a client's sources.
fn token(id: ClientId, source: Source) -> Token {
    let slot = FIRST_CLIENT + id.index() * SOURCES + source as usize;
    let generation = (id.generation() & 0xFFFF) as usize;
    Token((generation << SLOT_BITS) | slot)
}

/// Splits a client token into slot index, generation bits and source.
fn decode(token: Token) -> Option<(usize, u32, Source)> {
    let slot = (token.0 & ((1 << SLOT_BITS) - 1)).checked_sub(FIRST_CLIENT)?;
    let source = match slot % SOURCES {
        0 => Source::Socket,
        1 => Source::KeepAlive,
        _ => Source::Log,
    };
    #[allow(clippy::cast_possible_truncation)]
    let generation = (token.0 >> SLOT_BITS) as u32;
    Some((slot / SOURCES, generation, source))
}

/// Readiness of one event, copied out of the event buffer.
#[derive(Debug, Clone, Copy)]
struct Ready {
    /// Event token.
    token: Token,
    /// Readable, read-closed or errored.
    readable: bool,
    /// Writable.
    writable: bool,
}

/// A decoded inbound frame.
#[derive(Debug)]
enum Inbound {
    /// Keep-alive probe.
    Ping,
    /// A request this server understands.
    Request(ClientToServer),
    /// A well-formed request with an unknown variant.
    Ignored,
    /// A payload the codec rejected.
    Invalid(tether_proto::Error),
    /// A frame type clients must not send.
    Unexpected(MessageType),
}

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    /// Checked by the run loop after every poll.
    flag: Arc<AtomicBool>,
    /// Interrupts a blocked poll.
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Asks the run loop to stop.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }
}

/// Builder for a [`Server`].
///
/// Defaults: commands run through `/bin/sh`, logs come from
/// [`Config::kernel_log`].
pub struct ServerBuilder {
    /// Tunables.
    config: Config,
    /// Command runner override.
    runner: Option<Arc<dyn CommandRunner>>,
    /// Log source override.
    log_source: Option<Box<dyn LogSource>>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("runner", &self.runner.is_some())
            .field("log_source", &self.log_source.is_some())
            .finish()
    }
}

impl ServerBuilder {
    /// Runs commands with `runner`.
    #[must_use]
    pub fn runner(mut self, runner: impl CommandRunner) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    /// Forwards logs from `source`.
    #[must_use]
    pub fn log_source(mut self, source: impl LogSource + 'static) -> Self {
        self.log_source = Some(Box::new(source));
        self
    }

    /// Validates the configuration, binds the listener and starts the
    /// worker pool.
    pub fn bind(self) -> Result<Server> {
        let Self {
            config,
            runner,
            log_source,
        } = self;
        config.validate()?;

        let addr = config
            .listen
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve(config.listen.clone()))?;
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let runner = runner.unwrap_or_else(|| Arc::new(ShellRunner::default()));
        let bridge = WorkBridge::start(
            runner,
            Arc::clone(&waker),
            config.workers,
            config.job_queue_capacity,
        )?;
        let log_source = log_source.unwrap_or_else(|| match &config.kernel_log {
            Some(path) => Box::new(KernelLog::new(path)),
            None => Box::new(NoLog),
        });
        let capacity = config.max_message_size;
        let clients = Registry::new(config.max_clients, || Client::new(capacity));

        info!(addr = %listener.local_addr()?, max_clients = config.max_clients, "listening");
        Ok(Server {
            poll,
            events: Events::with_capacity(64),
            ready: Vec::new(),
            listener: Some(listener),
            clients,
            bridge,
            log_source,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }
}

/// The device control-plane server.
pub struct Server {
    /// Readiness poller.
    poll: Poll,
    /// Event buffer.
    events: Events,
    /// Events of the current pass, copied out of `events`.
    ready: Vec<Ready>,
    /// Listening socket, `None` once stopped.
    listener: Option<TcpListener>,
    /// Client slots.
    clients: Registry<Client>,
    /// Command execution.
    bridge: WorkBridge,
    /// Per-connection log streams.
    log_source: Box<dyn LogSource>,
    /// Tunables.
    config: Config,
    /// Set by [`ShutdownHandle::shutdown`].
    shutdown: Arc<AtomicBool>,
    /// Shared with the bridge and shutdown handles.
    waker: Arc<Waker>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("connected", &self.clients.connected_len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Starts building a server.
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            runner: None,
            log_source: None,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        Ok(listener.local_addr()?)
    }

    /// Number of connected clients.
    pub const fn connected(&self) -> usize {
        self.clients.connected_len()
    }

    /// A handle that stops [`Server::run`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serves until a [`ShutdownHandle`] fires, then disconnects everyone.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_once(None)?;
        }
        info!("shutting down");
        self.stop();
        Ok(())
    }

    /// Waits up to `timeout` for readiness and handles one batch of events.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }));
        for event in &ready {
            self.handle(*event);
            self.reclaim();
        }
        self.ready = ready;
        Ok(())
    }

    /// Sends `msg` to every connected client.
    pub fn broadcast(&mut self, msg: &ServerToClient) -> Result<()> {
        let frame = tether_proto::encode_user(MessageType::ServerToClientUser, msg)?;
        for id in self.clients.connected_ids() {
            self.write_frame(id, &frame);
        }
        self.reclaim();
        Ok(())
    }

    /// Closes the listener and disconnects every client.
    pub fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        for id in self.clients.connected_ids() {
            self.disconnect(id, "server stopping");
        }
        self.reclaim();
    }

    /// Routes one readiness event.
    fn handle(&mut self, event: Ready) {
        match event.token {
            LISTENER => self.accept(),
            WAKER => self.complete(),
            token => {
                let Some((index, generation, source)) = decode(token) else {
                    return;
                };
                let Some(id) = self
                    .clients
                    .resolve(index)
                    .filter(|id| id.generation() & 0xFFFF == generation)
                else {
                    return;
                };
                match source {
                    Source::Socket => {
                        if event.writable {
                            self.flush(id);
                        }
                        if event.readable {
                            self.receive(id);
                        }
                    }
                    Source::KeepAlive => self.keep_alive(id),
                    Source::Log => self.forward_log(id),
                }
            }
        }
    }

    /// Accepts until the listener would block.
    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Takes a slot for a new peer, or turns it away.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(id) = self.clients.alloc() else {
            warn!(%peer, "client pool exhausted, dropping connection");
            return;
        };
        if let Err(e) = self.setup(id, stream, peer) {
            warn!(client = %id, %peer, error = %e, "client setup failed");
            if let Some(client) = self.clients.get_mut(id) {
                client.finish(self.poll.registry());
            }
            self.clients.release(id);
            return;
        }
        info!(client = %id, %peer, "client connected");
    }

    /// Registers the socket, keep-alive timer and log stream of a new client.
    fn setup(&mut self, id: ClientId, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %id, error = %e, "TCP_NODELAY not set");
        }
        let registry = self.poll.registry();
        let keep_alive = KeepAlive::new(self.config.keep_alive_timeout())?;
        registry.register(
            &mut SourceFd(&keep_alive.raw_fd()),
            token(id, Source::KeepAlive),
            Interest::READABLE,
        )?;
        let log = self.open_log(id);
        let registered = registry.register(&mut stream, token(id, Source::Socket), Interest::READABLE);

        let Some(client) = self.clients.get_mut(id) else {
            return Err(io::Error::other("slot vanished"));
        };
        client.attach(stream, peer, keep_alive, log);
        registered
    }

    /// Opens and registers the client's log stream, best effort.
    fn open_log(&self, id: ClientId) -> Option<LogReader> {
        let stream = match self.log_source.open() {
            Ok(stream) => stream?,
            Err(e) => {
                debug!(client = %id, error = %e, "log stream unavailable");
                return None;
            }
        };
        let reader = LogReader::new(stream);
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&reader.raw_fd()),
            token(id, Source::Log),
            Interest::READABLE,
        ) {
            debug!(client = %id, error = %e, "log stream not pollable");
            return None;
        }
        Some(reader)
    }

    /// Reads and dispatches frames until the socket would block or the
    /// client leaves the connected list.
    fn receive(&mut self, id: ClientId) {
        loop {
            let Some(client) = self.clients.connected_mut(id) else {
                return;
            };
            let Some(stream) = client.stream.as_mut() else {
                return;
            };
            let inbound = match client.framer.read_from(stream) {
                Ok(ReadEvent::Frame(header)) => match header.kind {
                    MessageType::Ping => Inbound::Ping,
                    MessageType::ClientToServerUser => {
                        match tether_proto::decode_request(client.framer.payload()) {
                            Ok(Some(request)) => Inbound::Request(request),
                            Ok(None) => Inbound::Ignored,
                            Err(e) => Inbound::Invalid(e),
                        }
                    }
                    other => Inbound::Unexpected(other),
                },
                Ok(ReadEvent::WouldBlock) => return,
                Ok(ReadEvent::Closed) => return self.disconnect(id, "peer closed"),
                Err(e) => return self.disconnect(id, e),
            };

            match inbound {
                Inbound::Ping => self.ping(id),
                Inbound::Request(request) => self.request(id, request),
                Inbound::Ignored => debug!(client = %id, "ignoring unknown request variant"),
                Inbound::Invalid(e) => return self.disconnect(id, e),
                Inbound::Unexpected(kind) => {
                    return self.disconnect(id, format_args!("unexpected {kind} frame"));
                }
            }
        }
    }

    /// Handles a timer event, disconnecting only if no ping re-armed the
    /// timer since it fired.
    fn keep_alive(&mut self, id: ClientId) {
        let expired = self
            .clients
            .connected_mut(id)
            .and_then(|client| client.keep_alive.as_ref())
            .map_or(Ok(false), KeepAlive::expired);
        match expired {
            Ok(true) => self.disconnect(id, "keep-alive expired"),
            Ok(false) => debug!(client = %id, "keep-alive re-armed before expiry was handled"),
            Err(e) => self.disconnect(id, e),
        }
    }

    /// Re-arms the keep-alive timer and answers with a pong.
    fn ping(&mut self, id: ClientId) {
        let armed = self
            .clients
            .connected_mut(id)
            .and_then(|client| client.keep_alive.as_ref())
            .map_or(Ok(()), KeepAlive::arm);
        if let Err(e) = armed {
            return self.disconnect(id, e);
        }
        self.write_frame(id, &tether_proto::frame::pong());
    }

    /// Runs a request handler and sends its replies.
    fn request(&mut self, id: ClientId, request: ClientToServer) {
        let Some(client) = self.clients.connected_mut(id) else {
            return;
        };
        let mut outbox = Outbox::new();
        let mut cx = Context {
            client: id,
            config: &self.config,
            jobs: &self.bridge,
            outbox: &mut outbox,
        };
        handler::dispatch(&mut client.session, request, &mut cx);
        self.send_all(id, outbox);
    }

    /// Delivers finished commands to their clients.
    fn complete(&mut self) {
        let finished: Vec<_> = self.bridge.completions().collect();
        for done in finished {
            if !self.clients.is_connected(done.client) {
                debug!(client = %done.client, command = %done.command, "client gone, dropping command result");
                continue;
            }
            let mut outbox = Outbox::new();
            handler::exec::completion(&done.output, self.config.output_chunk_size, &mut outbox);
            self.send_all(done.client, outbox);
        }
    }

    /// Forwards available log lines.
    fn forward_log(&mut self, id: ClientId) {
        let Some(client) = self.clients.connected_mut(id) else {
            return;
        };
        let Some(reader) = client.log.as_mut() else {
            return;
        };
        let mut lines = Vec::new();
        match reader.read_lines(&mut lines) {
            Ok(true) => {}
            Ok(false) => {
                debug!(client = %id, "log stream ended");
                client.stop_log(self.poll.registry());
            }
            Err(e) => {
                debug!(client = %id, error = %e, "log stream failed");
                client.stop_log(self.poll.registry());
            }
        }
        for line in &lines {
            if let Some(ind) = handler::log::indication(line) {
                self.send(id, &ServerToClient::LogEntryInd(ind));
            }
        }
    }

    /// Sends every message of `outbox`, stopping if the client drops.
    fn send_all(&mut self, id: ClientId, outbox: Outbox) {
        for msg in &outbox {
            if !self.clients.is_connected(id) {
                return;
            }
            self.send(id, msg);
        }
    }

    /// Encodes and sends one envelope.
    fn send(&mut self, id: ClientId, msg: &ServerToClient) {
        match tether_proto::encode_user(MessageType::ServerToClientUser, msg) {
            Ok(frame) => self.write_frame(id, &frame),
            Err(e) => warn!(client = %id, error = %e, "failed to encode response"),
        }
    }

    /// Writes a frame, queueing on backpressure.
    fn write_frame(&mut self, id: ClientId, frame: &[u8]) {
        let Some(client) = self.clients.connected_mut(id) else {
            return;
        };
        let Some(stream) = client.stream.as_mut() else {
            return;
        };
        let result = client.output.write(stream, frame).and_then(|blocked| {
            if blocked {
                self.poll.registry().reregister(
                    stream,
                    token(id, Source::Socket),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
            Ok(())
        });
        if let Err(e) = result {
            self.disconnect(id, e);
        }
    }

    /// Drains the output queue on write readiness.
    fn flush(&mut self, id: ClientId) {
        let Some(client) = self.clients.connected_mut(id) else {
            return;
        };
        if client.output.is_empty() {
            return;
        }
        let Some(stream) = client.stream.as_mut() else {
            return;
        };
        let result = client.output.flush(stream).and_then(|drained| {
            if drained {
                self.poll
                    .registry()
                    .reregister(stream, token(id, Source::Socket), Interest::READABLE)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            self.disconnect(id, e);
        }
    }

    /// Closes the socket and moves the client to pending-disconnect.
    fn disconnect(&mut self, id: ClientId, reason: impl fmt::Display) {
        let Some(client) = self.clients.connected_mut(id) else {
            return;
        };
        client.close(self.poll.registry());
        let peer = client.peer;
        self.clients.mark_pending(id);
        info!(client = %id, peer = ?peer, %reason, "client disconnecting");
    }

    /// End-of-pass cleanup: frees every pending client.
    fn reclaim(&mut self) {
        let registry = self.poll.registry();
        self.clients.reclaim(|id, client| {
            client.finish(registry);
            debug!(client = %id, "client slot released");
        });
    }
}
