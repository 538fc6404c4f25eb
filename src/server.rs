//! tokio runtime for the portal.
//!
//! One core task owns the [`Router`] and the [`Engine`] and handles every
//! event to completion. Each accepted socket gets a reader task, which forwards
//! what it reads to the core, and a writer task, which drains an unbounded
//! channel into the socket so that engine writes never block. The DNS
//! responder runs as its own task on a UDP socket.
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, UdpSocket,
    },
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    close::CloseCode,
    connection::ConnectionState,
    dns::CaptiveDns,
    engine::Engine,
    frame::Frame,
    handlers::Handlers,
    options::Options,
    router::{Dispatch, Response, Router},
    transport::{write_all, ConnectionId, Transport, TransportEvent},
    Result, WebSocketError,
};

/// Upgrade scheme served by the WebSocket engine.
pub const WEBSOCKET_SCHEME: &str = "websocket";

/// Default bound on a buffered HTTP request head.
pub const MAX_REQUEST_SIZE: usize = 4096;

const READ_CHUNK: usize = 2048;

/// Network settings of the portal.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Where the HTTP server listens.
    ///
    /// Default: `0.0.0.0:80`
    pub http_addr: SocketAddr,
    /// Where the DNS responder listens, `None` to run without it.
    ///
    /// Default: `0.0.0.0:53`
    pub dns_addr: Option<SocketAddr>,
    /// Address every DNS name resolves to.
    ///
    /// Default: `192.168.4.1`
    pub portal_ip: Ipv4Addr,
    /// Host name captive-portal probes are redirected to.
    ///
    /// Default: `picow.local`
    pub site: String,
    /// Largest HTTP request head accepted before answering 431.
    ///
    /// Default: [`MAX_REQUEST_SIZE`]
    pub max_request_size: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            dns_addr: Some(SocketAddr::from(([0, 0, 0, 0], 53))),
            portal_ip: Ipv4Addr::new(192, 168, 4, 1),
            site: "picow.local".to_string(),
            max_request_size: MAX_REQUEST_SIZE,
        }
    }
}

impl PortalConfig {
    /// Sets the HTTP listen address.
    pub fn with_http_addr(self, addr: SocketAddr) -> Self {
        Self {
            http_addr: addr,
            ..self
        }
    }

    /// Sets the DNS listen address.
    pub fn with_dns_addr(self, addr: SocketAddr) -> Self {
        Self {
            dns_addr: Some(addr),
            ..self
        }
    }

    /// Runs without the DNS responder.
    pub fn without_dns(self) -> Self {
        Self {
            dns_addr: None,
            ..self
        }
    }

    /// Sets the address every DNS answer carries.
    pub fn with_portal_ip(self, ip: Ipv4Addr) -> Self {
        Self {
            portal_ip: ip,
            ..self
        }
    }

    /// Sets the host captive-portal probes are redirected to.
    pub fn with_site(self, site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..self
        }
    }

    /// Sets the bound on a buffered request head.
    pub fn with_max_request_size(self, size: usize) -> Self {
        Self {
            max_request_size: size,
            ..self
        }
    }
}

/// Builder for a running portal.
pub struct Server {
    config: PortalConfig,
    router: Router,
    options: Options,
    handlers: Handlers,
}

impl Server {
    /// Serves `router` with the settings in `config`.
    ///
    /// The WebSocket scheme and the captive-portal redirect to `config.site`
    /// are registered on the router when the server starts.
    pub fn new(config: PortalConfig, router: Router) -> Self {
        Self {
            config,
            router,
            options: Options::default(),
            handlers: Handlers::default(),
        }
    }

    /// Replaces the WebSocket engine options.
    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    /// Registers the WebSocket callbacks.
    pub fn with_handlers(self, handlers: Handlers) -> Self {
        Self { handlers, ..self }
    }

    /// Binds the sockets and spawns the server tasks.
    pub async fn start(self) -> Result<ServerHandle> {
        let Server {
            config,
            router,
            options,
            handlers,
        } = self;

        let mut router = router.captive_portal(config.site.as_str());
        if !router.has_scheme(WEBSOCKET_SCHEME) {
            router = router.upgrade_scheme(WEBSOCKET_SCHEME);
        }

        let listener = TcpListener::bind(config.http_addr).await?;
        let local_addr = listener.local_addr()?;

        let dns_socket = match config.dns_addr {
            Some(addr) => Some(UdpSocket::bind(addr).await?),
            None => None,
        };
        let dns_addr = dns_socket.as_ref().map(UdpSocket::local_addr).transpose()?;

        #[cfg(feature = "logging")]
        log::info!("http listening on {}, dns on {:?}", local_addr, dns_addr);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let timeouts = Timeouts {
            handshake: options.handshake_timeout,
            idle: options.idle_timeout,
        };
        let core = Core {
            router,
            engine: Engine::new(options, handlers),
            transport: ChannelTransport::default(),
            pending: HashMap::new(),
            max_request_size: config.max_request_size,
        };

        tracker.spawn(core.run(command_rx, cancel.clone()));
        tracker.spawn(accept_loop(
            listener,
            commands.clone(),
            cancel.clone(),
            tracker.clone(),
            timeouts,
        ));
        if let Some(socket) = dns_socket {
            let dns = CaptiveDns::new(config.portal_ip);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(_err) = dns.serve(socket, cancel).await {
                    #[cfg(feature = "logging")]
                    log::error!("dns responder stopped: {}", _err);
                }
            });
        }
        tracker.close();

        Ok(ServerHandle {
            commands,
            cancel,
            tracker,
            local_addr,
            dns_addr,
        })
    }
}

/// Control handle of a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: UnboundedSender<Command>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
    dns_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the DNS responder is bound to.
    pub fn dns_addr(&self) -> Option<SocketAddr> {
        self.dns_addr
    }

    /// Sends `frame` to every client on `route`.
    pub fn broadcast(&self, route: impl Into<String>, frame: Frame) -> Result<()> {
        self.submit(Command::Broadcast {
            route: route.into(),
            frame,
        })
    }

    /// Sends `frame` to one client.
    pub fn send(&self, id: ConnectionId, frame: Frame) -> Result<()> {
        self.submit(Command::Send { id, frame })
    }

    /// Closes one client with `code`.
    pub fn close(&self, id: ConnectionId, code: CloseCode) -> Result<()> {
        self.submit(Command::Close { id, code })
    }

    /// Fires once shutdown was requested.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Closes every client with 1001 and waits for all tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| WebSocketError::ConnectionClosed)
    }
}

/// Work for the core task.
#[derive(Debug)]
enum Command {
    Open {
        id: ConnectionId,
        peer: SocketAddr,
        writer: UnboundedSender<Outbound>,
        /// Fired once the request head is complete.
        head_done: oneshot::Sender<()>,
    },
    Transport(TransportEvent),
    Broadcast {
        route: String,
        frame: Frame,
    },
    Send {
        id: ConnectionId,
        frame: Frame,
    },
    Close {
        id: ConnectionId,
        code: CloseCode,
    },
}

/// Work for a writer task.
#[derive(Debug)]
enum Outbound {
    Data(Bytes),
    Close,
}

/// [`Transport`] backed by the writer tasks' channels.
#[derive(Debug, Default)]
struct ChannelTransport {
    writers: HashMap<ConnectionId, UnboundedSender<Outbound>>,
}

impl ChannelTransport {
    fn attach(&mut self, id: ConnectionId, writer: UnboundedSender<Outbound>) {
        self.writers.insert(id, writer);
    }
}

impl Transport for ChannelTransport {
    fn write(&mut self, id: ConnectionId, bytes: &[u8]) -> io::Result<usize> {
        let writer = self
            .writers
            .get(&id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        writer
            .send(Outbound::Data(Bytes::copy_from_slice(bytes)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(bytes.len())
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(writer) = self.writers.remove(&id) {
            let _ = writer.send(Outbound::Close);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    handshake: Duration,
    idle: Option<Duration>,
}

/// State owned by the core task.
struct Core {
    router: Router,
    engine: Engine,
    transport: ChannelTransport,
    /// Connections still speaking HTTP.
    pending: HashMap<ConnectionId, PendingRequest>,
    max_request_size: usize,
}

/// A request head being accumulated.
#[derive(Debug, Default)]
struct PendingRequest {
    buf: BytesMut,
    head_done: Option<oneshot::Sender<()>>,
}

impl Core {
    async fn run(mut self, mut commands: UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }

        let clients: Vec<_> = self.engine.registry().iter().map(|entry| entry.id).collect();
        for id in clients {
            self.close(id, CloseCode::Away);
        }

        #[cfg(feature = "logging")]
        log::debug!("core stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Open {
                id,
                peer,
                writer,
                head_done,
            } => {
                self.transport.attach(id, writer);
                self.on_event(TransportEvent::Open {
                    id,
                    peer: Some(peer),
                });
                if let Some(pending) = self.pending.get_mut(&id) {
                    pending.head_done = Some(head_done);
                }
            }
            Command::Transport(event) => self.on_event(event),
            Command::Broadcast { route, frame } => {
                self.engine.broadcast(&mut self.transport, &route, &frame);
            }
            Command::Send { id, frame } => {
                if let Err(_err) = self.engine.send(&mut self.transport, id, &frame) {
                    #[cfg(feature = "logging")]
                    log::debug!("send to {} failed: {}", id, _err);
                }
            }
            Command::Close { id, code } => self.close(id, code),
        }
    }

    fn close(&mut self, id: ConnectionId, code: CloseCode) {
        if let Err(_err) = self.engine.close(&mut self.transport, id, code) {
            #[cfg(feature = "logging")]
            log::debug!("close of {} failed: {}", id, _err);
        }
    }

    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open { id, peer } => {
                #[cfg(feature = "logging")]
                log::debug!("{} accepted from {:?}", id, peer);
                self.engine.accept(id, peer);
                self.pending.insert(id, PendingRequest::default());
            }
            TransportEvent::Data { id, bytes } => match self.engine.state(id) {
                ConnectionState::AwaitingUpgrade => self.on_request_bytes(id, &bytes),
                ConnectionState::Open | ConnectionState::Closing => {
                    if let Err(_err) = self.engine.on_data(&mut self.transport, id, &bytes) {
                        #[cfg(feature = "logging")]
                        log::debug!("{}: {}", id, _err);
                    }
                }
                ConnectionState::Closed => {}
            },
            TransportEvent::End { id } => {
                self.pending.remove(&id);
                self.engine.on_end(&mut self.transport, id);
                self.engine.compact();
            }
        }
    }

    fn on_request_bytes(&mut self, id: ConnectionId, bytes: &[u8]) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        pending.buf.extend_from_slice(bytes);

        let Some(end) = head_end(&pending.buf) else {
            if pending.buf.len() > self.max_request_size {
                self.respond(id, Response::new(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
            }
            return;
        };

        let Some(PendingRequest { mut buf, head_done }) = self.pending.remove(&id) else {
            return;
        };
        if let Some(head_done) = head_done {
            let _ = head_done.send(());
        }
        let head = buf.split_to(end);
        let request = String::from_utf8_lossy(&head).into_owned();

        let response = match self.router.dispatch(&request) {
            Dispatch::Upgrade(scheme) if scheme == WEBSOCKET_SCHEME => None,
            Dispatch::Upgrade(_) => Some(Response::new(StatusCode::NOT_IMPLEMENTED)),
            Dispatch::Respond(response) => Some(response),
        };
        if let Some(response) = response {
            self.respond(id, response);
            return;
        }

        if let Err(_err) = self.engine.upgrade(&mut self.transport, id, &request) {
            #[cfg(feature = "logging")]
            log::debug!("{}: handshake failed: {}", id, _err);
            self.respond(id, Response::bad_request());
            return;
        }

        // frames pipelined behind the handshake
        if !buf.is_empty() {
            if let Err(_err) = self.engine.on_data(&mut self.transport, id, &buf) {
                #[cfg(feature = "logging")]
                log::debug!("{}: {}", id, _err);
            }
        }
    }

    /// Writes a plain HTTP response and closes the connection.
    fn respond(&mut self, id: ConnectionId, response: Response) {
        #[cfg(feature = "logging")]
        log::debug!("{} <- {}", id, response.status);

        if let Err(_err) = write_all(&mut self.transport, id, &response.to_bytes()) {
            #[cfg(feature = "logging")]
            log::debug!("{}: response not sent: {}", id, _err);
        }
        self.transport.close(id);
        self.pending.remove(&id);
        self.engine.forget(id);
    }
}

/// Offset just past the blank line ending a request head.
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

async fn accept_loop(
    listener: TcpListener,
    commands: UnboundedSender<Command>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    timeouts: Timeouts,
) {
    let mut next_id = 0u64;
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(_err) => {
                    #[cfg(feature = "logging")]
                    log::warn!("accept failed: {}", _err);
                    continue;
                }
            },
        };

        let accepted_at = Instant::now();
        next_id += 1;
        let id = ConnectionId(next_id);
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (head_tx, head_rx) = oneshot::channel();

        if commands
            .send(Command::Open {
                id,
                peer,
                writer: out_tx,
                head_done: head_tx,
            })
            .is_err()
        {
            break;
        }

        let conn_cancel = cancel.child_token();
        tracker.spawn(write_loop(writer, out_rx, conn_cancel.clone()));
        let deadline = accepted_at + timeouts.handshake;
        tracker.spawn(read_loop(
            id,
            reader,
            commands.clone(),
            conn_cancel,
            timeouts,
            Handshake {
                deadline,
                done: head_rx,
            },
        ));
    }
}

/// Bound on receiving the request head, counted from accept.
#[derive(Debug)]
struct Handshake {
    deadline: Instant,
    done: oneshot::Receiver<()>,
}

/// Forwards socket reads to the core.
///
/// Until the core reports the request head complete, every read is bounded by
/// the handshake deadline. After that each read gets the idle timeout, if any.
async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    commands: UnboundedSender<Command>,
    cancel: CancellationToken,
    timeouts: Timeouts,
    mut handshake: Handshake,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut deadline = Some(handshake.deadline);

    loop {
        buf.reserve(READ_CHUNK);
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            // a dropped sender means the core is done with the head as well
            _ = &mut handshake.done, if deadline.is_some() => {
                deadline = None;
                continue;
            }
            res = read_some(&mut reader, &mut buf, deadline, timeouts.idle) => res,
        };

        match res {
            Ok(0) => break,
            Ok(_) => {
                let event = TransportEvent::Data {
                    id,
                    bytes: buf.split().freeze(),
                };
                if commands.send(Command::Transport(event)).is_err() {
                    return;
                }
            }
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("{}: read failed: {}", id, _err);
                break;
            }
        }
    }

    let _ = commands.send(Command::Transport(TransportEvent::End { id }));
}

/// One read, bounded by `deadline` when set, by `idle` otherwise.
async fn read_some(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
    idle: Option<Duration>,
) -> io::Result<usize> {
    let deadline = deadline.or_else(|| idle.map(|idle| Instant::now() + idle));
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, reader.read_buf(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
        None => reader.read_buf(buf).await,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Data(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
}
