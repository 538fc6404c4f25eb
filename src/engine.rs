//! The engine context.
//!
//! [`Engine`] owns everything the WebSocket layer keeps between events: the
//! options, the callback table, the client registry and one [`Connection`] per
//! live transport connection. Every operation takes the engine by `&mut` and
//! the transport as an argument, so one owner drives it to completion for each
//! event and nothing is shared behind its back.
use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;

use crate::{
    close::CloseCode,
    connection::{Connection, ConnectionState, Disposition},
    frame::Frame,
    handlers::{Event, Handlers, Outbox, Outgoing},
    handshake,
    options::Options,
    registry::{BroadcastReport, ClientRegistry},
    transport::{write_all, ConnectionId, Transport},
    Result, WebSocketError,
};

/// WebSocket engine state.
///
/// ```rust
/// use wsportal::{ConnectionId, Engine, Handlers, MemoryTransport, Options};
///
/// let handlers = Handlers::new().on_text(|out, text| out.send_text(text.to_vec()));
/// let mut engine = Engine::new(Options::default(), handlers);
/// let mut transport = MemoryTransport::new();
///
/// let id = ConnectionId(1);
/// engine.accept(id, None);
/// engine
///     .upgrade(
///         &mut transport,
///         id,
///         "GET /echo HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
///     )
///     .unwrap();
/// assert_eq!(engine.route_of(id), Some("/echo"));
/// ```
#[derive(Debug)]
pub struct Engine {
    options: Options,
    handlers: Handlers,
    registry: ClientRegistry,
    connections: HashMap<ConnectionId, Connection>,
}

impl Engine {
    /// Creates an engine with no connections.
    ///
    /// `handlers` are fixed for the engine's lifetime.
    pub fn new(options: Options, handlers: Handlers) -> Self {
        Self {
            options,
            handlers,
            registry: ClientRegistry::new(),
            connections: HashMap::new(),
        }
    }

    /// The options the engine was created with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Upgraded clients and their routes.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Starts tracking a freshly accepted connection.
    pub fn accept(&mut self, id: ConnectionId, peer: Option<SocketAddr>) {
        self.connections.insert(id, Connection::new(id, peer));
    }

    /// Completes the WebSocket handshake for `id`.
    ///
    /// On success the 101 response is written, the client is registered on the
    /// request-line path and `on_upgrade` runs. On failure nothing is written;
    /// the caller decides what happens to the connection.
    pub fn upgrade<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: ConnectionId,
        request: &str,
    ) -> Result<()> {
        let conn = self
            .connections
            .entry(id)
            .or_insert_with(|| Connection::new(id, None));
        if conn.state() != ConnectionState::AwaitingUpgrade {
            return Err(WebSocketError::InvalidRequest("connection already upgraded"));
        }

        let route = handshake::request_route(request)
            .ok_or(WebSocketError::InvalidRequest("malformed request line"))?
            .to_string();
        handshake::perform_handshake(transport, id, request, self.options.max_key_len)?;

        #[cfg(feature = "logging")]
        log::debug!("{} joined {}", id, route);

        self.registry.add(id, route.as_str());
        conn.open(route);

        let mut queue = Vec::new();
        let mut outbox = Outbox::new(id, conn.route(), conn.peer_addr(), &mut queue);
        self.handlers.handle(Event::Upgrade, &mut outbox);
        self.flush(transport, queue);

        Ok(())
    }

    /// Feeds bytes received on an upgraded connection.
    ///
    /// Every complete frame in the buffer is dispatched in order. Dispatch
    /// stops at the first frame that closes the connection; whatever follows
    /// is discarded. A frame over the size limit tears the connection down
    /// without a Close frame and fails with `ResourceLimitExceeded`.
    pub fn on_data<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: ConnectionId,
        bytes: &[u8],
    ) -> Result<Disposition> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(WebSocketError::UnknownConnection)?;
        match conn.state() {
            ConnectionState::Open => conn.feed(bytes),
            ConnectionState::AwaitingUpgrade => {
                return Err(WebSocketError::InvalidRequest("connection not upgraded"))
            }
            ConnectionState::Closing | ConnectionState::Closed => return Ok(Disposition::Close),
        }

        let mut disposition = Disposition::Continue;
        loop {
            let conn = self
                .connections
                .get_mut(&id)
                .ok_or(WebSocketError::UnknownConnection)?;

            let next = match conn.next_frame(self.options.max_frame_size) {
                Ok(next) => next,
                Err(err) => {
                    #[cfg(feature = "logging")]
                    log::warn!("{}: {}, dropping connection", id, err);
                    self.terminate(transport, id);
                    return Err(err);
                }
            };
            let Some((header, raw)) = next else {
                break;
            };

            let mut queue = Vec::new();
            disposition =
                conn.dispatch(&header, &raw, &mut self.handlers, &self.options, &mut queue);
            self.flush(transport, queue);

            if disposition == Disposition::Close {
                break;
            }
        }

        Ok(disposition)
    }

    /// The transport reported end of stream. Forgets the connection.
    pub fn on_end<T: Transport + ?Sized>(&mut self, transport: &mut T, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        #[cfg(feature = "logging")]
        log::debug!("{} ended in state {:?}", id, conn.state());

        self.registry.remove(id);
        if !conn.close_sent() {
            transport.close(id);
        }
    }

    /// Sends `frame` to one open client.
    pub fn send<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: ConnectionId,
        frame: &Frame,
    ) -> Result<()> {
        let conn = self
            .connections
            .get(&id)
            .ok_or(WebSocketError::UnknownConnection)?;
        if !conn.can_send() {
            return Err(WebSocketError::ConnectionClosed);
        }

        write_all(transport, id, &frame.encode(self.options.mask_outgoing))
    }

    /// Sends `frame` to every client on `route`.
    pub fn broadcast<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        route: &str,
        frame: &Frame,
    ) -> BroadcastReport {
        self.registry
            .broadcast(transport, route, frame, self.options.mask_outgoing)
    }

    /// Serializes `value` and broadcasts it as a text frame.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn broadcast_json<T: Transport + ?Sized, V: serde::Serialize>(
        &self,
        transport: &mut T,
        route: &str,
        value: &V,
    ) -> Result<BroadcastReport> {
        let text = serde_json::to_vec(value)?;
        Ok(self.broadcast(transport, route, &Frame::text(text)))
    }

    /// Closes a client with `code` and requests teardown.
    pub fn close<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: ConnectionId,
        code: CloseCode,
    ) -> Result<()> {
        self.close_with(transport, id, Bytes::copy_from_slice(&code.to_bytes()))
    }

    /// Route the client upgraded on.
    pub fn route_of(&self, id: ConnectionId) -> Option<&str> {
        self.registry.find_route(id)
    }

    /// Remote address recorded when the connection was accepted.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).and_then(Connection::peer_addr)
    }

    /// Lifecycle state; `Closed` once the connection is forgotten.
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .get(&id)
            .map_or(ConnectionState::Closed, Connection::state)
    }

    /// Number of tracked connections, upgraded or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drops a connection without writing anything.
    pub fn forget(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        self.registry.remove(id);
    }

    /// Reclaims registry tombstones.
    pub fn compact(&mut self) {
        self.registry.compact();
    }

    fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T, queue: Vec<Outgoing>) {
        for item in queue {
            let res = match item {
                Outgoing::Send(id, frame) => self.send(transport, id, &frame),
                Outgoing::Broadcast(route, frame) => {
                    self.broadcast(transport, &route, &frame);
                    Ok(())
                }
                Outgoing::Close { id, payload } => self.close_with(transport, id, payload),
            };

            if let Err(_err) = res {
                #[cfg(feature = "logging")]
                log::warn!("dropped outgoing frame: {}", _err);
            }
        }
    }

    fn close_with<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: ConnectionId,
        payload: Bytes,
    ) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(WebSocketError::UnknownConnection)?;
        if conn.close_sent() {
            return Ok(());
        }

        let res = match conn.state() {
            ConnectionState::Open | ConnectionState::Closing => write_all(
                transport,
                id,
                &Frame::close_raw(payload).encode(self.options.mask_outgoing),
            ),
            _ => Ok(()),
        };
        conn.mark_close_sent();
        conn.set_state(ConnectionState::Closing);

        self.registry.remove(id);
        transport.close(id);
        res
    }

    /// Tears a connection down without a Close frame.
    fn terminate<T: Transport + ?Sized>(&mut self, transport: &mut T, id: ConnectionId) {
        self.connections.remove(&id);
        self.registry.remove(id);
        transport.close(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn upgrade_request(path: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            path
        )
    }

    #[test]
    fn test_upgrade_fires_callback() {
        let handlers = Handlers::new().on_upgrade(|out, _| {
            let greeting = format!("welcome to {}", out.route().unwrap_or("?"));
            out.send_text(greeting);
        });
        let mut engine = Engine::new(Options::default(), handlers);
        let mut transport = MemoryTransport::new();
        let id = ConnectionId(1);

        engine.accept(id, None);
        engine.upgrade(&mut transport, id, &upgrade_request("/status")).unwrap();

        assert_eq!(engine.state(id), ConnectionState::Open);
        assert_eq!(transport.frames_to(id), vec![Frame::text("welcome to /status")]);
        assert!(engine.upgrade(&mut transport, id, &upgrade_request("/status")).is_err());
    }

    #[test]
    fn test_data_before_upgrade_rejected() {
        let mut engine = Engine::new(Options::default(), Handlers::new());
        let mut transport = MemoryTransport::new();

        engine.accept(ConnectionId(1), None);
        assert!(matches!(
            engine.on_data(&mut transport, ConnectionId(1), b"x"),
            Err(WebSocketError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.on_data(&mut transport, ConnectionId(2), b"x"),
            Err(WebSocketError::UnknownConnection)
        ));
    }

    #[test]
    fn test_server_close() {
        let mut engine = Engine::new(Options::default(), Handlers::new());
        let mut transport = MemoryTransport::new();
        let id = ConnectionId(4);

        engine.accept(id, None);
        engine.upgrade(&mut transport, id, &upgrade_request("/")).unwrap();
        engine.close(&mut transport, id, CloseCode::Away).unwrap();
        engine.close(&mut transport, id, CloseCode::Away).unwrap();

        assert_eq!(transport.frames_to(id), vec![Frame::close(CloseCode::Away, "")]);
        assert_eq!(transport.close_count(id), 1);
        assert_eq!(engine.route_of(id), None);
        assert!(matches!(
            engine.send(&mut transport, id, &Frame::text("late")),
            Err(WebSocketError::ConnectionClosed)
        ));

        engine.on_end(&mut transport, id);
        assert_eq!(engine.state(id), ConnectionState::Closed);
        assert_eq!(transport.close_count(id), 1);
    }
}
