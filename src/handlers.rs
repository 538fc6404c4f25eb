//! Application callbacks and the outbox they write to.
//!
//! Callbacks run while the engine is in the middle of processing a frame, so
//! they cannot touch the transport or the engine. They queue [`Outgoing`] work
//! on an [`Outbox`] instead; the engine flushes it once the callback returns.
use std::{fmt, net::SocketAddr};

use bytes::Bytes;

use crate::{close::CloseCode, frame::Frame, transport::ConnectionId};

/// Something that happened on an upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The handshake completed.
    Upgrade,
    /// A text frame arrived.
    Text(&'a [u8]),
    /// A ping arrived. The pong has already been queued.
    Ping(&'a [u8]),
    /// A pong arrived.
    Pong(&'a [u8]),
    /// The peer sent a Close frame. The reply is queued after the callback.
    Close(&'a [u8]),
}

/// Work queued by a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A frame for one client.
    Send(ConnectionId, Frame),
    /// A frame for every client on a route.
    Broadcast(String, Frame),
    /// Close a client with this Close frame payload.
    Close { id: ConnectionId, payload: Bytes },
}

/// Per-event view handed to a callback.
pub struct Outbox<'a> {
    id: ConnectionId,
    route: Option<&'a str>,
    peer: Option<SocketAddr>,
    queue: &'a mut Vec<Outgoing>,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(
        id: ConnectionId,
        route: Option<&'a str>,
        peer: Option<SocketAddr>,
        queue: &'a mut Vec<Outgoing>,
    ) -> Self {
        Self {
            id,
            route,
            peer,
            queue,
        }
    }

    /// The connection the event happened on.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The route the connection upgraded on.
    pub fn route(&self) -> Option<&str> {
        self.route
    }

    /// The remote address, when the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Replies on this connection.
    pub fn send(&mut self, frame: Frame) {
        self.queue.push(Outgoing::Send(self.id, frame));
    }

    /// Replies on this connection with a text frame.
    pub fn send_text(&mut self, text: impl Into<Bytes>) {
        self.send(Frame::text(text));
    }

    /// Sends to another client.
    pub fn send_to(&mut self, id: ConnectionId, frame: Frame) {
        self.queue.push(Outgoing::Send(id, frame));
    }

    /// Sends to every client on `route`, this one included if it matches.
    pub fn broadcast(&mut self, route: impl Into<String>, frame: Frame) {
        self.queue.push(Outgoing::Broadcast(route.into(), frame));
    }

    /// Closes this connection with `code`.
    pub fn close(&mut self, code: CloseCode) {
        self.queue.push(Outgoing::Close {
            id: self.id,
            payload: Bytes::copy_from_slice(&code.to_bytes()),
        });
    }

    /// Serializes `value` and replies with it as a text frame.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&mut self, value: &T) -> crate::Result<()> {
        let text = serde_json::to_vec(value)?;
        self.send(Frame::text(text));
        Ok(())
    }
}

/// A registered callback.
pub type Callback = Box<dyn FnMut(&mut Outbox<'_>, &[u8]) + Send>;

/// At most one callback per event kind, registered before serving.
///
/// ```rust
/// use wsportal::Handlers;
///
/// let handlers = Handlers::new()
///     .on_upgrade(|out, _| out.send_text("welcome"))
///     .on_text(|out, text| {
///         let reversed: Vec<u8> = text.iter().rev().copied().collect();
///         out.send_text(reversed);
///     });
/// ```
#[derive(Default)]
pub struct Handlers {
    on_upgrade: Option<Callback>,
    on_text: Option<Callback>,
    on_ping: Option<Callback>,
    on_pong: Option<Callback>,
    on_close: Option<Callback>,
}

impl Handlers {
    /// An empty table: every event is ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the handshake succeeded, with an empty payload.
    pub fn on_upgrade<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Outbox<'_>, &[u8]) + Send + 'static,
    {
        Self {
            on_upgrade: Some(Box::new(f)),
            ..self
        }
    }

    /// Called with the payload of every text frame.
    pub fn on_text<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Outbox<'_>, &[u8]) + Send + 'static,
    {
        Self {
            on_text: Some(Box::new(f)),
            ..self
        }
    }

    /// Called after the automatic pong was queued.
    pub fn on_ping<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Outbox<'_>, &[u8]) + Send + 'static,
    {
        Self {
            on_ping: Some(Box::new(f)),
            ..self
        }
    }

    /// Called with the payload of every pong.
    pub fn on_pong<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Outbox<'_>, &[u8]) + Send + 'static,
    {
        Self {
            on_pong: Some(Box::new(f)),
            ..self
        }
    }

    /// Called with the Close payload before the close reply is queued.
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Outbox<'_>, &[u8]) + Send + 'static,
    {
        Self {
            on_close: Some(Box::new(f)),
            ..self
        }
    }

    /// Runs the callback registered for `event`, if any.
    pub(crate) fn handle(&mut self, event: Event<'_>, outbox: &mut Outbox<'_>) {
        let (slot, payload) = match event {
            Event::Upgrade => (&mut self.on_upgrade, &[][..]),
            Event::Text(payload) => (&mut self.on_text, payload),
            Event::Ping(payload) => (&mut self.on_ping, payload),
            Event::Pong(payload) => (&mut self.on_pong, payload),
            Event::Close(payload) => (&mut self.on_close, payload),
        };

        if let Some(callback) = slot {
            callback(outbox, payload);
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_upgrade", &self.on_upgrade.is_some())
            .field("on_text", &self.on_text.is_some())
            .field("on_ping", &self.on_ping.is_some())
            .field("on_pong", &self.on_pong.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
