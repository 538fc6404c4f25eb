//! Per-connection state machine.
//!
//! A [`Connection`] owns the reassembly buffer of one socket. Bytes are fed in
//! as they arrive, complete frames are cut off the front of the buffer and
//! dispatched to the application callbacks. Control replies are not written
//! here; they are queued as [`Outgoing`] work for the engine to flush.
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::{
    close::CloseCode,
    frame::{self, Frame, FrameHeader, OpCode},
    handlers::{Event, Handlers, Outbox, Outgoing},
    options::{CloseReply, Options},
    transport::ConnectionId,
    Result, WebSocketError,
};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, still speaking HTTP.
    AwaitingUpgrade,
    /// Handshake done, frames flow.
    Open,
    /// A Close frame was exchanged, teardown requested.
    Closing,
    /// Gone.
    Closed,
}

/// What the caller should do after a frame was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep processing frames.
    Continue,
    /// Stop: the connection is closing and further frames are discarded.
    Close,
}

/// One transport connection as seen by the engine.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    route: Option<String>,
    peer: Option<SocketAddr>,
    buf: BytesMut,
    close_sent: bool,
}

impl Connection {
    /// A freshly accepted connection, still speaking HTTP.
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            state: ConnectionState::AwaitingUpgrade,
            route: None,
            peer,
            buf: BytesMut::new(),
            close_sent: false,
        }
    }

    /// Transport identifier of the connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Path requested at upgrade time, `None` before the handshake.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Remote address, when the transport reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether our Close frame went out already.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Moves to `Open` after a successful handshake.
    pub(crate) fn open(&mut self, route: impl Into<String>) {
        self.route = Some(route.into());
        self.state = ConnectionState::Open;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn mark_close_sent(&mut self) {
        self.close_sent = true;
    }

    /// Whether a data frame may still be written to this connection.
    pub(crate) fn can_send(&self) -> bool {
        match self.state {
            ConnectionState::Open => true,
            ConnectionState::Closing => !self.close_sent,
            _ => false,
        }
    }

    /// Appends inbound bytes to the reassembly buffer.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Cuts the next complete frame off the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. A frame declaring more than
    /// `max_frame_size` bytes, or a buffer that outgrew it, fails with
    /// [`WebSocketError::ResourceLimitExceeded`] before the payload is read.
    pub(crate) fn next_frame(
        &mut self,
        max_frame_size: usize,
    ) -> Result<Option<(FrameHeader, BytesMut)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if let Some(head) = frame::decode_head(&self.buf) {
            if !head.has_valid_length() || head.frame_len() > max_frame_size as u64 {
                return Err(WebSocketError::ResourceLimitExceeded {
                    limit: max_frame_size,
                });
            }
        }

        match frame::parse(&mut self.buf) {
            Some(header) => {
                let raw = self.buf.split_to(header.frame_len() as usize);
                Ok(Some((header, raw)))
            }
            None if self.buf.len() > max_frame_size => Err(WebSocketError::ResourceLimitExceeded {
                limit: max_frame_size,
            }),
            None => Ok(None),
        }
    }

    /// Runs one decoded frame through the callbacks.
    pub(crate) fn dispatch(
        &mut self,
        header: &FrameHeader,
        raw: &[u8],
        handlers: &mut Handlers,
        options: &Options,
        queue: &mut Vec<Outgoing>,
    ) -> Disposition {
        if self.state != ConnectionState::Open {
            return Disposition::Close;
        }

        let payload = header.payload(raw);
        let opcode = match header.opcode() {
            Ok(opcode) => opcode,
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("{}: ignoring frame: {}", self.id, _err);
                return Disposition::Continue;
            }
        };

        let mut outbox = Outbox::new(self.id, self.route.as_deref(), self.peer, queue);

        match opcode {
            OpCode::Text => {
                if options.check_utf8 && !is_utf8(payload) {
                    #[cfg(feature = "logging")]
                    log::debug!("{}: {}", self.id, WebSocketError::InvalidUTF8);
                    outbox.close(CloseCode::Invalid);
                    self.state = ConnectionState::Closing;
                    return Disposition::Close;
                }
                handlers.handle(Event::Text(payload), &mut outbox);
            }
            OpCode::Ping => {
                outbox.send(Frame::pong(Bytes::copy_from_slice(payload)));
                handlers.handle(Event::Ping(payload), &mut outbox);
            }
            OpCode::Pong => handlers.handle(Event::Pong(payload), &mut outbox),
            OpCode::Close => {
                handlers.handle(Event::Close(payload), &mut outbox);
                queue.push(Outgoing::Close {
                    id: self.id,
                    payload: close_reply(options.close_reply, payload),
                });
                self.state = ConnectionState::Closing;
                return Disposition::Close;
            }
            OpCode::Continuation | OpCode::Binary => {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{}: ignoring {:?} frame of {} bytes",
                    self.id,
                    opcode,
                    payload.len()
                );
            }
        }

        Disposition::Continue
    }
}

/// Payload of the Close frame answering a peer's Close.
fn close_reply(policy: CloseReply, payload: &[u8]) -> Bytes {
    match policy {
        CloseReply::EchoCode => match CloseCode::from_payload(payload) {
            Some(code) if code.is_allowed() => Bytes::copy_from_slice(&code.to_bytes()),
            _ => Bytes::new(),
        },
        CloseReply::Empty => Bytes::new(),
    }
}

fn is_utf8(payload: &[u8]) -> bool {
    #[cfg(not(feature = "simd"))]
    return std::str::from_utf8(payload).is_ok();
    #[cfg(feature = "simd")]
    return simdutf8::basic::from_utf8(payload).is_ok();
}
