//! The transport seam.
//!
//! The engine never reads from a socket. Whatever owns the sockets pushes
//! [`TransportEvent`]s in and receives writes and close requests through the
//! [`Transport`] trait. Writes are submit-and-return: an implementation queues
//! the bytes and reports how many it accepted, it never blocks.
use std::{collections::HashSet, fmt, io, net::SocketAddr};

use bytes::Bytes;

use crate::{frame, Result, WebSocketError};

/// Opaque identifier of a transport-level connection.
///
/// Stable for the lifetime of the connection. Identifiers are handed out by
/// the transport; the engine never invents or reuses them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound half of a transport.
pub trait Transport {
    /// Queues `bytes` for `id`, returning how many bytes were accepted.
    fn write(&mut self, id: ConnectionId, bytes: &[u8]) -> io::Result<usize>;

    /// Requests teardown of `id` once queued writes are flushed.
    fn close(&mut self, id: ConnectionId);
}

/// Inbound events pushed by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection was accepted.
    Open {
        id: ConnectionId,
        peer: Option<SocketAddr>,
    },
    /// Bytes arrived on a connection.
    Data { id: ConnectionId, bytes: Bytes },
    /// The peer finished sending, or the connection failed.
    End { id: ConnectionId },
}

/// Writes all of `bytes` or fails with [`WebSocketError::TransportFailure`].
///
/// A short write counts as a failure: a frame that is only partly queued would
/// desynchronize the peer's decoder.
pub(crate) fn write_all<T: Transport + ?Sized>(
    transport: &mut T,
    id: ConnectionId,
    bytes: &[u8],
) -> Result<()> {
    match transport.write(id, bytes) {
        Ok(n) if n == bytes.len() => Ok(()),
        Ok(n) => Err(WebSocketError::TransportFailure(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", n, bytes.len()),
        ))),
        Err(err) => Err(WebSocketError::TransportFailure(err)),
    }
}

/// In-memory transport that records every write and close request.
///
/// Handy for driving an [`Engine`](crate::Engine) deterministically.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    writes: Vec<(ConnectionId, Bytes)>,
    closed: Vec<ConnectionId>,
    failing: HashSet<ConnectionId>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future write to `id` fail with `BrokenPipe`.
    pub fn fail_writes_to(&mut self, id: ConnectionId) {
        self.failing.insert(id);
    }

    /// Every accepted write to `id`, in order.
    pub fn writes_to(&self, id: ConnectionId) -> Vec<Bytes> {
        self.writes
            .iter()
            .filter(|(to, _)| *to == id)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// The writes to `id` that are complete WebSocket frames, decoded.
    ///
    /// HTTP responses written during the handshake are skipped.
    pub fn frames_to(&self, id: ConnectionId) -> Vec<frame::Frame> {
        self.writes_to(id)
            .into_iter()
            .filter(|bytes| !bytes.starts_with(b"HTTP/"))
            .filter_map(|bytes| {
                let mut raw = bytes.to_vec();
                let header = frame::parse(&mut raw)?;
                if header.frame_len() != raw.len() as u64 {
                    return None;
                }
                let opcode = header.opcode().ok()?;
                Some(frame::Frame::new(
                    opcode,
                    Bytes::copy_from_slice(header.payload(&raw)),
                ))
            })
            .collect()
    }

    /// Whether teardown of `id` was requested.
    pub fn is_closed(&self, id: ConnectionId) -> bool {
        self.closed.contains(&id)
    }

    /// Number of close requests issued for `id`.
    pub fn close_count(&self, id: ConnectionId) -> usize {
        self.closed.iter().filter(|closed| **closed == id).count()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.closed.clear();
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, id: ConnectionId, bytes: &[u8]) -> io::Result<usize> {
        if self.failing.contains(&id) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        self.writes.push((id, Bytes::copy_from_slice(bytes)));
        Ok(bytes.len())
    }

    fn close(&mut self, id: ConnectionId) {
        self.closed.push(id);
    }
}
