//! # wsportal
//! A captive-portal network stack: a catch-all DNS responder, a small HTTP
//! router with pluggable upgrade schemes, and an RFC 6455 WebSocket engine.
//!
//! The WebSocket layer is event driven. A transport pushes connection events
//! into an [`Engine`], which reassembles frames, answers control frames, runs
//! the application callbacks and writes through the [`Transport`] trait. The
//! [`server`] module wires the engine, the router and the DNS responder onto
//! tokio sockets.
//!
//! # Features
//! - `logging`: debug logging of handshakes, frames and connection teardown
//!   through the `log` crate. Enabled by default.
//! - `simd`: SIMD-accelerated UTF-8 validation of text frames.
//! - `json`: send `serde` values as JSON text frames.
//!
//! # Engine Example
//! ```rust
//! use wsportal::{frame::Frame, ConnectionId, Engine, Handlers, MemoryTransport, Options};
//!
//! let handlers = Handlers::new().on_text(|out, text| {
//!     let reversed: Vec<u8> = text.iter().rev().copied().collect();
//!     out.send_text(reversed);
//! });
//!
//! let mut engine = Engine::new(Options::default(), handlers);
//! let mut transport = MemoryTransport::new();
//! let id = ConnectionId(1);
//!
//! engine.accept(id, None);
//! engine
//!     .upgrade(
//!         &mut transport,
//!         id,
//!         "GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
//!     )
//!     .unwrap();
//! engine
//!     .on_data(&mut transport, id, &Frame::text("abc").encode(true))
//!     .unwrap();
//!
//! assert_eq!(transport.frames_to(id), vec![Frame::text("cba")]);
//! ```
//!
//! # Server Example
//! ```rust,no_run
//! use wsportal::{router::{Response, Router}, server::{PortalConfig, Server}, Handlers, Options};
//!
//! #[tokio::main]
//! async fn main() -> wsportal::Result<()> {
//!     let router = Router::new().route("/", |_| Response::html("<h1>portal</h1>"));
//!
//!     let handle = Server::new(PortalConfig::default(), router)
//!         .with_options(Options::default())
//!         .with_handlers(Handlers::new().on_text(|out, text| out.send_text(text.to_vec())))
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod connection;
pub mod dns;
pub mod engine;
pub mod frame;
pub mod handlers;
pub mod handshake;
mod mask;
pub mod options;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

use thiserror::Error;

pub use close::CloseCode;
pub use connection::{ConnectionState, Disposition};
pub use engine::Engine;
pub use frame::{Frame, OpCode};
pub use handlers::{Event, Handlers, Outbox};
pub use options::{CloseReply, Options};
pub use registry::{BroadcastReport, ClientRegistry};
pub use transport::{ConnectionId, MemoryTransport, Transport, TransportEvent};

/// A result type for engine operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors raised by the codec, the handshake and the engine.
///
/// Needing more bytes is not an error: decoders return `None` (or `Ok(None)`)
/// until a whole frame is buffered. Nothing here is fatal to the process; the
/// worst outcome is losing a single connection.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The destination buffer cannot hold the encoded frame.
    #[error("buffer too small: {needed} bytes needed, {capacity} available")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The upgrade request is missing the key or is otherwise unusable.
    /// Nothing has been written to the connection.
    #[error("invalid upgrade request: {0}")]
    InvalidRequest(&'static str),

    /// A frame exceeded the configured maximum size. The connection was
    /// dropped without a Close frame.
    #[error("frame exceeds the {limit} byte limit")]
    ResourceLimitExceeded { limit: usize },

    /// The transport refused or truncated a write.
    #[error("transport write failed: {0}")]
    TransportFailure(#[source] std::io::Error),

    /// Receipt of a frame with a reserved opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A text frame does not carry valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// The connection is closing or closed; nothing more can be sent.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// No connection with this identifier is being tracked.
    #[error("unknown connection")]
    UnknownConnection,

    /// Wraps socket errors from the tokio runtime layer.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
