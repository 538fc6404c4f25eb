use std::time::Duration;

/// Default bound on a single frame (header included), in bytes.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Default bound on the length of a `Sec-WebSocket-Key` value.
pub const MAX_KEY_LEN: usize = 256;

/// Default time a new socket gets to send its first bytes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the engine answers a Close frame from the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseReply {
    /// Reply with the status code the peer sent and no reason. A peer close
    /// without a code, or with a code that must not be sent, gets an empty
    /// Close frame.
    #[default]
    EchoCode,
    /// Always reply with an empty Close frame.
    Empty,
}

/// Configuration options for the WebSocket engine.
///
/// `Options` governs resource limits, outbound masking, text validation and
/// the close handshake. The runtime timeouts are read by [`Server`](crate::server::Server).
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum size of a frame, header included.
    ///
    /// A frame announcing more, or a reassembly buffer growing past it, closes
    /// the connection immediately.
    ///
    /// Default: [`MAX_FRAME_SIZE`]
    pub max_frame_size: usize,

    /// Maximum accepted length of the `Sec-WebSocket-Key` header value.
    ///
    /// Default: [`MAX_KEY_LEN`]
    pub max_key_len: usize,

    /// Whether outgoing frames are masked.
    ///
    /// Servers do not mask per RFC 6455, so this is off by default.
    pub mask_outgoing: bool,

    /// Validate that text frames carry UTF-8. Invalid text closes the
    /// connection with status 1007.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Reply sent when the peer closes.
    pub close_reply: CloseReply,

    /// Time a freshly accepted socket has to deliver a complete request head,
    /// counted from accept.
    ///
    /// Default: [`HANDSHAKE_TIMEOUT`]
    pub handshake_timeout: Duration,

    /// Close connections that stay silent for this long.
    ///
    /// Default: `None` (no idle limit)
    pub idle_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_key_len: MAX_KEY_LEN,
            mask_outgoing: false,
            check_utf8: false,
            close_reply: CloseReply::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl Options {
    /// Sets the maximum frame size, header included.
    pub fn with_max_frame_size(self, size: usize) -> Self {
        Self {
            max_frame_size: size,
            ..self
        }
    }

    /// Sets the maximum length of the handshake key.
    pub fn with_max_key_len(self, len: usize) -> Self {
        Self {
            max_key_len: len,
            ..self
        }
    }

    /// Masks every outgoing frame with a fresh random key.
    pub fn with_masking(self) -> Self {
        Self {
            mask_outgoing: true,
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text frames.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Chooses how a peer's Close frame is answered.
    pub fn with_close_reply(self, close_reply: CloseReply) -> Self {
        Self {
            close_reply,
            ..self
        }
    }

    /// Sets how long a new socket may stay silent before it is dropped.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: timeout,
            ..self
        }
    }

    /// Closes connections that receive nothing for `timeout`.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }
}
