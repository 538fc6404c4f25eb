//! HTTP to WebSocket upgrade handshake.
//!
//! The engine does not parse the full request. It only needs the
//! `Sec-WebSocket-Key` value, which it finds by a case-sensitive search, and
//! the request-line path, which becomes the client's route.
use sha1::{Digest, Sha1};

use crate::{
    router::Request,
    transport::{write_all, ConnectionId, Transport},
    Result, WebSocketError,
};

/// GUID appended to the client key before hashing (RFC 6455 Section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Longest route kept for a client, in bytes.
pub const MAX_ROUTE_LEN: usize = 63;

const KEY_HEADER: &str = "Sec-WebSocket-Key:";

/// Finds the `Sec-WebSocket-Key` value in a raw request.
///
/// Only literal spaces after the colon are skipped; the value runs up to the
/// next CRLF. Returns `None` when the header is missing, when no CRLF follows
/// it, when the value is empty or when it is longer than `max_len` bytes.
pub fn extract_key(request: &str, max_len: usize) -> Option<&str> {
    let start = request.find(KEY_HEADER)? + KEY_HEADER.len();
    let rest = request[start..].trim_start_matches(' ');
    let end = rest.find("\r\n")?;
    let key = &rest[..end];

    if key.is_empty() || key.len() > max_len {
        return None;
    }

    Some(key)
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept_key(key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// The `101 Switching Protocols` response for `accept`.
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}

/// The route a client upgrades on: the request-line path without its query,
/// cut to [`MAX_ROUTE_LEN`] bytes.
pub fn request_route(request: &str) -> Option<&str> {
    let path = Request::parse(request)?.path;
    if path.len() <= MAX_ROUTE_LEN {
        return Some(path);
    }

    let mut end = MAX_ROUTE_LEN;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    Some(&path[..end])
}

/// Answers a WebSocket upgrade request on `id`.
///
/// On success the 101 response has been written. On failure nothing was
/// written and the caller decides what to do with the connection.
pub fn perform_handshake<T: Transport + ?Sized>(
    transport: &mut T,
    id: ConnectionId,
    request: &str,
    max_key_len: usize,
) -> Result<()> {
    let key = extract_key(request, max_key_len)
        .ok_or(WebSocketError::InvalidRequest("missing or oversized Sec-WebSocket-Key"))?;

    let response = upgrade_response(&compute_accept_key(key));
    write_all(transport, id, response.as_bytes())?;

    #[cfg(feature = "logging")]
    log::debug!("{} upgraded to websocket", id);

    Ok(())
}
