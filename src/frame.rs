//! # Frame
//!
//! Encoding and decoding of WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Only single-frame messages are produced: every frame built here has FIN set
//! and all RSV bits cleared. Neither fragmentation nor extensions are supported.
//!
//! The codec is stateless and does no I/O:
//!
//! - [`build`] writes a frame into a caller-provided buffer.
//! - [`parse`] decodes a frame in place, unmasking its payload, or reports that
//!   more bytes are needed by returning `None`.
//! - [`Frame`] is an owned outbound frame used by the engine's send paths.
//!
//! ```rust
//! use wsportal::frame::{self, OpCode};
//!
//! let mut buf = [0u8; 64];
//! let len = frame::build(&mut buf, OpCode::Text, b"hi", true).unwrap();
//!
//! let header = frame::parse(&mut buf[..len]).expect("complete frame");
//! assert_eq!(header.opcode().unwrap(), OpCode::Text);
//! assert_eq!(header.payload(&buf), b"hi");
//! ```
use bytes::{BufMut, Bytes, BytesMut};

use crate::{close::CloseCode, mask, Result, WebSocketError};

/// Largest possible frame header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEAD_SIZE: usize = 14;

/// Largest payload length a frame may declare. The most significant bit of the
/// 64-bit length field must be zero.
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// WebSocket operation code of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// Values 0x3-0x7 and 0xB-0xF are reserved; [`parse`] still decodes frames
/// carrying them and leaves the decision to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Decoded header of a frame.
///
/// A `FrameHeader` only exists once every header field (extended length and
/// masking key included) was present in the input, so its fields are always
/// complete. `payload_start` and `payload_len` are relative to the start of the
/// buffer handed to [`parse`] or [`decode_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// The three RSV bits, right aligned.
    pub rsv: u8,
    /// Whether the payload was masked on the wire.
    pub masked: bool,
    /// The masking key, all zeros when `masked` is false.
    pub mask: [u8; 4],
    /// Offset of the first payload byte.
    pub payload_start: usize,
    /// Declared payload length.
    pub payload_len: u64,
    opcode: u8,
}

impl FrameHeader {
    /// The frame's opcode, or `InvalidOpCode` for reserved values.
    pub fn opcode(&self) -> Result<OpCode> {
        OpCode::try_from(self.opcode)
    }

    /// The raw 4-bit opcode.
    pub fn raw_opcode(&self) -> u8 {
        self.opcode
    }

    /// Total encoded size: header plus payload, saturating at `u64::MAX`.
    pub fn frame_len(&self) -> u64 {
        (self.payload_start as u64).saturating_add(self.payload_len)
    }

    /// Whether the declared length is one RFC 6455 allows.
    pub fn has_valid_length(&self) -> bool {
        self.payload_len <= MAX_PAYLOAD_LEN
    }

    /// Slices the payload out of the buffer the header was parsed from.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than [`FrameHeader::frame_len`], which cannot
    /// happen for a header returned by [`parse`] on the same buffer.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload_start..self.payload_start + self.payload_len as usize]
    }
}

/// Header size for a payload of `payload_len` bytes.
///
/// 2 bytes below 126, 4 bytes up to 65535, 10 bytes above, plus 4 when masked.
pub fn header_len(payload_len: u64, masked: bool) -> usize {
    let base = if payload_len < 126 {
        2
    } else if payload_len < 65536 {
        4
    } else {
        10
    };
    base + if masked { 4 } else { 0 }
}

/// Writes a complete frame for `payload` into `dst`, returning the number of
/// bytes written.
///
/// When `mask` is set a fresh random masking key is generated. Fails with
/// [`WebSocketError::BufferTooSmall`] when `dst` cannot hold header and
/// payload; `payload.len() + MAX_HEAD_SIZE` bytes are always enough.
pub fn build(dst: &mut [u8], opcode: OpCode, payload: &[u8], mask: bool) -> Result<usize> {
    let key = mask.then(mask::random_key);
    build_with_key(dst, opcode, payload, key)
}

/// Like [`build`] but with an explicit masking key.
pub fn build_with_key(
    dst: &mut [u8],
    opcode: OpCode,
    payload: &[u8],
    key: Option<[u8; 4]>,
) -> Result<usize> {
    let len = payload.len();
    let head = header_len(len as u64, key.is_some());
    let needed = head + len;
    if needed > dst.len() {
        return Err(WebSocketError::BufferTooSmall {
            needed,
            capacity: dst.len(),
        });
    }

    // FIN=1, RSV=0
    dst[0] = 0x80 | u8::from(opcode);
    let mut pos = if len < 126 {
        dst[1] = len as u8;
        2
    } else if len < 65536 {
        dst[1] = 126;
        dst[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        dst[1] = 127;
        dst[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    };

    if let Some(key) = key {
        dst[1] |= 0x80;
        dst[pos..pos + 4].copy_from_slice(&key);
        pos += 4;
    }

    let body = &mut dst[pos..pos + len];
    body.copy_from_slice(payload);
    if let Some(key) = key {
        mask::apply_mask(body, key);
    }

    Ok(needed)
}

/// Decodes a frame header without looking at the payload.
///
/// Returns `None` while any header field is still missing from `buf`. Useful to
/// learn a frame's total size before its payload has arrived.
pub fn decode_head(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < 2 {
        return None;
    }

    let fin = buf[0] & 0b1000_0000 != 0;
    let rsv = (buf[0] & 0b0111_0000) >> 4;
    let opcode = buf[0] & 0b0000_1111;
    let masked = buf[1] & 0b1000_0000 != 0;
    let length_code = buf[1] & 0x7F;

    let (payload_len, mut pos) = match length_code {
        126 => {
            let bytes: [u8; 2] = buf.get(2..4)?.try_into().ok()?;
            (u64::from(u16::from_be_bytes(bytes)), 4)
        }
        127 => {
            let bytes: [u8; 8] = buf.get(2..10)?.try_into().ok()?;
            (u64::from_be_bytes(bytes), 10)
        }
        short => (u64::from(short), 2),
    };

    let mut mask = [0u8; 4];
    if masked {
        mask.copy_from_slice(buf.get(pos..pos + 4)?);
        pos += 4;
    }

    Some(FrameHeader {
        fin,
        rsv,
        masked,
        mask,
        payload_start: pos,
        payload_len,
        opcode,
    })
}

/// Decodes the frame at the start of `buf` and unmasks its payload in place.
///
/// Returns `None` (need more bytes) when the header or the payload it declares
/// extends past the end of `buf`; nothing is modified in that case. Bytes after
/// the frame are left untouched. A frame declaring more than
/// [`MAX_PAYLOAD_LEN`] bytes can never complete and always yields `None`;
/// callers bound their buffers with [`decode_head`] and a size limit.
pub fn parse(buf: &mut [u8]) -> Option<FrameHeader> {
    let header = decode_head(buf)?;
    if !header.has_valid_length() {
        return None;
    }

    let end = (header.payload_start as u64).checked_add(header.payload_len)?;
    if end > buf.len() as u64 {
        return None;
    }

    if header.masked {
        let end = end as usize;
        mask::apply_mask(&mut buf[header.payload_start..end], header.mask);
    }

    Some(header)
}

/// An owned outbound frame: an opcode and its unmasked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The operation code of the frame.
    pub opcode: OpCode,
    /// The application payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame from an opcode and payload.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    /// Creates a binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// Creates a pong frame, usually echoing a ping's payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Creates a close frame carrying a status code and a reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_slice(&code.to_bytes());
        payload.put_slice(reason);
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Creates a close frame with a raw payload, without validating it.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Close, payload)
    }

    /// Serializes the frame, masking it with a fresh key when `mask` is set.
    pub fn encode(&self, mask: bool) -> BytesMut {
        let mut out = BytesMut::zeroed(self.payload.len() + MAX_HEAD_SIZE);
        let written = build(&mut out, self.opcode, &self.payload, mask)
            .expect("buffer sized for the worst-case header");
        out.truncate(written);
        out
    }
}

impl From<(OpCode, Bytes)> for Frame {
    fn from((opcode, payload): (OpCode, Bytes)) -> Self {
        Self { opcode, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
            assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
            for code in [0x3, 0x7, 0xB, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod build_tests {
        use super::*;

        #[test]
        fn test_header_len_boundaries() {
            assert_eq!(header_len(0, false), 2);
            assert_eq!(header_len(125, false), 2);
            assert_eq!(header_len(126, false), 4);
            assert_eq!(header_len(65535, false), 4);
            assert_eq!(header_len(65536, false), 10);
            assert_eq!(header_len(u64::MAX, false), 10);
            assert_eq!(header_len(125, true), 6);
            assert_eq!(header_len(65536, true), 14);
        }

        #[test]
        fn test_build_small_unmasked() {
            let mut buf = [0u8; 16];
            let len = build(&mut buf, OpCode::Text, b"Hello", false).unwrap();

            assert_eq!(len, 7);
            assert_eq!(&buf[..len], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        }

        #[test]
        fn test_build_masked_rfc_sample() {
            let mut buf = [0u8; 16];
            let key = [0x37, 0xFA, 0x21, 0x3D];
            let len = build_with_key(&mut buf, OpCode::Text, b"Hello", Some(key)).unwrap();

            assert_eq!(
                &buf[..len],
                &[0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58]
            );
        }

        #[test]
        fn test_build_extended_16() {
            let payload = vec![0xAB; 256];
            let mut buf = vec![0u8; 256 + MAX_HEAD_SIZE];
            let len = build(&mut buf, OpCode::Binary, &payload, false).unwrap();

            assert_eq!(len, 4 + 256);
            assert_eq!(&buf[..4], &[0x82, 126, 0x01, 0x00]);
        }

        #[test]
        fn test_build_extended_64() {
            let payload = vec![0u8; 65536];
            let mut buf = vec![0u8; 65536 + MAX_HEAD_SIZE];
            let len = build(&mut buf, OpCode::Binary, &payload, false).unwrap();

            assert_eq!(len, 10 + 65536);
            assert_eq!(&buf[..10], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
        }

        #[test]
        fn test_buffer_too_small_exact_boundary() {
            for (payload_len, masked) in [(0usize, false), (125, true), (126, false), (300, true)] {
                let payload = vec![7u8; payload_len];
                let needed = header_len(payload_len as u64, masked) + payload_len;

                let mut exact = vec![0u8; needed];
                assert_eq!(
                    build(&mut exact, OpCode::Text, &payload, masked).unwrap(),
                    needed
                );

                let mut short = vec![0u8; needed - 1];
                let err = build(&mut short, OpCode::Text, &payload, masked).unwrap_err();
                assert!(matches!(
                    err,
                    WebSocketError::BufferTooSmall { needed: n, capacity: c }
                        if n == needed && c == needed - 1
                ));
            }
        }

        #[test]
        fn test_fin_set_rsv_clear() {
            let mut buf = [0u8; 8];
            build(&mut buf, OpCode::Ping, b"", true).unwrap();
            assert_eq!(buf[0] & 0xF0, 0x80);
            assert_eq!(buf[1] & 0x80, 0x80);
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn test_round_trip() {
            let opcodes = [
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ];

            for opcode in opcodes {
                for size in [0usize, 1, 5, 125, 126, 1000, 65535, 65536, 70000] {
                    for masked in [false, true] {
                        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                        let mut buf = vec![0u8; size + MAX_HEAD_SIZE];
                        let len = build(&mut buf, opcode, &payload, masked).unwrap();

                        let header = parse(&mut buf[..len]).expect("complete frame");
                        assert!(header.fin);
                        assert_eq!(header.rsv, 0);
                        assert_eq!(header.masked, masked);
                        assert_eq!(header.opcode().unwrap(), opcode);
                        assert_eq!(header.payload_len, size as u64);
                        assert_eq!(header.frame_len(), len as u64);
                        assert_eq!(header.payload(&buf), &payload[..]);
                    }
                }
            }
        }

        #[test]
        fn test_every_prefix_is_incomplete() {
            for size in [0usize, 3, 126, 300] {
                let payload = vec![0x5A; size];
                let mut frame = vec![0u8; size + MAX_HEAD_SIZE];
                let len = build(&mut frame, OpCode::Text, &payload, true).unwrap();
                frame.truncate(len);

                for cut in 0..len {
                    let mut prefix = frame[..cut].to_vec();
                    let before = prefix.clone();
                    assert!(parse(&mut prefix).is_none(), "size {} cut {}", size, cut);
                    // an incomplete parse must not unmask anything
                    assert_eq!(prefix, before);
                }
            }
        }

        #[test]
        fn test_huge_declared_length_is_incomplete() {
            // 127 length code announcing u64::MAX bytes
            let mut buf = [0x81, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2];
            assert!(parse(&mut buf).is_none());

            let head = decode_head(&buf).unwrap();
            assert_eq!(head.payload_len, u64::MAX);
            assert_eq!(head.payload_start, 10);
            assert!(!head.has_valid_length());
            assert_eq!(head.frame_len(), u64::MAX);
        }

        #[test]
        fn test_length_msb_set_never_completes() {
            // 2^63 bytes declared, masked, followed by some payload
            let mut buf = vec![0x81, 0xFF, 0x80, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
            buf.extend_from_slice(&[0xAA; 32]);
            let before = buf.clone();

            assert!(parse(&mut buf).is_none());
            assert_eq!(buf, before);

            let head = decode_head(&buf).unwrap();
            assert_eq!(head.payload_len, 1 << 63);
            assert!(!head.has_valid_length());
        }

        #[test]
        fn test_largest_valid_length_is_incomplete() {
            let mut buf = [0x82, 0x7F, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
            assert!(parse(&mut buf).is_none());

            let head = decode_head(&buf).unwrap();
            assert!(head.has_valid_length());
            assert_eq!(head.frame_len(), MAX_PAYLOAD_LEN + 10);
        }

        #[test]
        fn test_trailing_bytes_untouched() {
            let mut buf = vec![0u8; 64];
            let first = build(&mut buf, OpCode::Text, b"one", true).unwrap();
            let second = build(&mut buf[first..], OpCode::Text, b"two", true).unwrap();
            let snapshot = buf[first..first + second].to_vec();

            let header = parse(&mut buf[..first + second]).unwrap();
            assert_eq!(header.payload(&buf), b"one");
            assert_eq!(&buf[first..first + second], &snapshot[..]);

            let header = parse(&mut buf[first..first + second]).unwrap();
            assert_eq!(header.payload(&buf[first..]), b"two");
        }

        #[test]
        fn test_reserved_opcode_decodes() {
            let mut buf = [0x83, 0x00];
            let header = parse(&mut buf).unwrap();
            assert_eq!(header.raw_opcode(), 0x3);
            assert!(header.opcode().is_err());
        }

        #[test]
        fn test_rsv_bits_reported() {
            let mut buf = [0xC1, 0x00];
            let header = parse(&mut buf).unwrap();
            assert_eq!(header.rsv, 0b100);
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_payload() {
            let frame = Frame::close(CloseCode::Normal, "bye");
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..], b"\x03\xE8bye");
        }

        #[test]
        fn test_encode_matches_build() {
            let frame = Frame::pong("abc");
            let encoded = frame.encode(false);
            assert_eq!(&encoded[..], &[0x8A, 0x03, b'a', b'b', b'c']);
        }

        #[test]
        fn test_encode_masked_parses_back() {
            let frame = Frame::text("masked text");
            let mut encoded = frame.encode(true);
            let header = parse(&mut encoded).unwrap();
            assert!(header.masked);
            assert_eq!(header.payload(&encoded), b"masked text");
        }
    }
}
