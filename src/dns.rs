//! Catch-all DNS responder for the captive portal.
//!
//! Every standard query is answered with a single A record pointing at the
//! portal, whatever name was asked for. Clients that resolve anything end up
//! on the portal's HTTP server.
use std::net::Ipv4Addr;

use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Longest query looked at; anything after is ignored.
pub const MAX_MESSAGE_SIZE: usize = 300;

/// TTL of the answer, in seconds.
pub const ANSWER_TTL: u32 = 60;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;

// QR | AA | RA
const RESPONSE_FLAGS: u16 = 0x8480;
// pointer to the question name at offset 12
const NAME_POINTER: u16 = 0xC00C;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// The first question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Dotted name, for logging.
    pub name: String,
    /// Offset just past QTYPE and QCLASS.
    end: usize,
}

/// Answers every A query with one fixed address.
#[derive(Debug, Clone, Copy)]
pub struct CaptiveDns {
    addr: Ipv4Addr,
    ttl: u32,
}

impl CaptiveDns {
    pub fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            ttl: ANSWER_TTL,
        }
    }

    pub fn with_ttl(self, ttl: u32) -> Self {
        Self { ttl, ..self }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Decodes the first question of a standard query.
    ///
    /// Returns `None` for anything that is not worth answering: messages
    /// shorter than a header, responses, non-standard opcodes, queries
    /// without questions and truncated or compressed names.
    pub fn question(query: &[u8]) -> Option<Question> {
        let query = &query[..query.len().min(MAX_MESSAGE_SIZE)];
        if query.len() < HEADER_LEN {
            return None;
        }

        let flags = u16::from_be_bytes([query[2], query[3]]);
        let is_response = flags & 0x8000 != 0;
        let opcode = (flags >> 11) & 0x0F;
        let qdcount = u16::from_be_bytes([query[4], query[5]]);
        if is_response || opcode != 0 || qdcount < 1 {
            return None;
        }

        let mut labels = Vec::new();
        let mut pos = HEADER_LEN;
        loop {
            let len = usize::from(*query.get(pos)?);
            pos += 1;
            if len == 0 {
                break;
            }
            if len > MAX_LABEL_LEN {
                return None;
            }
            let label = query.get(pos..pos + len)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            pos += len;
        }

        // QTYPE + QCLASS
        query.get(pos..pos + 4)?;

        Some(Question {
            name: labels.join("."),
            end: pos + 4,
        })
    }

    /// Builds the reply to `query`, or `None` when it should be ignored.
    pub fn respond(&self, query: &[u8]) -> Option<Vec<u8>> {
        let question = Self::question(query)?;

        let mut reply = Vec::with_capacity(question.end + 16);
        reply.put_slice(&query[..2]);
        reply.put_u16(RESPONSE_FLAGS);
        reply.put_u16(1); // QDCOUNT
        reply.put_u16(1); // ANCOUNT
        reply.put_u16(0); // NSCOUNT
        reply.put_u16(0); // ARCOUNT
        reply.put_slice(&query[HEADER_LEN..question.end]);

        reply.put_u16(NAME_POINTER);
        reply.put_u16(TYPE_A);
        reply.put_u16(CLASS_IN);
        reply.put_u32(self.ttl);
        reply.put_u16(4);
        reply.put_slice(&self.addr.octets());

        #[cfg(feature = "logging")]
        log::debug!("dns: {} -> {}", question.name, self.addr);

        Some(reply)
    }

    /// Answers queries on `socket` until `cancel` fires.
    pub async fn serve(self, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let mut buf = [0u8; 512];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(_err) => {
                        #[cfg(feature = "logging")]
                        log::warn!("dns: receive failed: {}", _err);
                        continue;
                    }
                },
            };

            let Some(reply) = self.respond(&buf[..len]) else {
                continue;
            };
            if let Err(_err) = socket.send_to(&reply, peer).await {
                #[cfg(feature = "logging")]
                log::warn!("dns: reply to {} failed: {}", peer, _err);
            }
        }
    }
}
