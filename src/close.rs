//! Close status codes (RFC 6455 Section 7.4).
//!
//! The engine only needs a handful of them: the code echoed back when a peer
//! closes, and the codes used when the engine itself tears a connection down.

/// Status code carried in the first two bytes of a Close frame payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002, protocol error.
    Protocol,
    /// 1003, the endpoint received a data type it cannot accept.
    Unsupported,
    /// 1005, reserved: no status code was present.
    Status,
    /// 1006, reserved: the connection dropped without a Close frame.
    Abnormal,
    /// 1007, payload data inconsistent with the message type (bad UTF-8).
    Invalid,
    /// 1008, policy violation.
    Policy,
    /// 1009, message too big to process.
    Size,
    /// 1010, the client expected the server to negotiate an extension.
    Extension,
    /// 1011, unexpected server condition.
    Error,
    /// 1012, the service is restarting.
    Restart,
    /// 1013, try again later.
    Again,
    /// 1014, the server acted as a gateway and got a bad upstream response.
    Gateway,
    /// Any other value.
    Other(u16),
}

impl CloseCode {
    /// Reads the status code at the start of a Close frame payload.
    ///
    /// Payloads shorter than two bytes carry no code.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let code: [u8; 2] = payload.get(..2)?.try_into().ok()?;
        Some(Self::from(u16::from_be_bytes(code)))
    }

    /// Returns `false` for codes an endpoint must never put on the wire:
    /// 1004, 1005, 1006, anything else below 3000 that is unregistered, and
    /// anything from 5000 up.
    pub fn is_allowed(self) -> bool {
        match self {
            CloseCode::Status | CloseCode::Abnormal => false,
            CloseCode::Other(code) => (3000..5000).contains(&code),
            _ => true,
        }
    }

    /// Big-endian wire form of the code.
    pub fn to_bytes(self) -> [u8; 2] {
        u16::from(self).to_be_bytes()
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1014 => CloseCode::Gateway,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Gateway => 1014,
            CloseCode::Other(other) => other,
        }
    }
}
