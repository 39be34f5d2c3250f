use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Utf8Bytes};

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

const CONNECTION_ID_PREFIX: &[u8] = b"conn_";
const CONNECTION_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Connection ID: 21-byte fixed array ("conn_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: [u8; CONNECTION_ID_LEN],
}

impl ConnectionId {
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes[..5].copy_from_slice(CONNECTION_ID_PREFIX);

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[5 + i] = HEX_CHARS[nibble];
        }
        Self { bytes }
    }

    /// Parse the textual form. Anything that is not `conn_` + 16 lowercase
    /// hex digits is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let src = s.as_bytes();
        if src.len() != CONNECTION_ID_LEN || !src.starts_with(CONNECTION_ID_PREFIX) {
            return None;
        }
        if !src[5..].iter().all(|b| HEX_CHARS.contains(b)) {
            return None;
        }
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes.copy_from_slice(src);
        Some(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        ConnectionId::parse(s)
            .ok_or_else(|| de::Error::custom(format!("invalid connection id: {s}")))
    }
}

/// Caller-supplied room name. Case-sensitive, no format constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}
