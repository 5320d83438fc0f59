//! Codec module - serialization of frame payloads.
//!
//! A bond negotiates exactly one [`Protocol`] at bootstrap and keeps it for
//! its whole lifetime. Every protocol maps a [`serde_json::Value`] to a
//! single line of text and back:
//!
//! - [`Protocol::Json`] - compact JSON via `serde_json`
//! - [`Protocol::MsgPack`] - MessagePack via `rmp-serde`, base64 wrapped
//!
//! Encoded payloads never contain a newline, so they can be framed one per
//! line.
//!
//! # Example
//!
//! ```
//! use bond_client::codec::Protocol;
//! use serde_json::json;
//!
//! let value = json!(["echo", [1, "two"]]);
//! for protocol in Protocol::SUPPORTED {
//!     let line = protocol.dumps(&value).unwrap();
//!     assert!(!line.contains('\n'));
//!     assert_eq!(protocol.loads(&line).unwrap(), value);
//! }
//! ```

mod json;
mod msgpack;

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{BondError, Result};

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Serialization protocol negotiated between host and peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Compact JSON text.
    Json,
    /// Base64-wrapped MessagePack.
    MsgPack,
}

impl Protocol {
    /// Protocols the host can speak, in preference order.
    pub const SUPPORTED: [Protocol; 2] = [Protocol::Json, Protocol::MsgPack];

    /// Wire identifier sent to the peer during bootstrap.
    pub fn id(&self) -> &'static str {
        match self {
            Protocol::Json => "JSON",
            Protocol::MsgPack => "MSGPACK",
        }
    }

    /// Encode a value to a single-line payload.
    ///
    /// Failures are reported as local serialization errors.
    pub fn dumps(&self, value: &Value) -> Result<String> {
        match self {
            Protocol::Json => JsonCodec::encode(value),
            Protocol::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a payload received from the peer.
    pub fn loads(&self, payload: &str) -> Result<Value> {
        match self {
            Protocol::Json => JsonCodec::decode(payload),
            Protocol::MsgPack => MsgPackCodec::decode(payload),
        }
    }

    /// Pick the protocol for a bond.
    ///
    /// `peer` lists what the driver supports, best first. With a `requested`
    /// protocol both sides must support it; otherwise the first peer
    /// protocol the host knows wins.
    pub fn negotiate(peer: &[Protocol], requested: Option<Protocol>) -> Option<Protocol> {
        match requested {
            Some(wanted) => peer
                .iter()
                .copied()
                .find(|p| *p == wanted && Self::SUPPORTED.contains(p)),
            None => peer.iter().copied().find(|p| Self::SUPPORTED.contains(p)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Protocol {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(Protocol::Json),
            "MSGPACK" => Ok(Protocol::MsgPack),
            other => Err(BondError::local_serialization(format!(
                "unknown serialization protocol: {}",
                other
            ))),
        }
    }
}
