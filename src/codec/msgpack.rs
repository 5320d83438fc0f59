//! MsgPack codec using `rmp-serde`.
//!
//! Always `to_vec_named`, so maps keep their field names for peers that
//! decode into dictionaries. The binary output is base64 encoded to survive
//! the line-oriented framing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use crate::error::{BondError, Result};

/// MessagePack codec for line framing.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to base64-wrapped MsgPack.
    #[inline]
    pub fn encode(value: &Value) -> Result<String> {
        let bytes = rmp_serde::to_vec_named(value).map_err(BondError::local_serialization)?;
        Ok(STANDARD.encode(bytes))
    }

    /// Decode base64-wrapped MsgPack.
    #[inline]
    pub fn decode(payload: &str) -> Result<Value> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(BondError::local_serialization)?;
        rmp_serde::from_slice(&bytes).map_err(BondError::local_serialization)
    }
}
