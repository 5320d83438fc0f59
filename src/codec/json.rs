//! JSON codec using `serde_json`.
//!
//! Output is always compact: `serde_json` escapes control characters inside
//! strings, so a payload never spans more than one line.

use serde_json::Value;

use crate::error::{BondError, Result};

/// Compact JSON codec.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to compact JSON.
    #[inline]
    pub fn encode(value: &Value) -> Result<String> {
        serde_json::to_string(value).map_err(BondError::local_serialization)
    }

    /// Decode JSON text.
    #[inline]
    pub fn decode(payload: &str) -> Result<Value> {
        serde_json::from_str(payload).map_err(BondError::local_serialization)
    }
}
