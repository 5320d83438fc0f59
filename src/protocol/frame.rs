//! Frame struct and line codec.
//!
//! A frame is one line: an ASCII verb, optionally followed by a single space
//! and a serialized payload.
//!
//! ```text
//! <LINE> ::= VERB [' ' PAYLOAD] '\n'
//! ```
//!
//! The codec is payload-agnostic: it only splits and joins. Payloads are
//! interpreted by [`crate::protocol::message`].
//!
//! # Example
//!
//! ```
//! use bond_client::protocol::{Frame, Verb};
//!
//! let frame = Frame::decode(b"RETURN 42").unwrap();
//! assert_eq!(frame.verb, Verb::Return);
//! assert_eq!(frame.payload(), Some("42"));
//!
//! assert_eq!(Frame::bare(Verb::Bye).encode(), b"BYE\n");
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{BondError, Result};

/// Every verb the protocol knows.
///
/// `CALL` travels in both directions; all other verbs have a fixed sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Evaluate an expression and return its value.
    Eval,
    /// Execute a statement block.
    EvalBlock,
    /// Call a named function with arguments.
    Call,
    /// Declare a host binding to the peer.
    Export,
    /// Terminal frame carrying a value.
    Return,
    /// Peer output redirected to a host channel.
    Output,
    /// Terminal frame carrying an exception.
    Except,
    /// Terminal frame carrying a serialization failure.
    Error,
    /// The peer is shutting down.
    Bye,
}

impl Verb {
    /// All verbs, in wire grammar order.
    pub const ALL: [Verb; 9] = [
        Verb::Eval,
        Verb::EvalBlock,
        Verb::Call,
        Verb::Export,
        Verb::Return,
        Verb::Output,
        Verb::Except,
        Verb::Error,
        Verb::Bye,
    ];

    /// The ASCII token on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Eval => "EVAL",
            Verb::EvalBlock => "EVAL_BLOCK",
            Verb::Call => "CALL",
            Verb::Export => "EXPORT",
            Verb::Return => "RETURN",
            Verb::Output => "OUTPUT",
            Verb::Except => "EXCEPT",
            Verb::Error => "ERROR",
            Verb::Bye => "BYE",
        }
    }

    /// True for verbs that end one response loop invocation.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Verb::Return | Verb::Except | Verb::Error)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self> {
        Verb::ALL
            .iter()
            .copied()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| BondError::Protocol(format!("unknown verb {:?}", s)))
    }
}

/// A single protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command or response verb.
    pub verb: Verb,
    /// Serialized payload, if any.
    pub payload: Option<String>,
}

impl Frame {
    /// Create a frame with a payload.
    pub fn new(verb: Verb, payload: impl Into<String>) -> Self {
        Self {
            verb,
            payload: Some(payload.into()),
        }
    }

    /// Create a frame without payload.
    pub fn bare(verb: Verb) -> Self {
        Self {
            verb,
            payload: None,
        }
    }

    /// Get the payload text.
    #[inline]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Encode to a newline-terminated line.
    pub fn encode(&self) -> Vec<u8> {
        let verb = self.verb.as_str();
        match &self.payload {
            Some(payload) => {
                let mut buf = Vec::with_capacity(verb.len() + payload.len() + 2);
                buf.extend_from_slice(verb.as_bytes());
                buf.push(b' ');
                buf.extend_from_slice(payload.as_bytes());
                buf.push(b'\n');
                buf
            }
            None => {
                let mut buf = Vec::with_capacity(verb.len() + 1);
                buf.extend_from_slice(verb.as_bytes());
                buf.push(b'\n');
                buf
            }
        }
    }

    /// Decode one line (terminator already stripped).
    ///
    /// The verb is everything before the first space; the rest is the
    /// payload. An empty payload after the space counts as no payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for non UTF-8 lines and unknown verbs.
    pub fn decode(line: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(line)
            .map_err(|e| BondError::Protocol(format!("frame is not valid UTF-8: {}", e)))?;
        let (verb, payload) = match line.split_once(' ') {
            Some((verb, payload)) => (verb, Some(payload)),
            None => (line, None),
        };

        Ok(Self {
            verb: verb.parse()?,
            payload: payload.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{} {}", self.verb, payload),
            None => write!(f, "{}", self.verb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_tokens_roundtrip() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
    }

    #[test]
    fn test_terminal_verbs() {
        let terminal: Vec<Verb> = Verb::ALL.into_iter().filter(Verb::is_terminal).collect();
        assert_eq!(terminal, vec![Verb::Return, Verb::Except, Verb::Error]);
    }

    #[test]
    fn test_encode_with_payload() {
        let frame = Frame::new(Verb::Eval, "\"1 + 1\"");
        assert_eq!(frame.encode(), b"EVAL \"1 + 1\"\n");
    }

    #[test]
    fn test_encode_bare() {
        assert_eq!(Frame::bare(Verb::Return).encode(), b"RETURN\n");
    }

    #[test]
    fn test_decode_splits_on_first_space() {
        let frame = Frame::decode(b"OUTPUT [\"STDOUT\", \"a b c\"]").unwrap();
        assert_eq!(frame.verb, Verb::Output);
        assert_eq!(frame.payload(), Some("[\"STDOUT\", \"a b c\"]"));
    }

    #[test]
    fn test_decode_bare() {
        let frame = Frame::decode(b"BYE").unwrap();
        assert_eq!(frame, Frame::bare(Verb::Bye));
    }

    #[test]
    fn test_decode_trailing_space_is_bare() {
        assert_eq!(Frame::decode(b"RETURN ").unwrap(), Frame::bare(Verb::Return));
    }

    #[test]
    fn test_decode_unknown_verb() {
        let err = Frame::decode(b"REMOTE [\"f\", []]").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unknown verb"));
    }

    #[test]
    fn test_decode_lowercase_verb_is_unknown() {
        assert!(Frame::decode(b"return 1").is_err());
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(Frame::decode(&[0x52, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Frame::new(Verb::Call, "[]").to_string(), "CALL []");
        assert_eq!(Frame::bare(Verb::Bye).to_string(), "BYE");
    }
}
