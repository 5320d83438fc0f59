//! Typed protocol messages.
//!
//! [`HostMessage`] is everything the host writes, [`PeerMessage`] everything
//! it accepts from the peer. Both sit on top of [`Frame`] and delegate the
//! payload to the negotiated [`Protocol`].
//!
//! Error classification on decode:
//! - a verb the peer must never send is a protocol error (fatal)
//! - a payload that does not decode, or has the wrong shape, is a local
//!   serialization error (the frame itself was well formed)

use serde_json::Value;

use super::frame::{Frame, Verb};
use crate::codec::Protocol;
use crate::error::{BondError, Result};

/// Output channel named in an `OUTPUT` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Peer standard output.
    Stdout,
    /// Peer standard error.
    Stderr,
}

impl Channel {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stdout => "STDOUT",
            Channel::Stderr => "STDERR",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "STDOUT" => Some(Channel::Stdout),
            "STDERR" => Some(Channel::Stderr),
            _ => None,
        }
    }
}

/// Frames written by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Evaluate a single expression.
    Eval(String),
    /// Execute a block of statements.
    EvalBlock(String),
    /// Call a peer function.
    Call {
        /// Peer-side callable expression.
        name: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// Announce a host binding.
    Export(String),
    /// Reply to a peer `CALL` with a value.
    Return(Value),
    /// Reply to a peer `CALL` with an exception.
    Except(Value),
    /// Reply to a peer `CALL` with a serialization failure.
    Error(String),
}

impl HostMessage {
    /// Verb of this message.
    pub fn verb(&self) -> Verb {
        match self {
            HostMessage::Eval(_) => Verb::Eval,
            HostMessage::EvalBlock(_) => Verb::EvalBlock,
            HostMessage::Call { .. } => Verb::Call,
            HostMessage::Export(_) => Verb::Export,
            HostMessage::Return(_) => Verb::Return,
            HostMessage::Except(_) => Verb::Except,
            HostMessage::Error(_) => Verb::Error,
        }
    }

    /// Serialize into a frame.
    ///
    /// `RETURN` with a null value is sent bare.
    pub fn to_frame(&self, protocol: Protocol) -> Result<Frame> {
        let payload = match self {
            HostMessage::Eval(code) | HostMessage::EvalBlock(code) => {
                Value::String(code.clone())
            }
            HostMessage::Call { name, args } => {
                Value::Array(vec![Value::String(name.clone()), Value::Array(args.clone())])
            }
            HostMessage::Export(name) => Value::String(name.clone()),
            HostMessage::Return(Value::Null) => return Ok(Frame::bare(Verb::Return)),
            HostMessage::Return(value) | HostMessage::Except(value) => value.clone(),
            HostMessage::Error(message) => Value::String(message.clone()),
        };
        Ok(Frame::new(self.verb(), protocol.dumps(&payload)?))
    }
}

/// Frames accepted from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Terminal value.
    Return(Value),
    /// Redirected output.
    Output {
        /// Target channel.
        channel: Channel,
        /// Output text.
        text: String,
    },
    /// Peer calling a host binding.
    Call {
        /// Binding name.
        name: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// The peer code raised.
    Except(Value),
    /// The peer could not encode or decode a value.
    Error(String),
    /// The peer is shutting down.
    Bye(Option<String>),
}

impl PeerMessage {
    /// Decode a frame received from the peer.
    pub fn from_frame(frame: &Frame, protocol: Protocol) -> Result<Self> {
        if matches!(frame.verb, Verb::Eval | Verb::EvalBlock | Verb::Export) {
            return Err(unexpected(frame.verb));
        }

        let payload = match frame.payload() {
            Some(text) => Some(protocol.loads(text)?),
            None => None,
        };

        match frame.verb {
            Verb::Return => Ok(PeerMessage::Return(payload.unwrap_or(Value::Null))),
            Verb::Except => Ok(PeerMessage::Except(payload.unwrap_or(Value::Null))),
            Verb::Error => Ok(PeerMessage::Error(match payload {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => String::from("unknown serialization error"),
            })),
            Verb::Bye => Ok(PeerMessage::Bye(payload.map(|value| match value {
                Value::String(message) => message,
                other => other.to_string(),
            }))),
            Verb::Output => {
                let (channel, text) = match payload {
                    Some(Value::Array(mut items)) if items.len() == 2 => {
                        let text = items.pop();
                        let channel = items.pop();
                        (channel, text)
                    }
                    _ => (None, None),
                };
                match (channel, text) {
                    (Some(Value::String(channel)), Some(Value::String(text))) => {
                        let channel = Channel::from_name(&channel).ok_or_else(|| {
                            BondError::local_serialization(format!(
                                "unknown output channel {:?}",
                                channel
                            ))
                        })?;
                        Ok(PeerMessage::Output { channel, text })
                    }
                    _ => Err(BondError::local_serialization(
                        "OUTPUT payload must be [channel, text]",
                    )),
                }
            }
            Verb::Call => {
                let (name, args) = match payload {
                    Some(Value::Array(mut items)) if items.len() == 2 => {
                        let args = items.pop();
                        let name = items.pop();
                        (name, args)
                    }
                    _ => (None, None),
                };
                match (name, args) {
                    (Some(Value::String(name)), Some(Value::Array(args))) => {
                        Ok(PeerMessage::Call { name, args })
                    }
                    (Some(Value::String(name)), Some(Value::Null)) => Ok(PeerMessage::Call {
                        name,
                        args: Vec::new(),
                    }),
                    _ => Err(BondError::local_serialization(
                        "CALL payload must be [name, args]",
                    )),
                }
            }
            Verb::Eval | Verb::EvalBlock | Verb::Export => Err(unexpected(frame.verb)),
        }
    }
}

fn unexpected(verb: Verb) -> BondError {
    BondError::Protocol(format!("unexpected {} frame from peer", verb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Side;
    use serde_json::json;

    fn peer(line: &str) -> Result<PeerMessage> {
        let frame = Frame::decode(line.as_bytes())?;
        PeerMessage::from_frame(&frame, Protocol::Json)
    }

    #[test]
    fn test_host_eval_frame() {
        let frame = HostMessage::Eval("1 + 1".into())
            .to_frame(Protocol::Json)
            .unwrap();
        assert_eq!(frame.encode(), b"EVAL \"1 + 1\"\n");
    }

    #[test]
    fn test_host_eval_block_multiline() {
        let frame = HostMessage::EvalBlock("def f():\n    return 1\n".into())
            .to_frame(Protocol::Json)
            .unwrap();
        let line = frame.encode();
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        assert!(line.starts_with(b"EVAL_BLOCK "));
    }

    #[test]
    fn test_host_call_frame() {
        let frame = HostMessage::Call {
            name: "test_multi_arg".into(),
            args: vec![json!("Hello"), json!("world!")],
        }
        .to_frame(Protocol::Json)
        .unwrap();
        assert_eq!(frame.to_string(), r#"CALL ["test_multi_arg",["Hello","world!"]]"#);
    }

    #[test]
    fn test_host_export_frame() {
        let frame = HostMessage::Export("call_me".into())
            .to_frame(Protocol::Json)
            .unwrap();
        assert_eq!(frame.to_string(), r#"EXPORT "call_me""#);
    }

    #[test]
    fn test_host_return_null_is_bare() {
        let frame = HostMessage::Return(Value::Null)
            .to_frame(Protocol::Json)
            .unwrap();
        assert_eq!(frame.encode(), b"RETURN\n");

        let frame = HostMessage::Return(json!(42)).to_frame(Protocol::Json).unwrap();
        assert_eq!(frame.encode(), b"RETURN 42\n");
    }

    #[test]
    fn test_host_except_and_error_frames() {
        let frame = HostMessage::Except(json!({"type": "RuntimeError", "message": "x"}))
            .to_frame(Protocol::Json)
            .unwrap();
        assert_eq!(frame.verb, Verb::Except);

        let frame = HostMessage::Error("cannot encode".into())
            .to_frame(Protocol::Json)
            .unwrap();
        assert_eq!(frame.to_string(), r#"ERROR "cannot encode""#);
    }

    #[test]
    fn test_peer_return() {
        assert_eq!(peer("RETURN [42]").unwrap(), PeerMessage::Return(json!([42])));
        assert_eq!(peer("RETURN").unwrap(), PeerMessage::Return(Value::Null));
    }

    #[test]
    fn test_peer_output() {
        assert_eq!(
            peer(r#"OUTPUT ["STDERR", "Hello world!\n"]"#).unwrap(),
            PeerMessage::Output {
                channel: Channel::Stderr,
                text: "Hello world!\n".into()
            }
        );
    }

    #[test]
    fn test_peer_output_bad_channel() {
        let err = peer(r#"OUTPUT ["STDIN", "x"]"#).unwrap_err();
        assert_eq!(err.side(), Some(Side::Local));
    }

    #[test]
    fn test_peer_call() {
        assert_eq!(
            peer(r#"CALL ["call_me", [1, "a"]]"#).unwrap(),
            PeerMessage::Call {
                name: "call_me".into(),
                args: vec![json!(1), json!("a")]
            }
        );
    }

    #[test]
    fn test_peer_call_malformed() {
        let err = peer(r#"CALL "call_me""#).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.side(), Some(Side::Local));
    }

    #[test]
    fn test_peer_except_and_error() {
        assert_eq!(
            peer(r#"EXCEPT "boom""#).unwrap(),
            PeerMessage::Except(json!("boom"))
        );
        assert_eq!(
            peer(r#"ERROR "cannot encode <function>""#).unwrap(),
            PeerMessage::Error("cannot encode <function>".into())
        );
    }

    #[test]
    fn test_peer_bye() {
        assert_eq!(peer("BYE").unwrap(), PeerMessage::Bye(None));
        assert_eq!(
            peer(r#"BYE "exiting""#).unwrap(),
            PeerMessage::Bye(Some("exiting".into()))
        );
    }

    #[test]
    fn test_peer_host_only_verbs_are_fatal() {
        for line in [r#"EVAL "1""#, r#"EVAL_BLOCK "x""#, r#"EXPORT "f""#] {
            let err = peer(line).unwrap_err();
            assert!(err.is_fatal(), "{} should be fatal", line);
        }
    }

    #[test]
    fn test_peer_bad_payload_is_local() {
        let err = peer("RETURN {oops").unwrap_err();
        assert_eq!(err.side(), Some(Side::Local));
    }

    #[test]
    fn test_msgpack_messages() {
        let frame = HostMessage::Call {
            name: "f".into(),
            args: vec![json!(1)],
        }
        .to_frame(Protocol::MsgPack)
        .unwrap();
        assert_eq!(frame.verb, Verb::Call);

        // the peer reflects the same payload back as a call
        let decoded = PeerMessage::from_frame(&frame, Protocol::MsgPack).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Call {
                name: "f".into(),
                args: vec![json!(1)]
            }
        );
    }
}
