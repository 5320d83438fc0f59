//! Error types for bond-client.
//!
//! [`BondError`] is the root of the taxonomy. Whether the bond survives an
//! error depends on the variant:
//!
//! - `Serialization` and `Remote` are recoverable, the bond stays usable.
//! - `Terminated` means the peer said `BYE` (or the bond was closed).
//! - Everything else is fatal: the transport must not be reused.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Which side of the bond failed to encode or decode a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The host could not encode outgoing (or decode incoming) data.
    Local,
    /// The peer reported that it could not encode or decode data.
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Error raised by code running inside the peer interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Stringified exception (transparent exceptions disabled).
    Message(String),
    /// Native error representation decoded as richly as possible.
    Native {
        /// Peer-side error type name, when the peer provided one.
        kind: Option<String>,
        /// Human readable message.
        message: String,
        /// The payload exactly as received.
        data: Value,
    },
}

impl RemoteError {
    /// Decode an `EXCEPT` payload.
    ///
    /// Strings stay strings. Objects with `type`/`message` keys become
    /// [`RemoteError::Native`] with a kind; anything else is kept as
    /// untyped native data.
    pub fn from_value(data: Value) -> Self {
        match data {
            Value::String(message) => RemoteError::Message(message),
            Value::Object(ref map) => {
                let kind = map.get("type").and_then(Value::as_str).map(str::to_string);
                let message = match map.get("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => data.to_string(),
                };
                RemoteError::Native {
                    kind,
                    message,
                    data,
                }
            }
            other => RemoteError::Native {
                kind: None,
                message: other.to_string(),
                data: other,
            },
        }
    }

    /// Peer-side error type name, if known.
    pub fn kind(&self) -> Option<&str> {
        match self {
            RemoteError::Message(_) => None,
            RemoteError::Native { kind, .. } => kind.as_deref(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Message(message) => message,
            RemoteError::Native { message, .. } => message,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}: {}", kind, self.message()),
            None => f.write_str(self.message()),
        }
    }
}

/// Main error type for all bond operations.
#[derive(Debug, Error)]
pub enum BondError {
    /// The interpreter process could not be started.
    #[error("cannot spawn interpreter: {0}")]
    Spawn(String),

    /// I/O error on the pty.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timed out waiting for peer output.
    #[error("timeout waiting for peer (pending output: {pending:?})")]
    Timeout {
        /// Unconsumed output at the time of the timeout.
        pending: String,
    },

    /// The two-stage handshake failed.
    #[error("bootstrap failed during {stage}: {reason}")]
    Bootstrap {
        /// Handshake step that failed (`negotiate`, `probe`, `stage1` or `stage2`).
        stage: &'static str,
        /// What went wrong.
        reason: String,
        /// Unconsumed interpreter output, for diagnostics.
        output: String,
    },

    /// Unexpected frame, unknown binding or broken transport. Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error ({side}): {message}")]
    Serialization {
        /// Who failed.
        side: Side,
        /// Diagnostic message.
        message: String,
    },

    /// Evaluated code raised inside the peer.
    #[error("remote exception: {0}")]
    Remote(RemoteError),

    /// The peer shut down, or the bond was closed.
    #[error("bond terminated{}", .0.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Terminated(Option<String>),
}

impl BondError {
    /// Shorthand for a local serialization failure.
    pub fn local_serialization(message: impl fmt::Display) -> Self {
        BondError::Serialization {
            side: Side::Local,
            message: message.to_string(),
        }
    }

    /// True when the bond can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BondError::Serialization { .. } | BondError::Remote(_) | BondError::Terminated(_)
        )
    }

    /// Failing side of a serialization error.
    pub fn side(&self) -> Option<Side> {
        match self {
            BondError::Serialization { side, .. } => Some(*side),
            _ => None,
        }
    }

    /// Category name, used as the error kind when forwarded to a peer.
    pub fn kind(&self) -> &'static str {
        match self {
            BondError::Spawn(_) => "SpawnError",
            BondError::Io(_) => "IOError",
            BondError::Timeout { .. } => "TimeoutError",
            BondError::Bootstrap { .. } => "BootstrapError",
            BondError::Protocol(_) => "ProtocolError",
            BondError::Serialization { .. } => "SerializationError",
            BondError::Remote(_) => "RemoteException",
            BondError::Terminated(_) => "TerminatedError",
        }
    }
}

/// Result type alias using BondError.
pub type Result<T> = std::result::Result<T, BondError>;

/// Error returned by a host binding invoked from the peer.
///
/// Sent back to the peer as an `EXCEPT` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingError {
    /// Error type name, reconstructed by the peer in transparent mode.
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl BindingError {
    /// Generic error with kind `Exception`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind("Exception", message)
    }

    /// Error with an explicit kind.
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BindingError {}

impl From<BondError> for BindingError {
    fn from(err: BondError) -> Self {
        match err {
            BondError::Remote(remote) => BindingError::with_kind(
                remote.kind().unwrap_or("Exception").to_string(),
                remote.message().to_string(),
            ),
            other => BindingError::with_kind(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_error_from_string() {
        let err = RemoteError::from_value(json!("name 'x' is not defined"));
        assert_eq!(err, RemoteError::Message("name 'x' is not defined".into()));
        assert_eq!(err.kind(), None);
        assert_eq!(err.to_string(), "name 'x' is not defined");
    }

    #[test]
    fn test_remote_error_from_native_object() {
        let data = json!({"type": "RuntimeError", "message": "boom", "args": ["boom"]});
        let err = RemoteError::from_value(data.clone());

        assert_eq!(err.kind(), Some("RuntimeError"));
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "RuntimeError: boom");
        match err {
            RemoteError::Native { data: kept, .. } => assert_eq!(kept, data),
            RemoteError::Message(_) => panic!("expected native error"),
        }
    }

    #[test]
    fn test_remote_error_from_other_value() {
        let err = RemoteError::from_value(json!([1, 2]));
        assert_eq!(err.kind(), None);
        assert_eq!(err.message(), "[1,2]");
    }

    #[test]
    fn test_fatality() {
        assert!(!BondError::local_serialization("x").is_fatal());
        assert!(!BondError::Remote(RemoteError::Message("x".into())).is_fatal());
        assert!(!BondError::Terminated(None).is_fatal());
        assert!(BondError::Protocol("x".into()).is_fatal());
        assert!(BondError::Timeout {
            pending: String::new()
        }
        .is_fatal());
    }

    #[test]
    fn test_side() {
        let err = BondError::Serialization {
            side: Side::Remote,
            message: "cannot encode".into(),
        };
        assert_eq!(err.side(), Some(Side::Remote));
        assert_eq!(err.to_string(), "serialization error (remote): cannot encode");
        assert_eq!(BondError::Protocol("x".into()).side(), None);
    }

    #[test]
    fn test_terminated_display() {
        assert_eq!(BondError::Terminated(None).to_string(), "bond terminated");
        assert_eq!(
            BondError::Terminated(Some("closed".into())).to_string(),
            "bond terminated: closed"
        );
    }

    #[test]
    fn test_binding_error_from_bond_error() {
        let remote = BondError::Remote(RemoteError::from_value(
            json!({"type": "ValueError", "message": "bad"}),
        ));
        let err = BindingError::from(remote);
        assert_eq!(err, BindingError::with_kind("ValueError", "bad"));

        let err = BindingError::from(BondError::local_serialization("nope"));
        assert_eq!(err.kind, "SerializationError");
        assert!(err.message.contains("nope"));
    }
}
