//! Line buffer for accumulating partial pty reads.
//!
//! Uses `bytes::BytesMut` so complete lines are split off without copying.
//! Two consumers share the same buffer:
//! - bootstrap, which scans for sentinels with [`LineBuffer::expect`]
//! - the framing phase, which pulls one line at a time with
//!   [`LineBuffer::next_line`]
//!
//! Whatever bootstrap leaves behind after `READY` stays buffered for the
//! framing phase.
//!
//! # Example
//!
//! ```
//! use bond_client::protocol::LineBuffer;
//!
//! let mut buffer = LineBuffer::new();
//! buffer.push(b"RETURN 4");
//! assert!(buffer.next_line().unwrap().is_none());
//!
//! buffer.push(b"2\r\n");
//! let line = buffer.next_line().unwrap().unwrap();
//! assert_eq!(&line[..], b"RETURN 42");
//! ```

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

use crate::error::{BondError, Result};

/// Default maximum line length (1 GB).
pub const DEFAULT_MAX_LINE_SIZE: usize = 1_073_741_824;

/// Result of a successful [`LineBuffer::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    /// Output preceding the match (echo, prompts, banners).
    pub before: String,
    /// The matched text.
    pub matched: String,
    /// Capture groups, index 0 excluded.
    pub groups: Vec<Option<String>>,
}

/// Buffer for accumulating pty output and extracting lines or patterns.
pub struct LineBuffer {
    buffer: BytesMut,
    max_line_size: usize,
}

impl LineBuffer {
    /// Create a new line buffer with default settings.
    ///
    /// Default capacity: 64KB, max line: 1GB.
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_SIZE)
    }

    /// Create a new line buffer with a custom max line size.
    pub fn with_max_line(max_line_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_line_size,
        }
    }

    /// Append raw bytes read from the pty.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete line, without its `\n` or `\r\n` terminator.
    ///
    /// Returns `Ok(None)` when no complete line is buffered yet.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if an unterminated line grows past the
    /// configured maximum.
    pub fn next_line(&mut self) -> Result<Option<Bytes>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if self.buffer.len() > self.max_line_size => Err(BondError::Protocol(format!(
                "line size {} exceeds maximum {}",
                self.buffer.len(),
                self.max_line_size
            ))),
            None => Ok(None),
        }
    }

    /// Search the buffer for `pattern`.
    ///
    /// On a match everything up to the end of the match is consumed.
    pub fn expect(&mut self, pattern: &Regex) -> Option<Expectation> {
        let (start, end, matched, groups) = {
            let caps = pattern.captures(&self.buffer)?;
            let whole = caps.get(0)?;
            let groups = caps
                .iter()
                .skip(1)
                .map(|group| group.map(|g| String::from_utf8_lossy(g.as_bytes()).into_owned()))
                .collect::<Vec<_>>();
            (
                whole.start(),
                whole.end(),
                String::from_utf8_lossy(whole.as_bytes()).into_owned(),
                groups,
            )
        };

        let before = String::from_utf8_lossy(&self.buffer[..start]).into_owned();
        let _ = self.buffer.split_to(end);
        Some(Expectation {
            before,
            matched,
            groups,
        })
    }

    /// Buffered bytes as text, for diagnostics.
    pub fn pending_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
