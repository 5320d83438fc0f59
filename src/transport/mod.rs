//! Transport module - the byte channel between host and peer.
//!
//! [`Transport`] is the seam the engine is written against. The production
//! implementation is [`PtyTransport`], a child process attached to a
//! pseudo-terminal:
//! - Unix: `portable-pty` + termios via `nix`
//! - Windows: ConPTY through `portable-pty`, without termios control

mod pty;
#[cfg(test)]
pub(crate) mod scripted;

use bytes::Bytes;
use regex::bytes::Regex;

use crate::error::Result;
pub use crate::protocol::Expectation;
pub use pty::{PtyTransport, SpawnOptions};

/// Line-oriented byte channel to a peer interpreter.
///
/// Reads block until data arrives or the transport's timeout expires.
pub trait Transport: Send {
    /// Write raw bytes.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Write `line` followed by `\n`.
    fn send_line(&mut self, line: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        self.send(&buf)
    }

    /// Read exactly one complete line, terminator stripped.
    fn read_line(&mut self) -> Result<Bytes>;

    /// Wait until the output matches `pattern`, consuming through the match.
    fn expect(&mut self, pattern: &Regex) -> Result<Expectation>;

    /// Discard pending, unconsumed output (echo, prompts, banners).
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    /// Unconsumed output, for diagnostics.
    fn pending(&self) -> String {
        String::new()
    }

    /// Switch the line discipline to raw mode.
    fn set_raw_mode(&mut self) -> Result<()> {
        Ok(())
    }

    /// Send end-of-stream to the peer. Does not wait for it to exit.
    fn close(&mut self) -> Result<()>;
}
