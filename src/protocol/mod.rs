//! Protocol module - line framing and message types.
//!
//! This module implements the text protocol spoken after bootstrap:
//! - one frame per line: `VERB [payload]`
//! - line buffer for accumulating partial pty reads
//! - typed host and peer messages on top of frames

mod frame;
mod line_buffer;
mod message;

pub use frame::{Frame, Verb};
pub use line_buffer::{Expectation, LineBuffer, DEFAULT_MAX_LINE_SIZE};
pub use message::{Channel, HostMessage, PeerMessage};
