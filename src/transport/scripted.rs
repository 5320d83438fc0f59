//! In-process transport for tests.
//!
//! [`scripted`] runs a closure on a thread that plays the peer side of the
//! conversation through a pair of channels. Frames are encoded with the
//! peer's [`Protocol`], JSON unless started with [`scripted_with`]. The host side behaves like
//! [`super::PtyTransport`]: chunked input, a line buffer, timeouts.

use std::cell::RefCell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use regex::bytes::Regex;
use serde_json::Value;

use super::{Expectation, Transport};
use crate::codec::Protocol;
use crate::error::{BondError, Result};
use crate::protocol::{Frame, LineBuffer, Verb};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host side of a scripted conversation.
pub(crate) struct ScriptedTransport {
    outgoing: Option<Sender<Vec<u8>>>,
    incoming: Receiver<Vec<u8>>,
    buffer: LineBuffer,
    timeout: Option<Duration>,
    raw: bool,
    peer: Option<JoinHandle<()>>,
}

/// Peer side of a scripted conversation.
pub(crate) struct Peer {
    incoming: Receiver<Vec<u8>>,
    outgoing: Sender<Vec<u8>>,
    buffer: RefCell<LineBuffer>,
    protocol: Protocol,
}

/// Start `script` as a JSON peer of a new transport.
pub(crate) fn scripted<F>(script: F) -> ScriptedTransport
where
    F: FnOnce(Peer) + Send + 'static,
{
    scripted_with(Protocol::Json, script)
}

/// Start `script` as a peer speaking `protocol`.
pub(crate) fn scripted_with<F>(protocol: Protocol, script: F) -> ScriptedTransport
where
    F: FnOnce(Peer) + Send + 'static,
{
    let (host_tx, peer_rx) = mpsc::channel();
    let (peer_tx, host_rx) = mpsc::channel();
    let peer = Peer {
        incoming: peer_rx,
        outgoing: peer_tx,
        buffer: RefCell::new(LineBuffer::new()),
        protocol,
    };
    let handle = thread::spawn(move || script(peer));

    ScriptedTransport {
        outgoing: Some(host_tx),
        incoming: host_rx,
        buffer: LineBuffer::new(),
        timeout: Some(DEFAULT_TIMEOUT),
        raw: false,
        peer: Some(handle),
    }
}

impl ScriptedTransport {
    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.raw
    }

    fn fill(&mut self, deadline: Option<Instant>) -> Result<()> {
        let chunk = match deadline {
            Some(deadline) => {
                match self
                    .incoming
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(BondError::Timeout {
                            pending: self.buffer.pending_text(),
                        })
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(eof()),
                }
            }
            None => self.incoming.recv().map_err(|_| eof())?,
        };
        self.buffer.push(&chunk);
        Ok(())
    }
}

fn eof() -> BondError {
    BondError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "scripted peer hung up",
    ))
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        match &self.outgoing {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| eof()),
            None => Err(BondError::Terminated(Some(String::from("transport closed")))),
        }
    }

    fn read_line(&mut self) -> Result<Bytes> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(line) = self.buffer.next_line()? {
                return Ok(line);
            }
            self.fill(deadline)?;
        }
    }

    fn expect(&mut self, pattern: &Regex) -> Result<Expectation> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(found) = self.buffer.expect(pattern) {
                return Ok(found);
            }
            self.fill(deadline)?;
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Ok(chunk) = self.incoming.try_recv() {
            self.buffer.push(&chunk);
        }
        self.buffer.clear();
        Ok(())
    }

    fn pending(&self) -> String {
        self.buffer.pending_text()
    }

    fn set_raw_mode(&mut self) -> Result<()> {
        self.raw = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.outgoing = None;
        Ok(())
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.outgoing = None;
        if let Some(handle) = self.peer.take() {
            if handle.join().is_err() && !thread::panicking() {
                panic!("scripted peer panicked");
            }
        }
    }
}

impl Peer {
    /// Next line written by the host, `None` once the host hung up.
    pub(crate) fn recv_raw(&self) -> Option<String> {
        let mut buffer = self.buffer.borrow_mut();
        loop {
            if let Some(line) = buffer.next_line().ok()? {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            let chunk = self.incoming.recv().ok()?;
            buffer.push(&chunk);
        }
    }

    /// Write raw text to the host.
    pub(crate) fn send_raw(&self, text: &str) {
        let _ = self.outgoing.send(text.as_bytes().to_vec());
    }

    /// Next frame written by the host, payload decoded.
    pub(crate) fn recv(&self) -> Option<(Verb, Value)> {
        let line = self.recv_raw()?;
        let frame = Frame::decode(line.as_bytes()).expect("host sent an invalid frame");
        let payload = match frame.payload() {
            Some(text) => self.protocol.loads(text).expect("host sent an invalid payload"),
            None => Value::Null,
        };
        Some((frame.verb, payload))
    }

    /// Next frame, which must carry `verb`.
    pub(crate) fn expect(&self, verb: Verb) -> Value {
        match self.recv() {
            Some((got, payload)) if got == verb => payload,
            other => panic!("expected {} from host, got {:?}", verb, other),
        }
    }

    /// Write a frame encoded with the peer's protocol.
    pub(crate) fn send(&self, verb: Verb, payload: Value) {
        let frame = Frame::new(verb, self.protocol.dumps(&payload).expect("encodable"));
        let _ = self.outgoing.send(frame.encode());
    }

    /// Write a frame without payload.
    pub(crate) fn send_bare(&self, verb: Verb) {
        let _ = self.outgoing.send(Frame::bare(verb).encode());
    }

    /// Block until the host hangs up.
    pub(crate) fn hold(&self) {
        while self.recv_raw().is_some() {}
    }
}
