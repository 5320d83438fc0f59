//! Pseudo-terminal transport.
//!
//! Spawns the interpreter on the slave side of a pty and talks to it through
//! the master. A reader thread pumps master output into a channel so every
//! blocking read can honour the configured timeout.
//!
//! Echo is switched off on the pty before the child starts, and re-checked
//! before every `send`/`expect`: interactive line editors are free to toggle
//! it, and echoed input must never be mistaken for peer output.
//!
//! # Example
//!
//! ```ignore
//! use bond_client::transport::{PtyTransport, SpawnOptions, Transport};
//! use regex::bytes::Regex;
//!
//! let mut pty = PtyTransport::spawn(SpawnOptions::new("python3").arg("-q"))?;
//! pty.send_line(b"print('bond'.upper())")?;
//! pty.expect(&Regex::new(r"BOND\r?\n")?)?;
//! ```

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::bytes::Regex;

use super::{Expectation, Transport};
use crate::error::{BondError, Result};
use crate::protocol::LineBuffer;

/// Terminal type forced on every peer.
pub const TERM: &str = "dumb";

/// Grace period for a closed peer to exit before it is killed on drop.
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// Read chunk size for the pty reader thread.
const READ_CHUNK: usize = 8 * 1024;

/// How to start an interpreter.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Program to run.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory (inherited when `None`).
    pub cwd: Option<PathBuf>,
    /// Full environment (inherited when `None`).
    pub env: Option<HashMap<String, String>>,
    /// Variables added on top of `env`.
    pub extra_env: Vec<(String, String)>,
    /// Timeout applied to every blocking read (`None` waits forever).
    pub timeout: Option<Duration>,
}

impl SpawnOptions {
    /// Options for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Split a command line on whitespace into program and arguments.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| BondError::Spawn(String::from("empty command line")))?;
        Ok(Self {
            program: program.to_string(),
            args: words.map(str::to_string).collect(),
            ..Default::default()
        })
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the read timeout.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line, for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A child process attached to a pseudo-terminal.
pub struct PtyTransport {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    chunks: Receiver<Vec<u8>>,
    buffer: LineBuffer,
    timeout: Option<Duration>,
    #[cfg(unix)]
    cooked: Option<nix::sys::termios::Termios>,
    raw: bool,
    closed: bool,
}

impl PtyTransport {
    /// Spawn `options.program` in a fresh pty.
    ///
    /// # Errors
    ///
    /// Returns [`BondError::Spawn`] if the pty cannot be opened or the
    /// program cannot be started.
    pub fn spawn(options: SpawnOptions) -> Result<Self> {
        let spawn_err = |e: &dyn std::fmt::Display| {
            BondError::Spawn(format!("{}: {}", options.command_line(), e))
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 512,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err(&e))?;

        #[cfg(unix)]
        let cooked = match pair.master.as_raw_fd() {
            Some(fd) => Some(termios::disable_echo(fd)?),
            None => None,
        };

        let mut cmd = CommandBuilder::new(&options.program);
        cmd.args(&options.args);
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }
        if let Some(env) = &options.env {
            cmd.env_clear();
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        for (key, value) in &options.extra_env {
            cmd.env(key, value);
        }
        cmd.env("TERM", TERM);

        let child = pair.slave.spawn_command(cmd).map_err(|e| spawn_err(&e))?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(|e| spawn_err(&e))?;
        let writer = pair.master.take_writer().map_err(|e| spawn_err(&e))?;
        let chunks = spawn_reader(reader)?;

        tracing::debug!(command = %options.command_line(), "spawned interpreter");

        Ok(Self {
            master: pair.master,
            writer,
            child,
            chunks,
            buffer: LineBuffer::new(),
            timeout: options.timeout,
            #[cfg(unix)]
            cooked,
            raw: false,
            closed: false,
        })
    }

    /// True once the child has exited.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for one more chunk from the reader thread.
    fn fill(&mut self, deadline: Option<Instant>) -> Result<()> {
        let chunk = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.chunks.recv_timeout(remaining) {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(BondError::Timeout {
                            pending: self.buffer.pending_text(),
                        })
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(self.eof()),
                }
            }
            None => self.chunks.recv().map_err(|_| self.eof())?,
        };
        self.buffer.push(&chunk);
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    fn eof(&self) -> BondError {
        BondError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "interpreter closed the terminal (pending output: {:?})",
                self.buffer.pending_text()
            ),
        ))
    }

    fn ensure_noecho(&self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(fd) = self.master.as_raw_fd() {
                termios::disable_echo(fd)?;
            }
        }
        Ok(())
    }
}

impl Transport for PtyTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BondError::Terminated(Some(String::from("transport closed"))));
        }
        self.ensure_noecho()?;
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Bytes> {
        let deadline = self.deadline();
        loop {
            if let Some(line) = self.buffer.next_line()? {
                return Ok(line);
            }
            self.fill(deadline)?;
        }
    }

    fn expect(&mut self, pattern: &Regex) -> Result<Expectation> {
        self.ensure_noecho()?;
        let deadline = self.deadline();
        loop {
            if let Some(found) = self.buffer.expect(pattern) {
                return Ok(found);
            }
            self.fill(deadline)?;
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Ok(chunk) = self.chunks.try_recv() {
            self.buffer.push(&chunk);
        }
        if !self.buffer.is_empty() {
            tracing::trace!(discarded = %self.buffer.pending_text(), "drained pty output");
        }
        self.buffer.clear();
        Ok(())
    }

    fn pending(&self) -> String {
        self.buffer.pending_text()
    }

    fn set_raw_mode(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(fd) = self.master.as_raw_fd() {
                termios::make_raw(fd)?;
            }
        }
        self.raw = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        #[allow(unused_mut)]
        let mut eof = 0x04u8;
        #[cfg(unix)]
        {
            if let (Some(fd), Some(cooked)) = (self.master.as_raw_fd(), self.cooked.as_ref()) {
                // VEOF is only interpreted in canonical mode
                if self.raw {
                    termios::restore(fd, cooked)?;
                }
                eof = termios::veof(cooked);
            }
        }
        self.closed = true;
        // the newline completes any read the peer started in raw mode, so
        // the EOF lands at the start of a fresh canonical line
        self.writer.write_all(&[b'\n', eof])?;
        self.writer.flush()?;
        tracing::debug!("sent end-of-stream to interpreter");
        Ok(())
    }
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        let _ = self.close();
        let deadline = Instant::now() + EXIT_GRACE;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                tracing::debug!("interpreter did not exit after end-of-stream, killing it");
                let _ = self.child.kill();
                let _ = self.child.wait();
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Pump pty output into a channel until EOF or error.
fn spawn_reader(mut reader: Box<dyn Read + Send>) -> Result<Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(String::from("bond-pty-reader"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone
                    Err(_) => break,
                }
            }
        })?;
    Ok(rx)
}

// ============================================================================
// Unix termios control
// ============================================================================

#[cfg(unix)]
mod termios {
    use std::os::unix::io::RawFd;

    use nix::sys::termios::{
        cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
    };

    use crate::error::Result;

    /// Clear ECHO if set. Returns the resulting settings.
    pub(super) fn disable_echo(fd: RawFd) -> Result<Termios> {
        let mut attrs = tcgetattr(fd).map_err(std::io::Error::from)?;
        if attrs.local_flags.contains(LocalFlags::ECHO) {
            attrs.local_flags.remove(LocalFlags::ECHO);
            tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(std::io::Error::from)?;
        }
        Ok(attrs)
    }

    /// No line editing, no signal characters, no newline translation.
    pub(super) fn make_raw(fd: RawFd) -> Result<()> {
        let mut attrs = tcgetattr(fd).map_err(std::io::Error::from)?;
        cfmakeraw(&mut attrs);
        tcsetattr(fd, SetArg::TCSADRAIN, &attrs).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub(super) fn restore(fd: RawFd, attrs: &Termios) -> Result<()> {
        tcsetattr(fd, SetArg::TCSADRAIN, attrs).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub(super) fn veof(attrs: &Termios) -> u8 {
        attrs.control_chars[SpecialCharacterIndices::VEOF as usize]
    }
}
