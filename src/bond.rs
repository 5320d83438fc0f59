//! Bond builder and response loop.
//!
//! The [`BondBuilder`] provides a fluent API for configuring the peer
//! interpreter and spawning it. The [`Bond`] manages the lifecycle:
//! 1. Spawn a candidate command in a pty
//! 2. Bootstrap it into a frame-speaking peer
//! 3. Send commands and run the response loop until each terminates
//! 4. Close with end-of-stream
//!
//! The response loop is plain recursion. A peer `CALL` is dispatched inline
//! to a host binding, which receives the same `&mut Bond` and may issue
//! further commands on it; each nested command consumes exactly its own
//! terminal frame before control returns to the outer loop.
//!
//! # Example
//!
//! ```ignore
//! use bond_client::{BindingError, Bond};
//! use serde_json::Value;
//!
//! let mut py = Bond::builder().spawn()?;
//! py.eval_block("def twice(f, x): return f(f(x))")?;
//! py.export("inc", |_bond, args: Vec<Value>| {
//!     let x = args[0].as_i64().ok_or_else(|| BindingError::new("not a number"))?;
//!     Ok(x + 1)
//! })?;
//! assert_eq!(py.eval("twice(inc, 40)")?, 42);
//! py.close()?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::codec::Protocol;
use crate::control::{bootstrap, Driver, Handshake};
use crate::error::{BindingError, BondError, RemoteError, Result, Side};
use crate::handler::{Binding, BindingFailure, BindingTable, TypedBinding};
use crate::protocol::{Channel, Frame, HostMessage, PeerMessage, Verb};
use crate::transport::{PtyTransport, SpawnOptions, Transport};

/// Default blocking read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable overriding the default timeout, in seconds.
pub const TIMEOUT_ENV: &str = "BOND_TIMEOUT";

/// Destination for redirected peer output.
pub type OutputSink = Box<dyn Write + Send>;

/// A bond shared between threads or proxied into other bonds.
pub type SharedBond = Arc<Mutex<Bond>>;

thread_local! {
    /// Shared bonds with a response loop running on this thread.
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Identity of a shared bond, stable for the lifetime of its allocation.
fn shared_key(shared: &SharedBond) -> usize {
    Arc::as_ptr(shared) as *const () as usize
}

fn is_active(key: usize) -> bool {
    ACTIVE.with(|active| active.borrow().contains(&key))
}

/// Marks a shared bond as busy on the current thread until dropped.
struct ActiveGuard(usize);

impl ActiveGuard {
    fn enter(key: usize) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(key));
        ActiveGuard(key)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|&key| key == self.0) {
                active.remove(pos);
            }
        });
    }
}

/// Lifecycle state of a [`Bond`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    /// Bootstrapped and usable.
    Ready,
    /// Closed by the host.
    Closed,
    /// The peer said `BYE`.
    Terminated,
    /// A fatal error occurred; the transport must not be reused.
    Broken,
}

/// Resolved bond settings.
#[derive(Debug, Clone)]
pub struct BondConfig {
    /// Explicit command line. When `None` the driver candidates are tried.
    pub command: Option<String>,
    /// Extra arguments appended to the command line.
    pub args: Vec<String>,
    /// Working directory of the interpreter.
    pub cwd: Option<PathBuf>,
    /// Environment of the interpreter (inherited when `None`).
    pub env: Option<HashMap<String, String>>,
    /// Blocking read timeout (`None` waits forever).
    pub timeout: Option<Duration>,
    /// Exchange exceptions as structured values instead of strings.
    pub trans_except: bool,
    /// Requested serialization protocol (negotiated when `None`).
    pub protocol: Option<Protocol>,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cwd: None,
            env: None,
            timeout: Some(timeout_from_env().unwrap_or(DEFAULT_TIMEOUT)),
            trans_except: false,
            protocol: None,
        }
    }
}

fn timeout_from_env() -> Option<Duration> {
    let value = std::env::var(TIMEOUT_ENV).ok()?;
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            tracing::warn!(value = %value, "ignoring invalid {}", TIMEOUT_ENV);
            None
        }
    }
}

/// Builder for configuring and spawning a [`Bond`].
pub struct BondBuilder {
    driver: Driver,
    config: BondConfig,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
}

impl BondBuilder {
    /// Create a builder for `driver`.
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            config: BondConfig::default(),
            stdout: None,
            stderr: None,
        }
    }

    /// Create a builder for the built-in Python driver.
    pub fn python() -> Self {
        Self::new(Driver::python())
    }

    /// Create a builder for the built-in JavaScript (Node.js) driver.
    pub fn javascript() -> Self {
        Self::new(Driver::javascript())
    }

    /// Create a builder for a built-in driver by language name.
    pub fn lang(name: &str) -> Result<Self> {
        Driver::lookup(name)
            .map(Self::new)
            .ok_or_else(|| BondError::Spawn(format!("no built-in driver for {}", name)))
    }

    /// Use an explicit command line instead of the driver candidates.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.config.command = Some(command.into());
        self
    }

    /// Append an argument to the command line.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.config.cwd = Some(cwd.into());
        self
    }

    /// Replace the inherited environment.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.config.env = Some(env);
        self
    }

    /// Set the blocking read timeout.
    ///
    /// Default: 60 seconds, or `BOND_TIMEOUT` when set.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enable transparent exceptions.
    pub fn trans_except(mut self, enabled: bool) -> Self {
        self.config.trans_except = enabled;
        self
    }

    /// Request a serialization protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = Some(protocol);
        self
    }

    /// Redirect peer output written to `channel`.
    ///
    /// Default: the host's own stdout/stderr.
    pub fn output_sink(mut self, channel: Channel, sink: impl Write + Send + 'static) -> Self {
        match channel {
            Channel::Stdout => self.stdout = Some(Box::new(sink)),
            Channel::Stderr => self.stderr = Some(Box::new(sink)),
        }
        self
    }

    /// Resolved settings.
    pub fn config(&self) -> &BondConfig {
        &self.config
    }

    /// Spawn the interpreter and bootstrap it.
    ///
    /// Without an explicit command every driver candidate is tried in order
    /// and the last failure is returned.
    pub fn spawn(self) -> Result<Bond> {
        bootstrap::negotiate(&self.driver, self.config.protocol)?;

        let candidates = match &self.config.command {
            Some(command) => vec![command.clone()],
            None => self.driver.commands.clone(),
        };

        let mut last = None;
        for candidate in &candidates {
            match self.start(candidate) {
                Ok((transport, handshake)) => {
                    tracing::debug!(command = %candidate, "bond established");
                    return Ok(self.attach(Box::new(transport), handshake.protocol));
                }
                Err(e) => {
                    tracing::warn!(
                        command = %candidate,
                        error = %e,
                        "interpreter candidate failed"
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            BondError::Spawn(format!("no command to run for {}", self.driver.name))
        }))
    }

    /// Spawn and bootstrap one candidate command line.
    fn start(&self, command: &str) -> Result<(PtyTransport, Handshake)> {
        let mut options = SpawnOptions::from_command_line(command)?;
        options.args.extend(self.config.args.iter().cloned());
        options.cwd = self.config.cwd.clone();
        options.env = self.config.env.clone();
        options.extra_env = self.driver.env.clone();
        options.timeout = self.config.timeout;

        let mut transport = PtyTransport::spawn(options)?;
        let handshake = bootstrap::run(
            &mut transport,
            &self.driver,
            self.config.protocol,
            self.config.trans_except,
        )?;
        Ok((transport, handshake))
    }

    /// Bootstrap a peer over an already spawned transport.
    pub fn connect(self, mut transport: Box<dyn Transport>) -> Result<Bond> {
        let handshake = bootstrap::run(
            transport.as_mut(),
            &self.driver,
            self.config.protocol,
            self.config.trans_except,
        )?;
        Ok(self.attach(transport, handshake.protocol))
    }

    /// Wrap a transport whose peer is already running its protocol loop.
    pub fn attach(self, transport: Box<dyn Transport>, protocol: Protocol) -> Bond {
        Bond {
            lang: self.driver.name,
            transport,
            bindings: BindingTable::new(),
            protocol,
            trans_except: self.config.trans_except,
            state: BondState::Ready,
            depth: 0,
            shared: None,
            stdout: self.stdout.unwrap_or_else(|| Box::new(std::io::stdout())),
            stderr: self.stderr.unwrap_or_else(|| Box::new(std::io::stderr())),
        }
    }
}

impl Default for BondBuilder {
    fn default() -> Self {
        Self::python()
    }
}

/// A live connection to one peer interpreter.
///
/// All operations block until their response loop terminates.
pub struct Bond {
    lang: String,
    transport: Box<dyn Transport>,
    bindings: BindingTable,
    protocol: Protocol,
    trans_except: bool,
    state: BondState,
    depth: usize,
    shared: Option<usize>,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl Bond {
    /// Create a builder for the built-in Python driver.
    pub fn builder() -> BondBuilder {
        BondBuilder::python()
    }

    /// Language of the peer.
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// Negotiated serialization protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Transparent exceptions enabled.
    pub fn trans_except(&self) -> bool {
        self.trans_except
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BondState {
        self.state
    }

    /// Number of active response loops (0 when idle).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Exported host bindings.
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Raw access to the transport, bypassing the protocol.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Share this bond, e.g. to [`proxy`] its functions into other bonds.
    pub fn into_shared(self) -> SharedBond {
        let mut shared = Arc::new(Mutex::new(self));
        let key = shared_key(&shared);
        if let Some(Ok(bond)) = Arc::get_mut(&mut shared).map(Mutex::get_mut) {
            bond.shared = Some(key);
        }
        shared
    }

    /// Evaluate a single expression in the peer and return its value.
    pub fn eval(&mut self, code: &str) -> Result<Value> {
        self.request(HostMessage::Eval(code.to_string()))
    }

    /// Execute a block of statements in the peer.
    pub fn eval_block(&mut self, code: &str) -> Result<()> {
        self.request(HostMessage::EvalBlock(code.to_string())).map(|_| ())
    }

    /// Call a peer function.
    ///
    /// `args` must serialize to a sequence (tuple, `Vec`, array) or to unit
    /// for no arguments. Anything else fails locally without contacting the
    /// peer.
    pub fn call<A: Serialize>(&mut self, name: &str, args: A) -> Result<Value> {
        self.ensure_usable()?;
        let args = call_args(args)?;
        self.request(HostMessage::Call {
            name: name.to_string(),
            args,
        })
    }

    /// Export a host function to the peer under `name`.
    pub fn export<F, R>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&mut Bond, Vec<Value>) -> std::result::Result<R, BindingError>
            + Send
            + Sync
            + 'static,
        R: Serialize + 'static,
    {
        self.export_binding(name, TypedBinding::shared(handler))
    }

    /// Export an existing binding to the peer under `name`.
    ///
    /// Exporting a name again replaces the previous binding.
    pub fn export_binding(&mut self, name: &str, binding: Arc<dyn Binding>) -> Result<()> {
        self.ensure_usable()?;
        if self.bindings.insert(name, binding) {
            tracing::debug!(name, "redefining binding");
        }
        self.request(HostMessage::Export(name.to_string())).map(|_| ())
    }

    /// A binding that calls the peer function `name` on whichever bond
    /// invokes it.
    pub fn callable(name: &str) -> Arc<dyn Binding> {
        let name = name.to_string();
        TypedBinding::shared(move |bond: &mut Bond, args: Vec<Value>| {
            bond.call(&name, args).map_err(BindingError::from)
        })
    }

    /// Send end-of-stream to the peer.
    ///
    /// Only valid on an idle bond. Subsequent operations fail with
    /// [`BondError::Terminated`].
    pub fn close(&mut self) -> Result<()> {
        if self.depth > 0 {
            return Err(BondError::Protocol(String::from(
                "cannot close a bond from inside its response loop",
            )));
        }
        if self.state == BondState::Closed {
            return Ok(());
        }
        let result = self.transport.close();
        if self.state == BondState::Ready {
            self.state = BondState::Closed;
        }
        tracing::debug!(lang = %self.lang, "bond closed");
        result
    }

    // ========================================================================
    // Response loop
    // ========================================================================

    fn request(&mut self, message: HostMessage) -> Result<Value> {
        self.ensure_usable()?;
        // encode before writing anything, so local failures leave the peer untouched
        let frame = message.to_frame(self.protocol)?;
        self.write_frame(&frame)?;
        self.respond()
    }

    fn respond(&mut self) -> Result<Value> {
        let _active = self.shared.map(ActiveGuard::enter);
        self.depth += 1;
        let result = self.respond_loop();
        self.depth -= 1;
        result
    }

    fn respond_loop(&mut self) -> Result<Value> {
        loop {
            let line = match self.transport.read_line() {
                Ok(line) => line,
                Err(e) => return Err(self.fail(e)),
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let frame = match Frame::decode(&line) {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e)),
            };
            tracing::trace!(depth = self.depth, %frame, "<-");

            let message = match PeerMessage::from_frame(&frame, self.protocol) {
                Ok(message) => message,
                Err(e) if e.is_fatal() => return Err(self.fail(e)),
                // the terminal frame was consumed, the bond stays usable
                Err(e) if frame.verb.is_terminal() => return Err(e),
                Err(e) => match frame.verb {
                    Verb::Output => {
                        tracing::warn!(error = %e, "skipping undecodable output");
                        continue;
                    }
                    Verb::Call => {
                        // keep the peer in sync: its call still needs an answer
                        self.reply(HostMessage::Error(e.to_string()))?;
                        continue;
                    }
                    Verb::Bye => {
                        tracing::debug!(lang = %self.lang, error = %e, "peer terminated");
                        self.state = BondState::Terminated;
                        return Err(BondError::Terminated(None));
                    }
                    _ => return Err(self.fail(e)),
                },
            };

            match message {
                PeerMessage::Output { channel, text } => self.write_output(channel, &text),
                PeerMessage::Call { name, args } => self.dispatch(&name, args)?,
                PeerMessage::Return(value) => return Ok(value),
                PeerMessage::Except(data) => {
                    return Err(BondError::Remote(RemoteError::from_value(data)))
                }
                PeerMessage::Error(message) => {
                    return Err(BondError::Serialization {
                        side: Side::Remote,
                        message,
                    })
                }
                PeerMessage::Bye(reason) => {
                    tracing::debug!(lang = %self.lang, ?reason, "peer terminated");
                    self.state = BondState::Terminated;
                    return Err(BondError::Terminated(reason));
                }
            }
        }
    }

    /// Run a host binding for a peer `CALL` and send its answer.
    fn dispatch(&mut self, name: &str, args: Vec<Value>) -> Result<()> {
        let binding = match self.bindings.get(name) {
            Some(binding) => binding,
            None => {
                return Err(self.fail(BondError::Protocol(format!(
                    "peer called unknown binding {:?}",
                    name
                ))))
            }
        };

        tracing::trace!(depth = self.depth, name, "invoking binding");
        let outcome = binding.call(self, args);
        if self.state != BondState::Ready {
            // a nested request killed the bond; there is nobody to answer
            return Err(self.unusable());
        }

        let reply = match outcome {
            Ok(value) => HostMessage::Return(value),
            Err(BindingFailure::Raised(err)) => HostMessage::Except(self.except_payload(&err)),
            Err(BindingFailure::Unencodable(message)) => HostMessage::Error(message),
        };
        self.reply(reply)
    }

    /// Answer a peer `CALL`, downgrading to `ERROR` if the answer cannot
    /// be encoded.
    fn reply(&mut self, message: HostMessage) -> Result<()> {
        let frame = match message.to_frame(self.protocol) {
            Ok(frame) => frame,
            Err(e) => HostMessage::Error(e.to_string()).to_frame(self.protocol)?,
        };
        self.write_frame(&frame)
    }

    fn except_payload(&self, err: &BindingError) -> Value {
        if self.trans_except {
            json!({ "type": err.kind, "message": err.message })
        } else {
            Value::String(err.to_string())
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        tracing::trace!(depth = self.depth, %frame, "->");
        match self.transport.send(&frame.encode()) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write_output(&mut self, channel: Channel, text: &str) {
        let sink = match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        };
        if let Err(e) = sink.write_all(text.as_bytes()).and_then(|_| sink.flush()) {
            tracing::warn!(channel = channel.as_str(), error = %e, "cannot write peer output");
        }
    }

    /// Record a transport or protocol failure.
    fn fail(&mut self, err: BondError) -> BondError {
        if err.is_fatal() && self.state == BondState::Ready {
            tracing::error!(lang = %self.lang, error = %err, "bond broken");
            self.state = BondState::Broken;
        }
        err
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            BondState::Ready => Ok(()),
            _ => Err(self.unusable()),
        }
    }

    fn unusable(&self) -> BondError {
        match self.state {
            BondState::Closed => BondError::Terminated(Some(String::from("bond closed"))),
            BondState::Terminated => BondError::Terminated(Some(String::from("peer exited"))),
            BondState::Ready | BondState::Broken => {
                BondError::Protocol(String::from("bond is broken after a fatal error"))
            }
        }
    }
}

impl fmt::Debug for Bond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bond")
            .field("lang", &self.lang)
            .field("protocol", &self.protocol)
            .field("trans_except", &self.trans_except)
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl Drop for Bond {
    fn drop(&mut self) {
        if self.state == BondState::Ready && self.depth == 0 {
            let _ = self.close();
        }
    }
}

/// Export `name` from `source` into `other` as `remote` (default: `name`).
///
/// Calls made by `other`'s peer are forwarded to `source`'s peer. When
/// another thread is driving `source` the call waits for it. When `source`
/// is already running a response loop on the calling thread (a proxy
/// cycle), the peer receives an exception instead of the host deadlocking.
pub fn proxy(
    source: &SharedBond,
    name: &str,
    other: &mut Bond,
    remote: Option<&str>,
) -> Result<()> {
    let source = Arc::clone(source);
    let target = name.to_string();
    let binding = TypedBinding::shared(move |_bond: &mut Bond, args: Vec<Value>| {
        let key = shared_key(&source);
        if is_active(key) {
            return Err(BindingError::with_kind(
                "ProxyError",
                format!("proxy cycle: bond serving {} is already in use", target),
            ));
        }
        let mut bond = source.lock().map_err(|_| {
            BindingError::with_kind("ProxyError", format!("bond serving {} is poisoned", target))
        })?;
        // covers bonds shared without `into_shared`
        let _active = ActiveGuard::enter(key);
        bond.call(&target, args).map_err(BindingError::from)
    });
    other.export_binding(remote.unwrap_or(name), binding)
}

fn call_args<A: Serialize>(args: A) -> Result<Vec<Value>> {
    match serde_json::to_value(args).map_err(BondError::local_serialization)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(BondError::local_serialization(format!(
            "call arguments must be a sequence, got {}",
            other
        ))),
    }
}
