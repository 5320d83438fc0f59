//! # bond-client
//!
//! Drive an interactive language interpreter as a subprocess: evaluate
//! code in it, call its functions, and let it call back into host
//! functions, recursively and to any depth.
//!
//! The interpreter is not a purpose-built server. It is started at its
//! ordinary interactive prompt inside a pseudo-terminal and bootstrapped
//! into a protocol peer by typing a small loader into it.
//!
//! ## Architecture
//!
//! - **Bootstrap** (pty, plain text): probe the prompt, inject stage 1,
//!   ship stage 2 and negotiate the serialization protocol
//! - **Framing** (pty, one frame per line): `VERB [payload]`, with
//!   payloads encoded by the negotiated [`codec::Protocol`]
//!
//! ## Example
//!
//! ```ignore
//! use bond_client::Bond;
//! use serde_json::json;
//!
//! fn main() -> bond_client::Result<()> {
//!     let mut py = Bond::builder().spawn()?;
//!
//!     py.eval_block("def add(a, b): return a + b")?;
//!     assert_eq!(py.call("add", (1, 2))?, json!(3));
//!
//!     py.close()
//! }
//! ```

pub mod codec;
pub mod control;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod bond;

pub use bond::{
    proxy, Bond, BondBuilder, BondConfig, BondState, OutputSink, SharedBond, DEFAULT_TIMEOUT,
    TIMEOUT_ENV,
};
pub use error::{BindingError, BondError, RemoteError, Result, Side};
pub use protocol::Channel;
