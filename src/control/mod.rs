//! Control module - drivers and the bootstrap handshake.
//!
//! Everything that happens before the first protocol frame:
//!
//! 1. Spawn one of the driver's candidate commands in a pty
//! 2. Probe the interactive prompt
//! 3. Inject the stage 1 loader
//! 4. Ship stage 2 and negotiate the serialization protocol
//! 5. Wait for `READY`

pub mod bootstrap;
mod driver;

pub use bootstrap::Handshake;
pub use driver::Driver;
