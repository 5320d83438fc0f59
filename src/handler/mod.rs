//! Handler module - host functions callable from the peer.
//!
//! Provides:
//! - [`Binding`] - a host callable, invoked with the bond it was called on
//! - [`TypedBinding`] - closure adapter serializing any `Serialize` result
//! - [`BindingTable`] - exported bindings by name

mod registry;

pub use registry::{Binding, BindingFailure, BindingResult, BindingTable, TypedBinding};
