//! Binding table for host functions exported to the peer.
//!
//! The table maps exported names to callables. Entries are created by
//! `export` and never removed; exporting a name again replaces the binding.
//!
//! # Example
//!
//! ```
//! use bond_client::handler::{BindingTable, TypedBinding};
//! use bond_client::BindingError;
//! use serde_json::Value;
//!
//! let mut table = BindingTable::new();
//! table.insert(
//!     "count",
//!     TypedBinding::shared(|_bond, args: Vec<Value>| Ok::<_, BindingError>(args.len())),
//! );
//! assert!(table.contains("count"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::bond::Bond;
use crate::error::BindingError;

/// Why a binding produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingFailure {
    /// The function failed; answered with `EXCEPT`.
    Raised(BindingError),
    /// The return value could not be serialized; answered with `ERROR`.
    Unencodable(String),
}

impl From<BindingError> for BindingFailure {
    fn from(err: BindingError) -> Self {
        BindingFailure::Raised(err)
    }
}

/// Result type for binding invocations.
pub type BindingResult = std::result::Result<Value, BindingFailure>;

/// A host function callable from the peer.
///
/// Receives the bond it was invoked through, so it may issue nested
/// `eval`/`call` requests on it.
pub trait Binding: Send + Sync + 'static {
    /// Invoke with positional arguments.
    fn call(&self, bond: &mut Bond, args: Vec<Value>) -> BindingResult;
}

/// Wrapper that serializes the closure's return value.
pub struct TypedBinding<F, R>
where
    F: Fn(&mut Bond, Vec<Value>) -> std::result::Result<R, BindingError> + Send + Sync + 'static,
    R: Serialize + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> R>,
}

impl<F, R> TypedBinding<F, R>
where
    F: Fn(&mut Bond, Vec<Value>) -> std::result::Result<R, BindingError> + Send + Sync + 'static,
    R: Serialize + 'static,
{
    /// Create a new typed binding.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }

    /// Create a typed binding ready for a [`BindingTable`].
    pub fn shared(handler: F) -> Arc<dyn Binding> {
        Arc::new(Self::new(handler))
    }
}

impl<F, R> Binding for TypedBinding<F, R>
where
    F: Fn(&mut Bond, Vec<Value>) -> std::result::Result<R, BindingError> + Send + Sync + 'static,
    R: Serialize + 'static,
{
    fn call(&self, bond: &mut Bond, args: Vec<Value>) -> BindingResult {
        let ret = (self.handler)(bond, args)?;
        serde_json::to_value(ret).map_err(|e| BindingFailure::Unencodable(e.to_string()))
    }
}

/// Exported host functions by name.
#[derive(Default)]
pub struct BindingTable {
    bindings: HashMap<String, Arc<dyn Binding>>,
}

impl BindingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `binding` under `name`. Returns true if it replaced one.
    pub fn insert(&mut self, name: impl Into<String>, binding: Arc<dyn Binding>) -> bool {
        self.bindings.insert(name.into(), binding).is_some()
    }

    /// Look up a binding.
    ///
    /// The returned handle is independent of the table, so the caller may
    /// keep using the bond while it runs.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Binding>> {
        self.bindings.get(name).cloned()
    }

    /// Check if `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Exported names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for BindingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingTable")
            .field("names", &self.names())
            .finish()
    }
}
