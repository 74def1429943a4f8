//! Method table for dispatching calls by name.
//!
//! The table maps method names to a handler and an optional input
//! validator. It is shared between the peer and every connection task, so
//! all operations take `&self` and entries can be added, swapped or removed
//! while the peer is running. A lookup clones the entry's `Arc`s; an
//! invocation already in progress keeps the handler it started with.
//!
//! Three names are reserved for lifecycle hooks: [`HOOK_OPEN`],
//! [`HOOK_CLOSE`] and [`HOOK_ERROR`]. A remote peer calling one of them by
//! name reaches the hook like any other method.
//!
//! # Example
//!
//! ```ignore
//! use sockrpc::handler::{MethodTable, RequestContext};
//!
//! let table = MethodTable::new();
//!
//! table.register("echo", |data: String, ctx: RequestContext| async move {
//!     ctx.respond(&data)
//! });
//!
//! assert!(table.contains("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::RequestContext;
use crate::error::Result;
use crate::validate::{TypedValidator, Validator};

/// Hook invoked after a socket opens.
pub const HOOK_OPEN: &str = "open";

/// Hook invoked after a socket closes or a reconnection attempt fails.
pub const HOOK_CLOSE: &str = "close";

/// Hook invoked on socket errors and handler failures, with
/// `{"error": message}` as input.
pub const HOOK_ERROR: &str = "error";

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with its JSON input.
    fn call(&self, input: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the input before calling the handler.
///
/// Use `T = serde_json::Value` to receive the input untouched.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, input: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(fut)
    }
}

/// Entry for a registered method.
#[derive(Clone)]
pub struct MethodEntry {
    /// The handler function.
    pub handler: Arc<dyn Handler>,
    /// Validator run on the input before the handler, if any.
    pub schema: Option<Arc<dyn Validator>>,
}

/// Table mapping method names to handlers.
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<HashMap<String, MethodEntry>>,
}

impl MethodTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MethodEntry>> {
        self.methods
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MethodEntry>> {
        self.methods
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a typed handler. The input type doubles as the schema:
    /// inputs that do not deserialize into `T` are rejected before the
    /// handler runs.
    ///
    /// Replaces any existing entry under `name`.
    pub fn register<F, T, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(
            name,
            MethodEntry {
                handler: Arc::new(TypedHandler::new(handler)),
                schema: Some(Arc::new(TypedValidator::<T>::new())),
            },
        );
    }

    /// Register a handler with an explicit validator, or none.
    pub fn register_with_schema<F, T, Fut>(
        &self,
        name: &str,
        schema: Option<Arc<dyn Validator>>,
        handler: F,
    ) where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(
            name,
            MethodEntry {
                handler: Arc::new(TypedHandler::new(handler)),
                schema,
            },
        );
    }

    /// Insert a prepared entry, replacing any existing one.
    pub fn insert(&self, name: &str, entry: MethodEntry) {
        if self.write().insert(name.to_string(), entry).is_some() {
            tracing::debug!("Replaced handler for method {}", name);
        }
    }

    /// Swap the handler of an existing method, keeping its schema.
    ///
    /// Returns false if no such method is registered.
    pub fn set_handler<F, T, Fut>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        match self.write().get_mut(name) {
            Some(entry) => {
                entry.handler = Arc::new(TypedHandler::new(handler));
                true
            }
            None => false,
        }
    }

    /// Replace or clear the validator of an existing method.
    ///
    /// Returns false if no such method is registered.
    pub fn set_schema(&self, name: &str, schema: Option<Arc<dyn Validator>>) -> bool {
        match self.write().get_mut(name) {
            Some(entry) => {
                entry.schema = schema;
                true
            }
            None => false,
        }
    }

    /// Remove a method. Returns false if it was not registered.
    pub fn remove(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<MethodEntry> {
        self.read().get(name).cloned()
    }

    /// Check if a method is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered methods, hooks included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
