//! Request context for handlers.
//!
//! Provides the response primitives a handler uses to answer the caller:
//! - `respond` - send a `{"data"}` frame
//! - `error` - send an `{"error"}` frame
//! - `error_with_details` - send an `{"error", "details"}` frame
//!
//! Handlers are not required to respond. A handler that never calls any of
//! these leaves the remote caller waiting.
//!
//! # Example
//!
//! ```ignore
//! async fn echo_handler(data: String, ctx: RequestContext) -> Result<()> {
//!     ctx.respond(&data)
//! }
//!
//! async fn divide(args: (f64, f64), ctx: RequestContext) -> Result<()> {
//!     if args.1 == 0.0 {
//!         return ctx.error_with_details("division by zero", &args);
//!     }
//!     ctx.respond(&(args.0 / args.1))
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::protocol::CallId;

/// Context passed to method handlers and lifecycle hooks.
///
/// `RequestContext` is `Clone` and can be moved into spawned tasks; all
/// clones answer the same call.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Method name that was invoked.
    method: String,
    /// Correlation id from the call frame, echoed in responses.
    call_id: Option<CallId>,
    /// Connection the call arrived on.
    connection: ConnectionHandle,
}

impl RequestContext {
    /// Create a context for one invocation.
    pub fn new(method: impl Into<String>, call_id: Option<CallId>, connection: ConnectionHandle) -> Self {
        Self {
            method: method.into(),
            call_id,
            connection,
        }
    }

    /// Context with no connection behind it. Responses fail with
    /// [`SockRpcError::NotConnected`](crate::SockRpcError::NotConnected).
    pub fn detached(method: impl Into<String>) -> Self {
        Self::new(method, None, ConnectionHandle::detached())
    }

    /// Name of the invoked method.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Correlation id of the call, if the caller sent one.
    #[inline]
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    /// Connection the call arrived on.
    #[inline]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Send a successful response.
    pub fn respond<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        self.connection.send_data(data, self.call_id)
    }

    /// Send an error response.
    pub fn error(&self, message: &str) -> Result<()> {
        self.connection.send_error(message, None, self.call_id)
    }

    /// Send an error response with structured details.
    pub fn error_with_details<D: Serialize + ?Sized>(&self, message: &str, details: &D) -> Result<()> {
        let details = serde_json::to_value(details)?;
        self.connection.send_error(message, Some(&details), self.call_id)
    }

    /// Call a method back on the peer that sent this request.
    pub async fn call<T, R>(&self, method: &str, input: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.connection.call(method, input).await
    }
}
