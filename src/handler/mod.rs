//! Handler module - method table, request handling and dispatch.
//!
//! Provides:
//! - [`MethodTable`] - maps method names to handlers and validators
//! - [`RequestContext`] - lets handlers respond or call back
//! - [`Dispatcher`] - routes inbound frames to handlers
//!
//! # Example
//!
//! ```ignore
//! use sockrpc::handler::{MethodTable, RequestContext};
//!
//! let table = MethodTable::new();
//!
//! // Typed input, validated before the handler runs
//! table.register("add", |args: (i64, i64), ctx: RequestContext| async move {
//!     ctx.respond(&(args.0 + args.1))
//! });
//!
//! // Raw input
//! table.register("echo", |input: serde_json::Value, ctx: RequestContext| async move {
//!     ctx.respond(&input)
//! });
//! ```

mod context;
mod dispatch;
mod registry;

pub use context::RequestContext;
pub use dispatch::Dispatcher;
pub use registry::{
    BoxFuture, Handler, HandlerResult, MethodEntry, MethodTable, TypedHandler, HOOK_CLOSE,
    HOOK_ERROR, HOOK_OPEN,
};
