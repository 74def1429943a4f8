//! Inbound frame routing.
//!
//! Every text frame read from a socket goes through
//! [`Dispatcher::handle`]:
//!
//! - whole calls are validated and handed to their handler
//! - transit inits and chunks feed the connection's reassembler; the
//!   terminal chunk yields a call that is dispatched like a whole one
//! - responses resolve the connection's pending calls
//! - anything else is logged and dropped
//!
//! Handlers run on their own tasks, capped by a semaphore. Inbound frames
//! never produce an automatic response: unknown methods, invalid input and
//! handler failures are logged, and handler failures additionally reach
//! the error hook.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::registry::{MethodTable, HOOK_ERROR};
use super::RequestContext;
use crate::connection::ConnectionHandle;
use crate::error::SockRpcError;
use crate::protocol::{decode, CallId, Inbound};

/// Routes inbound frames to handlers.
pub struct Dispatcher {
    methods: Arc<MethodTable>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a dispatcher over `methods` running at most
    /// `max_concurrent` handlers at once.
    pub fn new(methods: Arc<MethodTable>, max_concurrent: usize) -> Self {
        Self {
            methods,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// The method table calls are dispatched against.
    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    /// Handlers that could start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Route one inbound frame received on `conn`.
    pub fn handle(&self, frame: &str, conn: &ConnectionHandle) {
        match decode(frame) {
            Inbound::Whole {
                method,
                input,
                call_id,
            } => self.invoke(&method, input, call_id, conn),
            Inbound::TransitInit {
                transit_id,
                method,
                call_id,
            } => {
                if let Err(e) = conn.lock_transits().begin(&transit_id, &method, call_id) {
                    tracing::warn!("Connection {}: {}", conn.id(), e);
                }
            }
            Inbound::Chunk {
                transit_id,
                index,
                data,
            } => {
                let assembled = conn.lock_transits().push_chunk(&transit_id, index, &data);
                match assembled {
                    Ok(Some(call)) => self.invoke(&call.method, call.input, call.call_id, conn),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Connection {}: {}", conn.id(), e),
                }
            }
            Inbound::Response(response) => {
                conn.resolve(response);
            }
            Inbound::Malformed(reason) => {
                tracing::warn!("Connection {}: dropping malformed frame: {}", conn.id(), reason);
            }
        }
    }

    fn invoke(&self, method: &str, input: Value, call_id: Option<CallId>, conn: &ConnectionHandle) {
        let Some(entry) = self.methods.get(method) else {
            tracing::warn!("Connection {}: no handler for method {}", conn.id(), method);
            return;
        };

        let input = match &entry.schema {
            Some(schema) => match schema.validate(&input) {
                Ok(validated) => validated,
                Err(errors) => {
                    tracing::warn!(
                        connection = conn.id(),
                        method,
                        errors = %errors.to_value(),
                        "Input validation failed"
                    );
                    return;
                }
            },
            None => input,
        };

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    "Connection {}: too many concurrent handlers, dropping call to {}",
                    conn.id(),
                    method
                );
                return;
            }
        };

        let methods = Arc::clone(&self.methods);
        let ctx = RequestContext::new(method, call_id, conn.clone());
        let conn = conn.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let method = ctx.method().to_string();
            if let Err(e) = entry.handler.call(input, ctx).await {
                tracing::error!("Handler error for method {}: {}", method, e);
                if method != HOOK_ERROR {
                    let message = match e {
                        SockRpcError::Handler(message) => message,
                        other => other.to_string(),
                    };
                    run_hook(&methods, HOOK_ERROR, json!({ "error": message }), conn).await;
                }
            }
        });
    }

    /// Invoke a lifecycle hook on its own task, if one is registered.
    ///
    /// Hook input skips schema validation. Hook failures are logged and
    /// otherwise ignored.
    pub fn spawn_hook(&self, name: &'static str, input: Value, conn: ConnectionHandle) {
        if !self.methods.contains(name) {
            return;
        }
        let methods = Arc::clone(&self.methods);
        tokio::spawn(async move {
            run_hook(&methods, name, input, conn).await;
        });
    }
}

async fn run_hook(methods: &MethodTable, name: &str, input: Value, conn: ConnectionHandle) {
    let Some(entry) = methods.get(name) else {
        return;
    };
    let ctx = RequestContext::new(name, None, conn);
    if let Err(e) = entry.handler.call(input, ctx).await {
        tracing::error!("{} hook failed: {}", name, e);
    }
}
