//! Peer builder and runtime.
//!
//! The [`PeerBuilder`] provides a fluent API for registering handlers and
//! hooks and choosing chunking, correlation and reconnection settings. The
//! [`Peer`] then either dials out through its [`Connector`] (with
//! reconnection) or serves sockets it is handed (without).
//!
//! # Example
//!
//! ```ignore
//! use sockrpc::{Peer, ReconnectPolicy};
//! use sockrpc::transport::memory_transport;
//!
//! #[tokio::main]
//! async fn main() -> sockrpc::Result<()> {
//!     let (connector, _listener) = memory_transport();
//!     let peer = Peer::builder()
//!         .connector(connector)
//!         .handle("echo", |data: String, ctx| async move { ctx.respond(&data) })
//!         .on_open(|_: (), _ctx| async {
//!             tracing::info!("connected");
//!             Ok(())
//!         })
//!         .build();
//!
//!     peer.connect("mem://server").await?;
//!     let sum: i64 = peer.call("add", &(1, 2)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::{ChunkingConfig, FrameLimit, PeerConfig, ReconnectPolicy};
use crate::connection::{
    self, ConnectionEvents, ConnectionHandle, ConnectionManager, ConnectionState,
};
use crate::error::{Result, SockRpcError};
use crate::handler::{
    BoxFuture, Dispatcher, HandlerResult, MethodTable, RequestContext, HOOK_CLOSE, HOOK_ERROR,
    HOOK_OPEN,
};
use crate::transport::{Connected, Connector};
use crate::validate::Validator;

/// Connector for peers that only serve accepted sockets.
struct NoConnector;

impl Connector for NoConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connected>> {
        let message = format!("no connector configured to dial {}", url);
        Box::pin(async move { Err(SockRpcError::Transport(message)) })
    }
}

/// Shared between the peer and its connection tasks.
struct PeerCore {
    dispatcher: Dispatcher,
}

impl ConnectionEvents for PeerCore {
    fn on_open(&self, conn: &ConnectionHandle) {
        self.dispatcher.spawn_hook(HOOK_OPEN, Value::Null, conn.clone());
    }

    fn on_message(&self, frame: String, conn: &ConnectionHandle) {
        self.dispatcher.handle(&frame, conn);
    }

    fn on_error(&self, message: &str, conn: Option<&ConnectionHandle>) {
        let conn = conn.cloned().unwrap_or_else(ConnectionHandle::detached);
        self.dispatcher
            .spawn_hook(HOOK_ERROR, json!({ "error": message }), conn);
    }

    fn on_close(&self, conn: Option<&ConnectionHandle>) {
        let conn = conn.cloned().unwrap_or_else(ConnectionHandle::detached);
        self.dispatcher.spawn_hook(HOOK_CLOSE, Value::Null, conn);
    }
}

/// Builder for configuring and creating a [`Peer`].
pub struct PeerBuilder {
    methods: MethodTable,
    connector: Option<Arc<dyn Connector>>,
    config: PeerConfig,
}

impl PeerBuilder {
    /// Create a new peer builder with default settings.
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new(),
            connector: None,
            config: PeerConfig::default(),
        }
    }

    /// Socket factory used by [`Peer::connect`].
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Replace every setting at once.
    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the chunking configuration.
    pub fn chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.config.chunking = chunking;
        self
    }

    /// Set the maximum frame size.
    ///
    /// Default: unlimited
    pub fn max_frame_size(mut self, limit: FrameLimit) -> Self {
        self.config.chunking.max_frame_size = limit;
        self
    }

    /// Set the bytes kept free below the maximum frame size.
    ///
    /// Must stay below the maximum frame size. Default: 0
    pub fn safety_margin(mut self, margin: usize) -> Self {
        self.config.chunking.safety_margin = margin;
        self
    }

    /// Cap the chunked transfers a remote may have in flight per connection.
    ///
    /// Default: 64
    pub fn max_transits(mut self, max: usize) -> Self {
        self.config.chunking.max_transits = max;
        self
    }

    /// Set the reconnection policy used by [`Peer::connect`].
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Send call ids and match responses by id.
    ///
    /// Default: true
    pub fn correlate_calls(mut self, correlate: bool) -> Self {
        self.config.correlate_calls = correlate;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, new calls are dropped with a warning.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Register a method handler. Inputs that do not deserialize into `T`
    /// are rejected before the handler runs.
    pub fn handle<F, T, Fut>(self, method: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.register(method, handler);
        self
    }

    /// Register a method handler behind a custom validator.
    ///
    /// The handler receives the validator's output.
    pub fn handle_validated<F, T, Fut>(
        self,
        method: &str,
        schema: impl Validator,
        handler: F,
    ) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let schema: Arc<dyn Validator> = Arc::new(schema);
        self.methods
            .register_with_schema(method, Some(schema), handler);
        self
    }

    /// Hook run after each socket opens. Receives `null`.
    pub fn on_open<F, T, Fut>(self, hook: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.register_with_schema(HOOK_OPEN, None, hook);
        self
    }

    /// Hook run after each socket closes and after each failed
    /// reconnection attempt. Receives `null`.
    pub fn on_close<F, T, Fut>(self, hook: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.register_with_schema(HOOK_CLOSE, None, hook);
        self
    }

    /// Hook run on socket errors, failed dials and handler failures.
    /// Receives `{"error": message}`.
    pub fn on_error<F, T, Fut>(self, hook: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.register_with_schema(HOOK_ERROR, None, hook);
        self
    }

    /// Build the peer, rejecting settings that cannot work together.
    pub fn try_build(self) -> Result<Peer> {
        self.config.validate()?;
        Ok(self.build())
    }

    /// Build the peer. Nothing is dialed yet.
    ///
    /// Settings are not checked; see [`PeerBuilder::try_build`].
    pub fn build(self) -> Peer {
        let methods = Arc::new(self.methods);
        let core = Arc::new(PeerCore {
            dispatcher: Dispatcher::new(methods, self.config.max_concurrent_handlers),
        });
        let events: Arc<dyn ConnectionEvents> = core.clone();
        let connector = self.connector.unwrap_or_else(|| Arc::new(NoConnector));
        let manager = ConnectionManager::new(
            connector,
            events,
            self.config.chunking,
            self.config.correlate_calls,
        );

        Peer {
            core,
            manager,
            config: self.config,
        }
    }
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of the RPC link.
///
/// Both sides are symmetric: either may call methods the other registered.
pub struct Peer {
    core: Arc<PeerCore>,
    manager: ConnectionManager,
    config: PeerConfig,
}

impl Peer {
    /// Create a new peer builder.
    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    /// Dial `url` with the configured reconnection policy.
    ///
    /// Resolves once the socket is open. A failed first dial is returned and
    /// not retried; later disconnects are retried per the policy.
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.connect_with(url, self.config.reconnect).await
    }

    /// Dial `url` with an explicit reconnection policy.
    pub async fn connect_with(&self, url: &str, policy: ReconnectPolicy) -> Result<()> {
        self.manager.connect(url, policy).await.map(|_| ())
    }

    /// Serve an already-open socket, typically one accepted by a listener.
    ///
    /// Served sockets are never reconnected. The returned handle can be used
    /// to call methods on that particular remote.
    pub fn serve(&self, connected: Connected) -> ConnectionHandle {
        let Connected { socket, events } = connected;
        let conn = ConnectionHandle::new(
            socket,
            self.config.chunking,
            self.config.correlate_calls,
        );
        let core: Arc<dyn ConnectionEvents> = self.core.clone();
        connection::serve(core, conn.clone(), events);
        conn
    }

    /// Call a method on the peer at the other end of the dialed connection.
    pub async fn call<T, R>(&self, method: &str, input: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let conn = self.manager.current().ok_or(SockRpcError::NotConnected)?;
        conn.call(method, input).await
    }

    /// Close the dialed connection and cancel any pending reconnection.
    pub fn close(&self) {
        self.manager.close();
    }

    /// The dialed connection, if open.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.manager.current()
    }

    /// The method table, for changing handlers at runtime.
    pub fn methods(&self) -> &MethodTable {
        self.core.dispatcher.methods()
    }

    /// Current state of the dialed connection.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch state transitions of the dialed connection.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe()
    }

    /// Connection attempts made in the current connect sequence.
    pub fn attempts(&self) -> u32 {
        self.manager.attempts()
    }

    /// Settings the peer was built with.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }
}
