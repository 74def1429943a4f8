//! Transport module - the socket capability the peer is built on.
//!
//! The peer never opens sockets itself. It is given a [`Connector`] that
//! dials a URL and yields a [`Connected`] pair: a [`Socket`] for sending
//! discrete text messages and a channel of [`SocketEvent`]s for everything
//! the socket reports after it opened. A failed dial is the handshake
//! error; success is the open event.
//!
//! [`memory`] provides an in-process implementation.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::handler::BoxFuture;

pub mod memory;

pub use memory::{memory_transport, MemoryConnector, MemoryListener, MemorySocket};

/// Event delivered by an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One inbound text frame.
    Message(String),
    /// Transport-level error. The socket may still deliver a `Close`.
    Error(String),
    /// The socket closed; no further events follow.
    Close,
}

/// Sending half of an open socket.
pub trait Socket: Send + Sync + 'static {
    /// Queue one text frame.
    fn send(&self, frame: String) -> Result<()>;

    /// Close the socket. Idempotent.
    fn close(&self);
}

/// An open socket and its event stream.
pub struct Connected {
    /// Sending half.
    pub socket: Arc<dyn Socket>,
    /// Message, error and close events.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Connected {
    /// Bundle a socket with its events.
    pub fn new(socket: Arc<dyn Socket>, events: mpsc::UnboundedReceiver<SocketEvent>) -> Self {
        Self { socket, events }
    }
}

/// Socket factory injected into the peer.
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`. Resolves once the socket is open.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connected>>;
}
