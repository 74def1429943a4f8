//! In-process socket pairs.
//!
//! `connect()` on a [`MemoryConnector`] creates a connected pair of
//! [`MemorySocket`]s and hands the far end to the matching
//! [`MemoryListener`]. Dialing fails once the listener is dropped.
//!
//! # Example
//!
//! ```
//! use sockrpc::transport::{memory_transport, Connector, SocketEvent};
//!
//! # tokio_test_block_on(async {
//! let (connector, mut listener) = memory_transport();
//! let mut client = connector.connect("mem://server").await.unwrap();
//! let mut server = listener.accept().await.unwrap();
//!
//! client.socket.send("hello".to_string()).unwrap();
//! assert_eq!(server.events.recv().await, Some(SocketEvent::Message("hello".to_string())));
//!
//! server.socket.close();
//! assert_eq!(client.events.recv().await, Some(SocketEvent::Close));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Connected, Connector, Socket, SocketEvent};
use crate::error::{Result, SockRpcError};
use crate::handler::BoxFuture;

/// Create a connector and the listener receiving its connections.
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx: tx,
            dials: Arc::new(AtomicUsize::new(0)),
        },
        MemoryListener { accept_rx: rx },
    )
}

/// One end of an in-process socket pair.
pub struct MemorySocket {
    /// Events for the other end.
    remote: mpsc::UnboundedSender<SocketEvent>,
    /// Events for this end (used to report our own close).
    local: mpsc::UnboundedSender<SocketEvent>,
    /// Shared by both ends.
    closed: Arc<AtomicBool>,
}

impl MemorySocket {
    /// Create a connected pair. Each side gets the other's messages.
    pub fn pair() -> (Connected, Connected) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let a = MemorySocket {
            remote: b_tx.clone(),
            local: a_tx.clone(),
            closed: closed.clone(),
        };
        let b = MemorySocket {
            remote: a_tx,
            local: b_tx,
            closed,
        };

        (
            Connected::new(Arc::new(a), a_rx),
            Connected::new(Arc::new(b), b_rx),
        )
    }

    /// True once either end closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Socket for MemorySocket {
    fn send(&self, frame: String) -> Result<()> {
        if self.is_closed() {
            return Err(SockRpcError::ConnectionClosed);
        }
        self.remote
            .send(SocketEvent::Message(frame))
            .map_err(|_| SockRpcError::ConnectionClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.remote.send(SocketEvent::Close);
        let _ = self.local.send(SocketEvent::Close);
    }
}

/// Dials the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<Connected>,
    dials: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Number of `connect()` calls so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::Acquire)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connected>> {
        self.dials.fetch_add(1, Ordering::AcqRel);
        let accept_tx = self.accept_tx.clone();
        let url = url.to_string();

        Box::pin(async move {
            let (local, remote) = MemorySocket::pair();
            accept_tx
                .send(remote)
                .map_err(|_| SockRpcError::Transport(format!("connection refused: {}", url)))?;
            tracing::debug!("Memory socket connected to {}", url);
            Ok(local)
        })
    }
}

/// Accepting side of [`memory_transport`].
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<Connected>,
}

impl MemoryListener {
    /// Wait for the next incoming connection. `None` once every connector
    /// has been dropped.
    pub async fn accept(&mut self) -> Option<Connected> {
        self.accept_rx.recv().await
    }
}
