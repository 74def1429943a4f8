//! # sockrpc
//!
//! Bidirectional JSON RPC over a message-oriented duplex socket.
//!
//! Both ends of the socket are symmetric peers: each keeps a table of named
//! methods the other side may call, and each can call the other's methods.
//!
//! ## Wire format
//!
//! Every message is one text frame:
//!
//! - call: `{"method": "...", "input": ..., "id": 1}`
//! - chunked call: `{"method": "...", "transit": "<id>", "id": 1}` followed by
//!   `"<id>.0.<data>"`, `"<id>.1.<data>"`, ..., `"<id>.-1.<data>"`
//! - response: `{"data": ..., "id": 1}` or `{"error": "...", "details": ..., "id": 1}`
//!
//! Calls whose serialized input exceeds the configured frame limit are split
//! into chunks and reassembled by the receiving peer before dispatch.
//!
//! ## Example
//!
//! ```ignore
//! use sockrpc::Peer;
//! use sockrpc::transport::memory_transport;
//!
//! #[tokio::main]
//! async fn main() -> sockrpc::Result<()> {
//!     let (connector, mut listener) = memory_transport();
//!
//!     let server = Peer::builder()
//!         .handle("add", |args: (i64, i64), ctx| async move {
//!             ctx.respond(&(args.0 + args.1))
//!         })
//!         .build();
//!     let client = Peer::builder().connector(connector).build();
//!
//!     client.connect("mem://server").await?;
//!     server.serve(listener.accept().await.unwrap());
//!
//!     let sum: i64 = client.call("add", &(2, 3)).await?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod caller;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod validate;

pub use config::{ChunkingConfig, FrameLimit, PeerConfig, ReconnectPolicy};
pub use connection::{ConnectionHandle, ConnectionState};
pub use error::{Result, SockRpcError};
pub use handler::{MethodTable, RequestContext};
pub use peer::{Peer, PeerBuilder};
pub use validate::{FnValidator, TypedValidator, ValidationError, ValidationErrors, Validator};
