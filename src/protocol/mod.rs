//! Protocol module - wire frames, chunking, and transit reassembly.
//!
//! This module implements the text protocol spoken over the socket:
//! - Frame builders and the inbound frame decoder
//! - Splitting of oversized calls into transit chunks
//! - Reassembly of chunked calls

mod chunking;
mod frame;
mod transit;

pub use chunking::{encode_frames, next_transit_id, split_chunks, MIN_TRANSIT_ID_LEN};
pub use frame::{
    decode, encode_call, encode_chunk, encode_data, encode_error, encode_transit_init, CallId,
    ChunkIndex, Inbound, RemoteError, Response, CHUNK_SEPARATOR, TERMINAL_INDEX,
};
pub use transit::{Reassembled, TransitError, TransitReassembler};
