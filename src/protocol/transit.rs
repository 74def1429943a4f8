//! Reassembly of chunked calls.
//!
//! A [`TransitReassembler`] holds one buffer per in-flight transit. The
//! buffer is created by the transit-init frame and removed as soon as the
//! terminal chunk arrives, whether or not the payload parses. Transfers that
//! never finish are capped: once the limit is reached, new inits are
//! rejected until a live transit completes or the connection closes.
//!
//! # Example
//!
//! ```
//! use sockrpc::protocol::{ChunkIndex, TransitReassembler};
//! use serde_json::json;
//!
//! let mut transits = TransitReassembler::new();
//! transits.begin("t1", "upload", None).unwrap();
//! assert!(transits.push_chunk("t1", ChunkIndex::Seq(0), r#"{"a":"#).unwrap().is_none());
//!
//! let done = transits.push_chunk("t1", ChunkIndex::Terminal, "1}").unwrap().unwrap();
//! assert_eq!(done.method, "upload");
//! assert_eq!(done.input, json!({"a": 1}));
//! assert!(transits.is_empty());
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::config::DEFAULT_MAX_TRANSITS;

use serde_json::Value;
use thiserror::Error;

use super::frame::{CallId, ChunkIndex};

/// Reassembly failures. All of them are dropped by the dispatcher.
#[derive(Debug, Error)]
pub enum TransitError {
    /// A transit with this id is already in flight.
    #[error("transit {0} already in flight")]
    Collision(String),

    /// Too many transits are already in flight.
    #[error("transit {transit_id} rejected, {limit} transits already in flight")]
    TooManyTransits { transit_id: String, limit: usize },

    /// Chunk for a transit that was never announced (or already finished).
    #[error("unknown transit {0}")]
    UnknownTransit(String),

    /// The terminal chunk arrived with a hole in the index sequence.
    #[error("transit {transit_id} is missing chunk {index}")]
    MissingChunk { transit_id: String, index: u32 },

    /// The concatenated payload is not valid JSON.
    #[error("transit {transit_id} payload is not valid JSON: {source}")]
    InvalidPayload {
        transit_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A fully reassembled call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    /// Transit that carried the call.
    pub transit_id: String,
    /// Method named in the init frame.
    pub method: String,
    /// Call id named in the init frame.
    pub call_id: Option<CallId>,
    /// Parsed input.
    pub input: Value,
}

#[derive(Debug)]
struct TransitBuffer {
    method: String,
    call_id: Option<CallId>,
    chunks: BTreeMap<u32, String>,
}

/// In-progress chunked transfers keyed by transit id.
#[derive(Debug)]
pub struct TransitReassembler {
    buffers: HashMap<String, TransitBuffer>,
    limit: usize,
}

impl Default for TransitReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitReassembler {
    /// Create an empty reassembler with the default in-flight limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_TRANSITS)
    }

    /// Create an empty reassembler holding at most `limit` transits.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            limit,
        }
    }

    /// Start a transit. An id that is already live is rejected and the live
    /// buffer is left untouched, as is any init beyond the in-flight limit.
    pub fn begin(
        &mut self,
        transit_id: &str,
        method: &str,
        call_id: Option<CallId>,
    ) -> Result<(), TransitError> {
        if self.buffers.contains_key(transit_id) {
            return Err(TransitError::Collision(transit_id.to_string()));
        }
        if self.buffers.len() >= self.limit {
            return Err(TransitError::TooManyTransits {
                transit_id: transit_id.to_string(),
                limit: self.limit,
            });
        }

        self.buffers.insert(
            transit_id.to_string(),
            TransitBuffer {
                method: method.to_string(),
                call_id,
                chunks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Store one chunk.
    ///
    /// Returns `Ok(Some(..))` when the terminal chunk completes the transit,
    /// `Ok(None)` while more chunks are expected.
    pub fn push_chunk(
        &mut self,
        transit_id: &str,
        index: ChunkIndex,
        data: &str,
    ) -> Result<Option<Reassembled>, TransitError> {
        match index {
            ChunkIndex::Seq(n) => {
                let buffer = self
                    .buffers
                    .get_mut(transit_id)
                    .ok_or_else(|| TransitError::UnknownTransit(transit_id.to_string()))?;
                buffer.chunks.insert(n, data.to_string());
                Ok(None)
            }
            ChunkIndex::Terminal => {
                // Removed before anything can fail
                let buffer = self
                    .buffers
                    .remove(transit_id)
                    .ok_or_else(|| TransitError::UnknownTransit(transit_id.to_string()))?;
                Self::finish(transit_id, buffer, data).map(Some)
            }
        }
    }

    fn finish(
        transit_id: &str,
        buffer: TransitBuffer,
        terminal: &str,
    ) -> Result<Reassembled, TransitError> {
        let size = buffer.chunks.values().map(String::len).sum::<usize>() + terminal.len();
        let mut payload = String::with_capacity(size);

        for (expected, (&index, chunk)) in buffer.chunks.iter().enumerate() {
            if index as usize != expected {
                return Err(TransitError::MissingChunk {
                    transit_id: transit_id.to_string(),
                    index: expected as u32,
                });
            }
            payload.push_str(chunk);
        }
        payload.push_str(terminal);

        let input = serde_json::from_str(&payload).map_err(|source| {
            TransitError::InvalidPayload {
                transit_id: transit_id.to_string(),
                source,
            }
        })?;

        Ok(Reassembled {
            transit_id: transit_id.to_string(),
            method: buffer.method,
            call_id: buffer.call_id,
            input,
        })
    }

    /// Number of transits in flight.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True when no transit is in flight.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Maximum number of transits in flight.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drop every in-flight transit, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.buffers.len();
        self.buffers.clear();
        n
    }
}
