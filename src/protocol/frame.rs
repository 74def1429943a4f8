//! Wire frames: builders for outbound text frames and the inbound decoder.
//!
//! Five frame kinds share one text socket:
//!
//! | Kind | Format |
//! |---|---|
//! | call | `{"method": m, "input": v, "id"?: n}` |
//! | transit init | `{"method": m, "transit": t, "id"?: n}` |
//! | chunk | `<t>.<index>.<raw data>`, index `-1` terminates |
//! | data response | `{"data": v, "id"?: n}` |
//! | error response | `{"error": s, "details"?: v, "id"?: n}` |
//!
//! # Example
//!
//! ```
//! use sockrpc::protocol::{decode, encode_call, Inbound};
//! use serde_json::json;
//!
//! let frame = encode_call("add", &json!([1, 2]), Some(7)).unwrap();
//! match decode(&frame) {
//!     Inbound::Whole { method, input, call_id } => {
//!         assert_eq!(method, "add");
//!         assert_eq!(input, json!([1, 2]));
//!         assert_eq!(call_id, Some(7));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, SockRpcError};

/// Separator between transit id, chunk index and chunk data.
pub const CHUNK_SEPARATOR: char = '.';

/// Index text carried by the terminal chunk.
pub const TERMINAL_INDEX: &str = "-1";

/// Correlation id pairing a call with its response.
pub type CallId = u64;

/// Position of a chunk within a transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkIndex {
    /// Ordinary chunk, numbered from 0 in send order.
    Seq(u32),
    /// Last chunk of the transit (`-1` on the wire).
    Terminal,
}

impl ChunkIndex {
    /// Parse the index field of a chunk frame.
    pub fn parse(s: &str) -> Option<Self> {
        if s == TERMINAL_INDEX {
            return Some(ChunkIndex::Terminal);
        }
        // u32::from_str accepts a leading '+', the wire format does not
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok().map(ChunkIndex::Seq)
    }

    /// True for the `-1` chunk.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkIndex::Terminal)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkIndex::Seq(n) => write!(f, "{}", n),
            ChunkIndex::Terminal => f.write_str(TERMINAL_INDEX),
        }
    }
}

/// Error half of a response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Error message.
    pub message: String,
    /// Optional structured details.
    pub details: Option<Value>,
}

impl From<RemoteError> for SockRpcError {
    fn from(e: RemoteError) -> Self {
        SockRpcError::Remote {
            message: e.message,
            details: e.details,
        }
    }
}

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echoed call id, absent for peers that do not correlate.
    pub call_id: Option<CallId>,
    /// `data` on success, `error` otherwise.
    pub outcome: std::result::Result<Value, RemoteError>,
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Complete call in a single frame.
    Whole {
        method: String,
        input: Value,
        call_id: Option<CallId>,
    },
    /// Announces a chunked call.
    TransitInit {
        transit_id: String,
        method: String,
        call_id: Option<CallId>,
    },
    /// One fragment of a chunked call.
    Chunk {
        transit_id: String,
        index: ChunkIndex,
        data: String,
    },
    /// Answer to one of our calls.
    Response(Response),
    /// Unusable frame, with the reason.
    Malformed(String),
}

#[derive(Serialize)]
struct CallFrame<'a> {
    method: &'a str,
    input: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CallId>,
}

#[derive(Serialize)]
struct TransitInitFrame<'a> {
    method: &'a str,
    transit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CallId>,
}

#[derive(Serialize)]
struct DataFrame<'a, T: Serialize + ?Sized> {
    data: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CallId>,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CallId>,
}

/// Build a single-frame call.
pub fn encode_call(method: &str, input: &Value, call_id: Option<CallId>) -> Result<String> {
    Ok(serde_json::to_string(&CallFrame {
        method,
        input,
        id: call_id,
    })?)
}

/// Build the frame announcing a chunked call.
pub fn encode_transit_init(
    method: &str,
    transit_id: &str,
    call_id: Option<CallId>,
) -> Result<String> {
    Ok(serde_json::to_string(&TransitInitFrame {
        method,
        transit: transit_id,
        id: call_id,
    })?)
}

/// Build a chunk frame. `data` is copied verbatim.
pub fn encode_chunk(transit_id: &str, index: ChunkIndex, data: &str) -> String {
    format!(
        "{}{}{}{}{}",
        transit_id, CHUNK_SEPARATOR, index, CHUNK_SEPARATOR, data
    )
}

/// Build a success response frame.
pub fn encode_data<T: Serialize + ?Sized>(data: &T, call_id: Option<CallId>) -> Result<String> {
    Ok(serde_json::to_string(&DataFrame { data, id: call_id })?)
}

/// Build an error response frame.
pub fn encode_error(
    message: &str,
    details: Option<&Value>,
    call_id: Option<CallId>,
) -> Result<String> {
    Ok(serde_json::to_string(&ErrorFrame {
        error: message,
        details,
        id: call_id,
    })?)
}

/// Classify an inbound text frame.
///
/// JSON objects are calls, transit inits or responses. Anything that is not
/// JSON but holds two separators is a chunk; the data part keeps any
/// further separators verbatim.
pub fn decode(frame: &str) -> Inbound {
    match serde_json::from_str::<Value>(frame) {
        Ok(Value::Object(map)) => decode_object(map),
        Ok(_) => Inbound::Malformed("frame is JSON but not an object".to_string()),
        Err(_) => decode_chunk(frame),
    }
}

fn decode_object(mut map: Map<String, Value>) -> Inbound {
    let call_id = map.get("id").and_then(Value::as_u64);

    if let Some(transit) = map.get("transit") {
        return match (transit.as_str(), map.get("method").and_then(Value::as_str)) {
            (Some(transit_id), Some(method)) if !transit_id.is_empty() => Inbound::TransitInit {
                transit_id: transit_id.to_string(),
                method: method.to_string(),
                call_id,
            },
            _ => Inbound::Malformed("transit init needs string method and transit".to_string()),
        };
    }

    if let Some(method) = map.get("method") {
        let method = match method.as_str() {
            Some(m) => m.to_string(),
            None => return Inbound::Malformed("method must be a string".to_string()),
        };
        let input = map.remove("input").unwrap_or(Value::Null);
        return Inbound::Whole {
            method,
            input,
            call_id,
        };
    }

    if let Some(error) = map.remove("error") {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Inbound::Response(Response {
            call_id,
            outcome: Err(RemoteError {
                message,
                details: map.remove("details"),
            }),
        });
    }

    if let Some(data) = map.remove("data") {
        return Inbound::Response(Response {
            call_id,
            outcome: Ok(data),
        });
    }

    Inbound::Malformed("object carries neither method, transit, data nor error".to_string())
}

fn decode_chunk(frame: &str) -> Inbound {
    let mut parts = frame.splitn(3, CHUNK_SEPARATOR);
    let (transit_id, index, data) = match (parts.next(), parts.next(), parts.next()) {
        (Some(t), Some(i), Some(d)) => (t, i, d),
        _ => return Inbound::Malformed("not JSON and not a chunk frame".to_string()),
    };

    if transit_id.is_empty() {
        return Inbound::Malformed("chunk frame with empty transit id".to_string());
    }

    match ChunkIndex::parse(index) {
        Some(index) => Inbound::Chunk {
            transit_id: transit_id.to_string(),
            index,
            data: data.to_string(),
        },
        None => Inbound::Malformed(format!("invalid chunk index {:?}", index)),
    }
}
