//! Outbound chunking.
//!
//! A call whose serialized input does not fit the configured frame budget
//! is sent as a transit: one init frame followed by chunk frames
//! `<transit>.<index>.<data>`. Each chunk frame, header included, stays
//! within `max_frame_size - safety_margin` bytes. The header length is
//! recomputed for every chunk because the index grows a digit at 10, 100,
//! and so on. The last chunk is always tagged `-1`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use super::frame::{
    encode_call, encode_chunk, encode_transit_init, CallId, ChunkIndex, TERMINAL_INDEX,
};
use crate::config::ChunkingConfig;
use crate::error::{Result, SockRpcError};

/// Process-wide transit counter.
static TRANSIT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Shortest id [`next_transit_id`] produces.
pub const MIN_TRANSIT_ID_LEN: usize = 9;

/// Generate a transit id.
///
/// Hex counter followed by 32 random bits (fixed width), so two ids from the
/// same process never collide and ids from different processes rarely do.
/// Never contains the chunk separator. At least [`MIN_TRANSIT_ID_LEN`]
/// characters long, so frame limits of 13 bytes or less cannot carry a
/// chunked call.
pub fn next_transit_id() -> String {
    let seq = TRANSIT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:08x}", seq, rand::random::<u32>())
}

/// Encode a call into one or more frames.
///
/// Returns exactly one call frame when chunking is disabled or the
/// serialized input fits the frame budget.
pub fn encode_frames(
    method: &str,
    input: &Value,
    call_id: Option<CallId>,
    config: &ChunkingConfig,
) -> Result<Vec<String>> {
    let limit = match config.effective_limit() {
        None => return Ok(vec![encode_call(method, input, call_id)?]),
        Some(limit) => limit,
    };

    let serialized = serde_json::to_string(input)?;
    if serialized.len() <= limit {
        return Ok(vec![encode_call(method, input, call_id)?]);
    }

    let transit_id = next_transit_id();
    let chunks = split_chunks(&transit_id, &serialized, limit)?;

    tracing::debug!(
        "Splitting {} call into {} chunks (transit {}, {} bytes)",
        method,
        chunks.len(),
        transit_id,
        serialized.len()
    );

    let mut frames = Vec::with_capacity(chunks.len() + 1);
    frames.push(encode_transit_init(method, &transit_id, call_id)?);
    frames.extend(chunks);
    Ok(frames)
}

/// Split `payload` into chunk frames no longer than `limit` bytes each.
pub fn split_chunks(transit_id: &str, payload: &str, limit: usize) -> Result<Vec<String>> {
    let too_small = || SockRpcError::FrameLimitTooSmall {
        limit,
        transit_id: transit_id.to_string(),
    };

    // "<id>." + "." around the index
    let fixed_overhead = transit_id.len() + 2;
    let terminal_overhead = fixed_overhead + TERMINAL_INDEX.len();
    if limit < terminal_overhead {
        return Err(too_small());
    }

    let mut frames = Vec::new();
    let mut rest = payload;
    let mut index: u32 = 0;

    loop {
        if rest.len() <= limit - terminal_overhead {
            frames.push(encode_chunk(transit_id, ChunkIndex::Terminal, rest));
            return Ok(frames);
        }

        let budget = limit.saturating_sub(fixed_overhead + decimal_len(index));
        let cut = floor_char_boundary(rest, budget);
        if cut == 0 {
            return Err(too_small());
        }

        let (head, tail) = rest.split_at(cut);
        frames.push(encode_chunk(transit_id, ChunkIndex::Seq(index), head));
        rest = tail;
        index = index.checked_add(1).ok_or_else(too_small)?;
    }
}

fn decimal_len(mut n: u32) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Largest char boundary `<= max`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Inbound};
    use serde_json::json;

    fn chunk_frames(frames: &[String]) -> Vec<(ChunkIndex, String)> {
        frames
            .iter()
            .skip(1)
            .map(|f| match decode(f) {
                Inbound::Chunk { index, data, .. } => (index, data),
                other => panic!("expected chunk, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_unlimited_yields_single_frame() {
        let frames = encode_frames("method", &json!({"a": 1}), None, &ChunkingConfig::unlimited())
            .unwrap();
        assert_eq!(frames, vec![r#"{"method":"method","input":{"a":1}}"#.to_string()]);
    }

    #[test]
    fn test_fitting_input_is_not_chunked() {
        let config = ChunkingConfig::limited(1024, 0);
        let frames = encode_frames("echo", &json!("small"), Some(1), &config).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_thirty_byte_limit_hundred_byte_payload() {
        // 98 characters plus the surrounding quotes
        let input = Value::String("x".repeat(98));
        assert_eq!(serde_json::to_string(&input).unwrap().len(), 100);

        let config = ChunkingConfig::limited(30, 0);
        let frames = encode_frames("method", &input, None, &config).unwrap();

        assert!(matches!(decode(&frames[0]), Inbound::TransitInit { .. }));
        assert!(frames.len() >= 5);

        for frame in &frames[1..] {
            assert!(frame.len() <= 30, "chunk frame too long: {}", frame);
        }

        let chunks = chunk_frames(&frames);
        let terminals = chunks.iter().filter(|(i, _)| i.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(chunks.last().unwrap().0.is_terminal());

        for (pos, (index, _)) in chunks[..chunks.len() - 1].iter().enumerate() {
            assert_eq!(*index, ChunkIndex::Seq(pos as u32));
        }

        let joined: String = chunks.iter().map(|(_, d)| d.as_str()).collect();
        assert_eq!(joined, serde_json::to_string(&input).unwrap());
    }

    #[test]
    fn test_margin_reduces_budget() {
        let input = Value::String("y".repeat(200));
        let config = ChunkingConfig::limited(64, 16);
        let frames = encode_frames("m", &input, None, &config).unwrap();
        assert!(frames.len() > 1);
        for frame in &frames[1..] {
            assert!(frame.len() <= 48);
        }
    }

    #[test]
    fn test_index_digit_growth_respects_limit() {
        let payload = "z".repeat(5000);
        let frames = split_chunks("tid", &payload, 20).unwrap();

        // more than 100 chunks, so three-digit indices appear
        assert!(frames.len() > 100);
        for frame in &frames {
            assert!(frame.len() <= 20, "{} exceeds 20 bytes", frame);
        }

        let data: String = frames
            .iter()
            .map(|f| f.splitn(3, '.').nth(2).unwrap())
            .collect();
        assert_eq!(data, payload);
    }

    #[test]
    fn test_multibyte_characters_are_not_split() {
        let payload = "é😀ü".repeat(40);
        let frames = split_chunks("t", &payload, 12).unwrap();
        let mut joined = String::new();
        for frame in &frames {
            assert!(frame.len() <= 12);
            joined.push_str(frame.splitn(3, '.').nth(2).unwrap());
        }
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_round_trip_for_many_limits() {
        let input = json!({
            "name": "round.trip",
            "values": [1, 2.5, -3, "four", null, true],
            "nested": {"text": "ünïcödé ✓ and more.dots..."}
        });
        let serialized = serde_json::to_string(&input).unwrap();

        for max in 24..=serialized.len() + 1 {
            let config = ChunkingConfig::limited(max, 0);
            let frames = encode_frames("m", &input, None, &config).unwrap();
            if frames.len() == 1 {
                assert!(serialized.len() <= max);
                continue;
            }
            let joined: String = chunk_frames(&frames).into_iter().map(|(_, d)| d).collect();
            assert_eq!(joined, serialized, "round trip failed at max {}", max);
        }
    }

    #[test]
    fn test_limit_too_small() {
        let err = split_chunks("abcdef", "payload", 8).unwrap_err();
        assert!(matches!(err, SockRpcError::FrameLimitTooSmall { limit: 8, .. }));

        // room for the terminal header but not for a character in a seq chunk
        assert!(split_chunks("ab", "ééé", 6).is_err());
    }

    #[test]
    fn test_smallest_usable_limit() {
        // 98 characters plus the surrounding quotes
        let payload = format!("\"{}\"", "x".repeat(98));
        let id = "0".repeat(MIN_TRANSIT_ID_LEN);

        // ten one-byte chunks, then index 10 leaves no room for data
        assert!(split_chunks(&id, &payload, 13).is_err());

        let frames = split_chunks(&id, &payload, 14).unwrap();
        assert!(frames.iter().all(|f| f.len() <= 14));
        assert!(frames.last().unwrap().starts_with(&format!("{}.-1.", id)));

        let input = Value::String("x".repeat(98));
        for max in 1..=13 {
            let err = encode_frames("m", &input, None, &ChunkingConfig::limited(max, 0));
            assert!(
                matches!(err, Err(SockRpcError::FrameLimitTooSmall { .. })),
                "limit {} accepted",
                max
            );
        }
    }

    #[test]
    fn test_transit_ids_are_unique_and_separator_free() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| next_transit_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| !id.contains('.')));
        assert!(ids.iter().all(|id| id.len() >= MIN_TRANSIT_ID_LEN));
    }

    #[test]
    fn test_decimal_len() {
        assert_eq!(decimal_len(0), 1);
        assert_eq!(decimal_len(9), 1);
        assert_eq!(decimal_len(10), 2);
        assert_eq!(decimal_len(999), 3);
        assert_eq!(decimal_len(1000), 4);
    }
}
