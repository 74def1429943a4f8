//! Peer configuration.
//!
//! Every struct here has a sensible [`Default`] and derives
//! `serde::Deserialize` with `#[serde(default)]`, so an embedding
//! application can load a partial JSON document:
//!
//! ```
//! use sockrpc::config::{FrameLimit, PeerConfig};
//!
//! let config = PeerConfig::from_json(r#"{
//!     "chunking": { "max_frame_size": 4096, "safety_margin": 32 },
//!     "reconnect": { "max_attempts": 3, "delay_ms": 250 }
//! }"#).unwrap();
//!
//! assert_eq!(config.chunking.max_frame_size, FrameLimit::Limited(4096));
//! assert_eq!(config.reconnect.max_attempts, 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SockRpcError};

/// Default safety margin subtracted from the frame limit.
pub const DEFAULT_SAFETY_MARGIN: usize = 0;

/// Default cap on chunked transfers a remote may have open on one connection.
pub const DEFAULT_MAX_TRANSITS: usize = 64;

/// Default number of connection attempts per connect sequence.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Maximum size of a single transport frame.
///
/// On the wire (and in JSON configuration) `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum FrameLimit {
    /// Never chunk.
    #[default]
    Unlimited,
    /// Frames must not exceed this many bytes.
    Limited(usize),
}

impl TryFrom<i64> for FrameLimit {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(FrameLimit::Unlimited),
            n if n >= 0 => Ok(FrameLimit::Limited(n as usize)),
            n => Err(format!("invalid max frame size {}, expected -1 or >= 0", n)),
        }
    }
}

impl From<FrameLimit> for i64 {
    fn from(limit: FrameLimit) -> Self {
        match limit {
            FrameLimit::Unlimited => -1,
            FrameLimit::Limited(n) => n as i64,
        }
    }
}

/// Chunking parameters for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Transport frame size limit.
    pub max_frame_size: FrameLimit,
    /// Bytes reserved below the limit.
    pub safety_margin: usize,
    /// Inbound transits kept in flight per connection; further inits are
    /// dropped.
    pub max_transits: usize,
}

impl ChunkingConfig {
    /// Chunking disabled.
    pub fn unlimited() -> Self {
        Self {
            max_frame_size: FrameLimit::Unlimited,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            max_transits: DEFAULT_MAX_TRANSITS,
        }
    }

    /// Limit frames to `max_frame_size` bytes minus `safety_margin`.
    pub fn limited(max_frame_size: usize, safety_margin: usize) -> Self {
        Self {
            max_frame_size: FrameLimit::Limited(max_frame_size),
            safety_margin,
            max_transits: DEFAULT_MAX_TRANSITS,
        }
    }

    /// Set `max_transits`.
    pub fn max_transits(mut self, max: usize) -> Self {
        self.max_transits = max;
        self
    }

    /// Reject limits that leave no room for a single byte.
    pub fn validate(&self) -> Result<()> {
        match self.max_frame_size {
            FrameLimit::Limited(n) if self.safety_margin >= n => Err(SockRpcError::Config(format!(
                "safety margin {} leaves nothing of max frame size {}",
                self.safety_margin, n
            ))),
            _ => Ok(()),
        }
    }

    /// Effective per-frame budget, `None` when unlimited.
    pub fn effective_limit(&self) -> Option<usize> {
        match self.max_frame_size {
            FrameLimit::Unlimited => None,
            FrameLimit::Limited(n) => Some(n.saturating_sub(self.safety_margin)),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Automatic reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether to reconnect after the socket closes.
    pub reconnect: bool,
    /// Total connection attempts per `connect()` sequence, the first included.
    pub max_attempts: u32,
    /// Fixed delay before each retry.
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
    /// Reset the attempt counter after every successful open.
    pub reset_on_open: bool,
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            reconnect: false,
            ..Self::default()
        }
    }

    /// Reconnect up to `max_attempts` total attempts, `delay` apart.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            reconnect: true,
            max_attempts,
            delay,
            reset_on_open: false,
        }
    }

    /// Set `reset_on_open`.
    pub fn reset_on_open(mut self, reset: bool) -> Self {
        self.reset_on_open = reset;
        self
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
            reset_on_open: false,
        }
    }
}

/// Complete peer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Outbound chunking.
    pub chunking: ChunkingConfig,
    /// Reconnection policy used by `connect()`.
    pub reconnect: ReconnectPolicy,
    /// Tag calls with correlation ids.
    pub correlate_calls: bool,
    /// Maximum handler tasks running at once.
    pub max_concurrent_handlers: usize,
}

impl PeerConfig {
    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            reconnect: ReconnectPolicy::default(),
            correlate_calls: true,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
