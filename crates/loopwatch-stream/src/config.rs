use loopwatch_core::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;

use crate::policy::Backoff;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
pub const PUSH_STREAM_ATTEMPT_CAP: u32 = 2;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// What happens once the push-stream budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Go back to the primary socket and keep trying forever.
    #[default]
    Cycle,
    /// Stop in the `error` state until an explicit `connect()`.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// HTTP base of the backend, e.g. `http://127.0.0.1:8000`.
    pub api_base: String,
    /// Optional socket base that wins over `api_base` for endpoint derivation.
    pub socket_base: Option<String>,
    pub reconnect_attempts: u32,
    pub backoff: Backoff,
    pub push_stream_attempt_cap: u32,
    pub exhaustion_policy: ExhaustionPolicy,
    pub event_buffer: usize,
    pub max_frame_bytes: usize,
}

impl StreamConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Self::default()
        }
    }

    pub fn endpoint_base(&self) -> &str {
        self.socket_base
            .as_deref()
            .filter(|base| !base.trim().is_empty())
            .unwrap_or(&self.api_base)
    }

    pub fn push_stream_attempts(&self) -> u32 {
        self.reconnect_attempts.min(self.push_stream_attempt_cap)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            socket_base: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            backoff: Backoff::Linear {
                base: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            },
            push_stream_attempt_cap: PUSH_STREAM_ATTEMPT_CAP,
            exhaustion_policy: ExhaustionPolicy::Cycle,
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
