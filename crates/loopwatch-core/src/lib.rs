pub mod event;
pub mod frame;
pub mod normalize;

pub use event::{CanonicalUpdate, EventKind};
pub use frame::{FrameError, SseEvent, SseFrameDecoder};
pub use normalize::{normalize, normalize_text};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Client-to-server message. Only the primary socket carries these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn ping() -> Self {
        Self::new("ping", Value::Null)
    }

    pub fn subscribe(session_id: &str) -> Self {
        Self::new("subscribe", serde_json::json!({ "session_id": session_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_uses_type_key() {
        let rendered = serde_json::to_value(OutboundMessage::subscribe("s-1")).expect("encode");
        assert_eq!(
            rendered,
            serde_json::json!({"type": "subscribe", "data": {"session_id": "s-1"}})
        );
    }
}
