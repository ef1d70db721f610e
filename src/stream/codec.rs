// =============================================================================
// Quote Wire Codec — "~m~<len>~m~<payload>" framing
// =============================================================================
//
// The upstream speaks a framed text protocol: each frame carries a decimal
// byte-length prefix, and several frames may be concatenated into a single
// WebSocket message. Payloads are either heartbeats ("~h~..."), which must be
// echoed back verbatim, or JSON objects.
// =============================================================================

use serde_json::Value;
use tracing::{debug, warn};

/// Frame delimiter.
pub const MESSAGE_PREFIX: &str = "~m~";

/// Heartbeat payload marker.
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Wrap a single payload in a length-prefixed frame. The length counts
/// UTF-8 bytes, not characters.
pub fn encode_payload(payload: &str) -> String {
    format!("{MESSAGE_PREFIX}{}{MESSAGE_PREFIX}{payload}", payload.len())
}

/// Serialize a JSON message and frame it.
pub fn encode_json(message: &Value) -> String {
    encode_payload(&message.to_string())
}

/// Frame a batch of JSON messages into one wire string.
pub fn encode_messages(messages: &[Value]) -> String {
    messages.iter().map(encode_json).collect()
}

/// Greedily split a wire message into its payload strings. Stops at the
/// first malformed prefix; a truncated trailing frame yields nothing for
/// that frame.
pub fn decode_frames(msg: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut rest = msg;

    while let Some(stripped) = rest.strip_prefix(MESSAGE_PREFIX) {
        let Some(sep) = stripped.find(MESSAGE_PREFIX) else {
            break;
        };
        let Ok(length) = stripped[..sep].parse::<usize>() else {
            warn!(prefix = stripped.get(..sep.min(16)).unwrap_or(""), "bad frame length prefix");
            break;
        };

        let start = sep + MESSAGE_PREFIX.len();
        let end = start + length;
        // Length is in bytes; reject frames that split a UTF-8 boundary or
        // overrun the buffer.
        let Some(payload) = stripped.get(start..end) else {
            warn!(length, "truncated frame");
            break;
        };

        payloads.push(payload.to_string());
        rest = &stripped[end..];
    }

    payloads
}

/// A classified frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Heartbeat — the exact payload must be echoed back framed.
    Heartbeat(String),
    /// Parsed JSON message.
    Json(Value),
}

/// Classify a decoded payload. Anything that is neither a heartbeat nor
/// parsable JSON is logged and discarded.
pub fn classify_payload(payload: &str) -> Option<Payload> {
    if payload.starts_with(HEARTBEAT_PREFIX) {
        return Some(Payload::Heartbeat(payload.to_string()));
    }
    if payload.starts_with('{') {
        match serde_json::from_str::<Value>(payload) {
            Ok(v) => return Some(Payload::Json(v)),
            Err(e) => {
                warn!(error = %e, head = &payload[..payload.len().min(100)], "failed to parse JSON payload");
                return None;
            }
        }
    }
    debug!(head = &payload[..payload.len().min(64)], "discarding unrecognized payload");
    None
}
