//! Display text for captured payloads.

use serde_json::Value;

use crate::capture::{RpcStatus, STREAM_END_MARKER};
use crate::live::{self, LiveValue};

pub use crate::live::CIRCULAR_MARKER;

pub const UNDEFINED_TEXT: &str = "(undefined)";
pub const STREAM_ENDED_TEXT: &str = "Stream ended (EOF)";
pub const INVALID_TEXT: &str = "(invalid JSON)";

/// Render a payload for display. Never fails.
///
/// Absent renders as `(undefined)`, the top-level end-of-stream marker as a
/// readable sentence, everything else as two-space indented JSON.
pub fn safe_stringify(value: Option<&Value>) -> String {
    match value {
        None => UNDEFINED_TEXT.to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) if s == STREAM_END_MARKER => STREAM_ENDED_TEXT.to_string(),
        Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| INVALID_TEXT.to_string()),
    }
}

/// Same contract for a value still attached to the page; cycles come out as
/// [`CIRCULAR_MARKER`].
pub fn stringify_live(value: &LiveValue) -> String {
    safe_stringify(live::snapshot(value).as_ref())
}

pub fn stringify_status(status: Option<&RpcStatus>) -> String {
    match status {
        None => UNDEFINED_TEXT.to_string(),
        Some(status) => match serde_json::to_value(status) {
            Ok(v) => safe_stringify(Some(&v)),
            Err(_) => INVALID_TEXT.to_string(),
        },
    }
}
