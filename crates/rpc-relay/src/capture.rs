//! Captured call model.
//!
//! A [`CaptureEvent`] is one observation emitted by the instrumentation shim.
//! Unary calls produce a single event carrying the request together with the
//! response or the error. Server-streaming calls produce one event with the
//! request when the stream opens, one event per delivered message, and a
//! final event holding either the `"EOF"` marker or the error.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Response payload marking the end of a server stream.
pub const STREAM_END_MARKER: &str = "EOF";

/// gRPC status code `UNKNOWN`, used when an error payload has no usable code.
pub const UNKNOWN_STATUS_CODE: i64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ServerStreaming,
    /// Any method type a newer shim reports that this build does not know.
    Other,
}

impl MethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::Unary => "unary",
            MethodType::ServerStreaming => "server_streaming",
            MethodType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "unary" => MethodType::Unary,
            "server_streaming" => MethodType::ServerStreaming,
            _ => MethodType::Other,
        }
    }
}

impl Serialize for MethodType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MethodType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MethodType::parse(&raw))
    }
}

/// Error half of a call: `{ code, message }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Interpret an arbitrary sanitized error payload. Objects with
    /// `code`/`message` map directly; anything else keeps its JSON text as
    /// the message under the `UNKNOWN` code.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(map) => Self {
                code: map
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(UNKNOWN_STATUS_CODE),
                message: match map.get("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
            },
            Value::String(s) => Self::new(UNKNOWN_STATUS_CODE, s.clone()),
            other => Self::new(UNKNOWN_STATUS_CODE, other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    pub method: String,
    pub method_type: MethodType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcStatus>,
}

impl CaptureEvent {
    /// A finished unary call.
    pub fn unary(method: impl Into<String>, request: Value, outcome: Result<Value, RpcStatus>) -> Self {
        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(status) => (None, Some(status)),
        };
        Self {
            method: method.into(),
            method_type: MethodType::Unary,
            request: Some(request),
            response,
            error,
        }
    }

    pub fn stream_opened(method: impl Into<String>, request: Value) -> Self {
        Self {
            method: method.into(),
            method_type: MethodType::ServerStreaming,
            request: Some(request),
            response: None,
            error: None,
        }
    }

    pub fn stream_message(method: impl Into<String>, response: Value) -> Self {
        Self {
            method: method.into(),
            method_type: MethodType::ServerStreaming,
            request: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn stream_ended(method: impl Into<String>) -> Self {
        Self::stream_message(method, Value::String(STREAM_END_MARKER.to_string()))
    }

    /// Status code 0 is a clean close, which the shim reports as the end
    /// marker rather than an error.
    pub fn stream_failed(method: impl Into<String>, status: RpcStatus) -> Self {
        if status.code == 0 {
            return Self::stream_ended(method);
        }
        Self {
            method: method.into(),
            method_type: MethodType::ServerStreaming,
            request: None,
            response: None,
            error: Some(status),
        }
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(&self.response, Some(Value::String(s)) if s == STREAM_END_MARKER)
    }

    /// `(service, method)` split of `"<service>/<methodName>"`.
    pub fn method_parts(&self) -> (&str, &str) {
        let mut parts = self.method.rsplit('/');
        let method = parts.next().filter(|s| !s.is_empty()).unwrap_or("unknown");
        let service = parts.next().filter(|s| !s.is_empty()).unwrap_or("unknown");
        (service, method)
    }
}
