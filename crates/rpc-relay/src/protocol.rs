//! Wire messages and the length-prefixed frame codec.
//!
//! Frame layout: `[4B big-endian length][kind][payload]`, where the length
//! covers kind + payload. `FRAME_JSON` carries a JSON message as-is,
//! `FRAME_JSON_GZ` carries it gzip'd.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::capture::CaptureEvent;
use crate::error::RelayError;

// ── Frame kinds ─────────────────────────────────────────────────────

pub const FRAME_JSON: u8 = 0x00;
pub const FRAME_JSON_GZ: u8 = 0x01;

// ── Constants ───────────────────────────────────────────────────────

pub const GZIP_THRESHOLD: usize = 4096;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Type marker the instrumentation shim stamps on every page message.
pub const SHIM_MESSAGE_TYPE: &str = "__GRPCWEB_DEVTOOLS__";

/// Host-assigned tab identifier. Only JSON integers are accepted on the
/// wire; anything else fails to decode and the message is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TabId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TabId)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Inspector,
    Observer,
    Host,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Panel,
    Content,
}

/// Messages keyed by `type`: connection setup and host signals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypedMessage {
    #[serde(rename = "hello")]
    Hello {
        role: Role,
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
    #[serde(rename = "init")]
    Init {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "tabRemoved")]
    TabRemoved {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
}

/// Messages keyed by `action`: routed traffic and panel-local commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ActionMessage {
    #[serde(rename = "panelClosed")]
    PanelClosed {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "panelSuperseded")]
    PanelSuperseded {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "captureEvent")]
    CaptureEvent { target: Target, data: CaptureEvent },
    #[serde(rename = "setCapture")]
    SetCapture { enabled: bool },
    #[serde(rename = "clearRequests")]
    ClearRequests,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Typed(TypedMessage),
    Action(ActionMessage),
}

impl Message {
    pub fn hello(role: Role, tab_id: Option<TabId>) -> Self {
        Message::Typed(TypedMessage::Hello { role, tab_id })
    }

    pub fn init(tab_id: TabId) -> Self {
        Message::Typed(TypedMessage::Init { tab_id })
    }

    pub fn tab_removed(tab_id: TabId) -> Self {
        Message::Typed(TypedMessage::TabRemoved { tab_id })
    }

    pub fn panel_closed(tab_id: TabId) -> Self {
        Message::Action(ActionMessage::PanelClosed { tab_id })
    }

    pub fn panel_superseded(tab_id: TabId) -> Self {
        Message::Action(ActionMessage::PanelSuperseded { tab_id })
    }

    pub fn capture(event: CaptureEvent) -> Self {
        Message::Action(ActionMessage::CaptureEvent {
            target: Target::Panel,
            data: event,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Frame encoding ──────────────────────────────────────────────────

fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

/// Encode a message, compressing it when that actually saves bytes.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, RelayError> {
    let json = message.to_json()?;
    if json.len() >= GZIP_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        if compressed.len() < json.len() {
            return Ok(encode_frame(FRAME_JSON_GZ, &compressed));
        }
    }
    if json.len() + 1 > MAX_FRAME_LEN {
        return Err(RelayError::FrameTooLarge(json.len() + 1));
    }
    Ok(encode_frame(FRAME_JSON, &json))
}

/// Decode the body of one frame (kind byte first).
pub fn decode_frame(body: &[u8]) -> Result<Message, RelayError> {
    let (kind, payload) = match body.split_first() {
        Some((kind, payload)) => (*kind, payload),
        None => return Err(RelayError::Handshake("empty frame".to_string())),
    };
    match kind {
        FRAME_JSON => Message::from_json(payload),
        FRAME_JSON_GZ => {
            // inflated size is bounded the same as a raw frame
            let mut json = Vec::new();
            GzDecoder::new(payload)
                .take(MAX_FRAME_LEN as u64 + 1)
                .read_to_end(&mut json)?;
            if json.len() > MAX_FRAME_LEN {
                return Err(RelayError::FrameTooLarge(json.len()));
            }
            Message::from_json(&json)
        }
        other => Err(RelayError::UnknownFrameKind(other)),
    }
}

// ── Frame decoding ──────────────────────────────────────────────────

/// Accumulates bytes from a stream and splits off complete frame bodies.
#[derive(Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next complete frame body, `Ok(None)` when more bytes are needed.
    /// Zero-length frames are skipped.
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        loop {
            if self.pending.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(RelayError::FrameTooLarge(len));
            }
            if self.pending.len() < 4 + len {
                return Ok(None);
            }
            let body = self.pending[4..4 + len].to_vec();
            self.pending.drain(..4 + len);
            if body.is_empty() {
                continue;
            }
            return Ok(Some(body));
        }
    }
}

/// Outcome of reading one frame from a stream.
pub enum Inbound {
    Message(Message),
    /// The frame was well formed but its content did not decode. The
    /// connection stays usable.
    Malformed(RelayError),
    Closed,
}

/// Read until one full frame is available. Transport errors and EOF both
/// report `Closed`; oversized frames are fatal for the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Inbound, RelayError> {
    let mut buf = vec![0u8; 65536];
    loop {
        if let Some(body) = decoder.next_body()? {
            return Ok(match decode_frame(&body) {
                Ok(message) => Inbound::Message(message),
                Err(err) => Inbound::Malformed(err),
            });
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(Inbound::Closed),
            Ok(n) => n,
            Err(_) => return Ok(Inbound::Closed),
        };
        decoder.push(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attach_message_shape() {
        let json = serde_json::to_value(Message::init(TabId(7))).unwrap();
        assert_eq!(json, json!({"type": "init", "tabId": 7}));
    }

    #[test]
    fn panel_closed_shape() {
        let json = serde_json::to_value(Message::panel_closed(TabId(3))).unwrap();
        assert_eq!(json, json!({"action": "panelClosed", "tabId": 3}));
    }

    #[test]
    fn capture_message_shape() {
        let event = CaptureEvent::stream_ended("svc/Watch");
        let json = serde_json::to_value(Message::capture(event)).unwrap();
        assert_eq!(json["action"], "captureEvent");
        assert_eq!(json["target"], "panel");
        assert_eq!(json["data"]["method"], "svc/Watch");
        assert_eq!(json["data"]["response"], "EOF");
    }

    #[test]
    fn local_ui_messages_parse() {
        let set: Message =
            serde_json::from_value(json!({"action": "setCapture", "enabled": false})).unwrap();
        assert_eq!(set, Message::Action(ActionMessage::SetCapture { enabled: false }));
        let clear: Message = serde_json::from_value(json!({"action": "clearRequests"})).unwrap();
        assert_eq!(clear, Message::Action(ActionMessage::ClearRequests));
    }

    #[test]
    fn non_integer_tab_id_is_rejected() {
        assert!(Message::from_json(br#"{"type":"init","tabId":"7"}"#).is_err());
        assert!(Message::from_json(br#"{"type":"init","tabId":7.5}"#).is_err());
        assert!(Message::from_json(br#"{"type":"init"}"#).is_err());
        assert!(Message::from_json(br#"{"type":"init","tabId":7}"#).is_ok());
    }

    #[test]
    fn hello_without_tab_omits_field() {
        let json = serde_json::to_value(Message::hello(Role::Inspector, None)).unwrap();
        assert_eq!(json, json!({"type": "hello", "role": "inspector"}));
    }

    #[test]
    fn small_message_is_plain_json_frame() {
        let frame = encode_message(&Message::init(TabId(1))).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(frame[4], FRAME_JSON);
        assert_eq!(decode_frame(&frame[4..]).unwrap(), Message::init(TabId(1)));
    }

    #[test]
    fn large_repetitive_message_is_compressed() {
        let big = "x".repeat(GZIP_THRESHOLD * 4);
        let message = Message::capture(CaptureEvent::stream_message("svc/Big", json!(big)));
        let frame = encode_message(&message).unwrap();
        assert_eq!(frame[4], FRAME_JSON_GZ);
        assert!(frame.len() < GZIP_THRESHOLD);
        assert_eq!(decode_frame(&frame[4..]).unwrap(), message);
    }

    #[test]
    fn decoder_handles_split_and_coalesced_frames() {
        let a = encode_message(&Message::init(TabId(1))).unwrap();
        let b = encode_message(&Message::panel_closed(TabId(1))).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream[..3]);
        assert!(decoder.next_body().unwrap().is_none());
        decoder.push(&stream[3..]);
        let first = decoder.next_body().unwrap().unwrap();
        let second = decoder.next_body().unwrap().unwrap();
        assert!(decoder.next_body().unwrap().is_none());
        assert_eq!(decode_frame(&first).unwrap(), Message::init(TabId(1)));
        assert_eq!(decode_frame(&second).unwrap(), Message::panel_closed(TabId(1)));
    }

    #[test]
    fn decoder_skips_empty_frames_and_rejects_oversized() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&0u32.to_be_bytes());
        assert!(decoder.next_body().unwrap().is_none());

        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        assert!(matches!(
            decoder.next_body(),
            Err(RelayError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn gzip_frame_inflating_past_the_limit_is_rejected() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![b' '; MAX_FRAME_LEN + 64]).unwrap();
        let compressed = encoder.finish().unwrap();
        assert!(compressed.len() < MAX_FRAME_LEN);

        let mut body = vec![FRAME_JSON_GZ];
        body.extend_from_slice(&compressed);
        assert!(matches!(
            decode_frame(&body),
            Err(RelayError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn unknown_kind_is_reported() {
        assert!(matches!(
            decode_frame(&[0x7f, b'{', b'}']),
            Err(RelayError::UnknownFrameKind(0x7f))
        ));
    }

    #[tokio::test]
    async fn read_frame_reports_malformed_then_continues() {
        let mut bytes = encode_frame(FRAME_JSON, br#"{"type":"init","tabId":"bad"}"#);
        bytes.extend_from_slice(&encode_message(&Message::init(TabId(9))).unwrap());
        let mut reader = &bytes[..];
        let mut decoder = FrameDecoder::new();

        assert!(matches!(
            read_frame(&mut reader, &mut decoder).await.unwrap(),
            Inbound::Malformed(_)
        ));
        match read_frame(&mut reader, &mut decoder).await.unwrap() {
            Inbound::Message(m) => assert_eq!(m, Message::init(TabId(9))),
            _ => panic!("expected message"),
        }
        assert!(matches!(
            read_frame(&mut reader, &mut decoder).await.unwrap(),
            Inbound::Closed
        ));
    }
}
