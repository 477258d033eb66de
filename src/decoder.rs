//! Frame decoding for both transport flavors.
//!
//! - WebSocket: one JSON object per text frame, discriminated by `type`.
//! - SSE: a byte stream of `data: <json>` lines ending with `data: [DONE]`.
//!
//! Neither path returns an error to its caller. A malformed frame is logged
//! at `warn` and dropped so that one bad payload cannot take down a stream.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::protocol::InboundEvent;

/// Decode one WebSocket text frame. Returns `None` for malformed JSON.
pub fn decode_ws_frame(text: &str) -> Option<InboundEvent> {
    match serde_json::from_str::<InboundEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, frame_len = text.len(), "dropping malformed websocket frame");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// SSE line decoder
// ---------------------------------------------------------------------------

/// One complete SSE record.
#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    /// A parsed `data:` payload plus the most recent `event:` hint, if any.
    Data { event: Option<String>, payload: Value },
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a `\n` arrives, so a line (or a multi-byte UTF-8
/// character) split across two network reads is never parsed early.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event_hint: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen. Further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk from the body reader and return every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(line_end) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(item) = self.parse_line(line.trim()) {
                let finished = item == SseItem::Done;
                out.push(item);
                if finished {
                    self.done = true;
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }

    /// Flush a trailing line that was never newline-terminated (body ended).
    pub fn finish(&mut self) -> Vec<SseItem> {
        if self.done || self.buf.is_empty() {
            return Vec::new();
        }
        self.buf.push(b'\n');
        self.feed(&[])
    }

    fn parse_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            // blank line terminates an SSE event block
            self.event_hint = None;
            return None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.trim_start();
            if data == "[DONE]" {
                return Some(SseItem::Done);
            }
            return match serde_json::from_str::<Value>(data) {
                Ok(payload) => Some(SseItem::Data { event: self.event_hint.clone(), payload }),
                Err(e) => {
                    warn!(error = %e, "dropping malformed SSE data line");
                    None
                }
            };
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_hint = Some(rest.trim().to_string());
            return None;
        }
        debug!(line, "ignoring non-data SSE line");
        None
    }
}

// ---------------------------------------------------------------------------
// SSE payload -> InboundEvent
// ---------------------------------------------------------------------------

fn canonical_type(ty: &str) -> &str {
    match ty {
        "start" => "stream_start",
        "token" | "delta" => "stream_token",
        "final" | "complete" | "done" => "stream_complete",
        other => other,
    }
}

/// Map one SSE record onto the shared event vocabulary.
///
/// `message_id` is the locally generated id of the turn being streamed; it is
/// filled in wherever the server omitted one.
pub fn sse_item_to_event(item: SseItem, message_id: &str) -> Option<InboundEvent> {
    match item {
        SseItem::Done => Some(InboundEvent::StreamComplete {
            message_id: Some(message_id.to_string()),
            final_content: None,
        }),
        SseItem::Data { event, payload } => sse_payload_to_event(event.as_deref(), payload, message_id),
    }
}

/// See [`sse_item_to_event`].
pub fn sse_payload_to_event(
    event_hint: Option<&str>,
    payload: Value,
    message_id: &str,
) -> Option<InboundEvent> {
    let ty = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| event_hint.map(str::to_owned));

    if let Some(ty) = ty {
        let ty = canonical_type(&ty).to_string();
        let mut obj = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if ty == "stream_complete" && !obj.contains_key("final_content") {
            if let Some(content) = obj.remove("content") {
                obj.insert("final_content".into(), content);
            }
        }
        let wants_id = matches!(
            ty.as_str(),
            "stream_start" | "stream_token" | "stream_complete" | "error"
        );
        if wants_id && !obj.contains_key("message_id") && !obj.contains_key("id") {
            obj.insert("message_id".into(), Value::String(message_id.to_string()));
        }
        obj.insert("type".into(), Value::String(ty));
        return match serde_json::from_value::<InboundEvent>(Value::Object(obj)) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "dropping SSE payload with unexpected shape");
                None
            }
        };
    }

    // OpenAI-style chunk: {"choices":[{"delta":{"content":"..."}}]}
    let token = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)?;
    Some(InboundEvent::StreamToken {
        message_id: Some(message_id.to_string()),
        token: token.to_string(),
    })
}
