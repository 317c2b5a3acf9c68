// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Frame decoder and delta parser.
//
// The decoder turns arbitrary byte chunks into framed payloads (the text
// after `data: `); the parser interprets OpenAI chunk-delta semantics and
// accumulates the assembled message. They are separate because cache
// replay re-parses recorded frames without re-reading a socket.

use super::types::{DeltaEvent, ToolCall, Usage};
use serde_json::{json, Value};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Frame decoder
// ---------------------------------------------------------------------------

/// Splits a stream of byte chunks into SSE payloads.
///
/// Chunks may fracture anywhere, including mid-line and mid-UTF-8
/// sequence is not expected (upstream SSE is UTF-8 text; bytes are
/// buffered until a full line arrives). `event:` lines and comments are
/// skipped — OpenAI frames everything in `data:` lines.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every complete payload it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(payload) = payload_of(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Drain a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        payload_of(&line)
    }
}

fn payload_of(line: &str) -> Option<String> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Delta parser
// ---------------------------------------------------------------------------

/// Accumulates OpenAI streaming deltas into an assembled response.
///
/// Tool calls are keyed by `choices[0].delta.tool_calls[].index`: the
/// first delta for an index opens the call (id, name, optional opening
/// argument fragment), later deltas append to the arguments string.
/// Continuation deltas may omit id and name; openers may omit arguments.
#[derive(Debug, Default)]
pub struct DeltaParser {
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
    response_id: Option<String>,
    model: Option<String>,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one framed payload, returning the observations it
    /// produced in order. Malformed JSON yields a single `Malformed`
    /// event and leaves the accumulated state untouched.
    pub fn feed(&mut self, payload: &str) -> Vec<DeltaEvent> {
        let data = payload.trim();

        if data == "[DONE]" {
            self.done = true;
            return vec![DeltaEvent::Done];
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![DeltaEvent::Malformed(e.to_string())],
        };

        let mut events = Vec::new();

        if self.response_id.is_none() {
            self.response_id = chunk.get("id").and_then(Value::as_str).map(str::to_string);
        }
        if self.model.is_none() {
            self.model = chunk.get("model").and_then(Value::as_str).map(str::to_string);
        }

        if self.usage.is_none() {
            if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
                if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
                    self.usage = Some(usage);
                    events.push(DeltaEvent::Usage(usage));
                }
            }
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                self.content.push_str(text);
                events.push(DeltaEvent::Content(text.to_string()));
            }

            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    if let Some(event) = self.apply_tool_call_delta(call) {
                        events.push(event);
                    }
                }
            }
        }

        if self.finish_reason.is_none() {
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
                events.push(DeltaEvent::FinishReason(reason.to_string()));
            }
        }

        events
    }

    fn apply_tool_call_delta(&mut self, call: &Value) -> Option<DeltaEvent> {
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let id = call.get("id").and_then(Value::as_str);
        let name = call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str);
        let fragment = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str);

        match self.tool_calls.get_mut(&index) {
            None => {
                let opened = ToolCall {
                    index,
                    id: id.unwrap_or_default().to_string(),
                    name: name.unwrap_or_default().to_string(),
                    arguments: fragment.unwrap_or_default().to_string(),
                };
                self.tool_calls.insert(index, opened.clone());
                Some(DeltaEvent::ToolCallStart(opened))
            }
            Some(existing) => {
                // Late id/name fill-in is tolerated silently.
                if existing.id.is_empty() {
                    if let Some(id) = id {
                        existing.id = id.to_string();
                    }
                }
                if existing.name.is_empty() {
                    if let Some(name) = name {
                        existing.name = name.to_string();
                    }
                }
                let fragment = fragment?;
                existing.arguments.push_str(fragment);
                Some(DeltaEvent::ToolCallUpdate {
                    index,
                    fragment: fragment.to_string(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Tool calls ordered by index.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.values().cloned().collect()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The assembled message in OpenAI's non-streaming response shape.
    ///
    /// `content` is null whenever any tool call was observed.
    pub fn assembled_message(&self) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": if self.tool_calls.is_empty() {
                Value::String(self.content.clone())
            } else {
                Value::Null
            },
        });
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .values()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect();
            message["tool_calls"] = Value::Array(calls);
        }
        message
    }

    /// A full `chat.completion` object rebuilt from the accumulated
    /// stream, for callers that asked for a non-streaming response.
    pub fn assembled_completion(&self) -> Value {
        let mut completion = json!({
            "id": self.response_id.clone().unwrap_or_else(|| "chatcmpl-replay".to_string()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "message": self.assembled_message(),
                "finish_reason": self.finish_reason.clone().unwrap_or_else(|| "stop".to_string()),
            }],
        });
        if let Some(usage) = self.usage {
            completion["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
        }
        completion
    }
}
