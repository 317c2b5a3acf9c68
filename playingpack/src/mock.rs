// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Mock response generator
//
// Turns an operator-supplied content string into an OpenAI-shaped
// response. Three recognised forms:
// - "ERROR: <msg>"            -> non-streaming 400 error body
// - {"function": "...", ...}  -> streamed tool call
// - anything else             -> streamed assistant text

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

/// Text responses stream in 4-character tokens.
const TEXT_TOKEN_CHARS: usize = 4;
/// Tool call arguments stream in 10-character fragments.
const ARG_FRAGMENT_CHARS: usize = 10;

// ---------------------------------------------------------------------------
// Content parsing
// ---------------------------------------------------------------------------

/// What the operator's content string asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSpec {
    Text(String),
    ToolCall { name: String, arguments: String },
    Error(String),
}

/// Interpret an operator content string.
pub fn parse(content: &str) -> MockSpec {
    if let Some(message) = content.strip_prefix("ERROR:") {
        return MockSpec::Error(message.trim_start().to_string());
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        if let Some(name) = obj.get("function").and_then(Value::as_str) {
            let arguments = obj
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            return MockSpec::ToolCall {
                name: name.to_string(),
                // to_string on a Value cannot fail.
                arguments: arguments.to_string(),
            };
        }
    }

    MockSpec::Text(content.to_string())
}

/// The non-streaming 400 error body for an `ERROR:` spec.
pub fn error_body(message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": "invalid_request_error",
            "param": null,
            "code": null,
        }
    })
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Emits mock responses as SSE frame sequences or single JSON bodies.
///
/// Inter-chunk delays are configurable so tests can run without pacing.
#[derive(Debug, Clone, Copy)]
pub struct MockGenerator {
    pub text_delay: Duration,
    pub tool_delay: Duration,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self {
            text_delay: Duration::from_millis(20),
            tool_delay: Duration::from_millis(10),
        }
    }
}

impl MockGenerator {
    /// A generator with no inter-chunk pacing.
    pub fn instant() -> Self {
        Self {
            text_delay: Duration::ZERO,
            tool_delay: Duration::ZERO,
        }
    }

    /// The full frame sequence for a streamed mock response.
    ///
    /// Text: role chunk, 4-char content tokens, `finish_reason:"stop"`,
    /// `[DONE]`. Tool call: role chunk, opener with id/name and the first
    /// argument fragment, 10-char argument fragments, `finish_reason:
    /// "tool_calls"`, `[DONE]`. Error specs have no streamed form.
    pub fn frames(&self, spec: &MockSpec, model: &str) -> Vec<String> {
        let now_ms = Utc::now().timestamp_millis();
        let id = format!("chatcmpl-mock-{now_ms}");
        let created = now_ms / 1000;

        let chunk = |delta: Value, finish: Value| {
            frame(&json!({
                "id": id.as_str(),
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
            }))
        };

        let mut frames = vec![chunk(json!({"role": "assistant", "content": ""}), Value::Null)];

        match spec {
            MockSpec::Text(text) => {
                for token in split_chars(text, TEXT_TOKEN_CHARS) {
                    frames.push(chunk(json!({"content": token}), Value::Null));
                }
                frames.push(chunk(json!({}), json!("stop")));
            }
            MockSpec::ToolCall { name, arguments } => {
                let call_id = format!("call_mock_{now_ms}");
                let mut fragments = split_chars(arguments, ARG_FRAGMENT_CHARS).into_iter();
                let opening = fragments.next().unwrap_or_default();
                frames.push(chunk(
                    json!({"tool_calls": [{
                        "index": 0,
                        "id": call_id,
                        "type": "function",
                        "function": {"name": name, "arguments": opening},
                    }]}),
                    Value::Null,
                ));
                for fragment in fragments {
                    frames.push(chunk(
                        json!({"tool_calls": [{
                            "index": 0,
                            "function": {"arguments": fragment},
                        }]}),
                        Value::Null,
                    ));
                }
                frames.push(chunk(json!({}), json!("tool_calls")));
            }
            MockSpec::Error(_) => {
                // Errors are emitted as non-streaming bodies; callers
                // handle that form before asking for frames.
            }
        }

        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    /// Stream the frame sequence with inter-chunk pacing.
    ///
    /// The consumer dropping the stream stops emission within one frame.
    pub fn sse_stream(&self, spec: &MockSpec, model: &str) -> impl Stream<Item = Bytes> {
        let delay = match spec {
            MockSpec::ToolCall { .. } => self.tool_delay,
            _ => self.text_delay,
        };
        let frames = self.frames(spec, model);
        let (tx, rx) = mpsc::channel::<Bytes>(8);

        tokio::spawn(async move {
            for (i, f) in frames.into_iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = sleep(delay) => {}
                    }
                }
                if tx.send(Bytes::from(f)).await.is_err() {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// The non-streaming `chat.completion` body with the same content.
    pub fn completion(&self, spec: &MockSpec, model: &str) -> Value {
        let now_ms = Utc::now().timestamp_millis();
        let id = format!("chatcmpl-mock-{now_ms}");
        let created = now_ms / 1000;

        let (message, finish) = match spec {
            MockSpec::Text(text) => (
                json!({"role": "assistant", "content": text}),
                "stop",
            ),
            MockSpec::ToolCall { name, arguments } => (
                json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": format!("call_mock_{now_ms}"),
                        "type": "function",
                        "function": {"name": name, "arguments": arguments},
                    }],
                }),
                "tool_calls",
            ),
            MockSpec::Error(message) => return error_body(message),
        };

        json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "message": message, "finish_reason": finish}],
        })
    }
}

fn frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// Split a string into pieces of at most `n` characters, respecting
/// UTF-8 boundaries. An empty input yields no pieces.
fn split_chars(s: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(n).map(|c| c.iter().collect()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
