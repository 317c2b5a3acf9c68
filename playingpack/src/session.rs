// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Per-request session model
//
// One session per live chat-completion request, created on HTTP entry
// and retained after completion for operator inspection. Serialized
// camelCase — the operator UI and the notification hub speak that wire
// dialect (`requestId`, `cacheAvailable`, ...).

use crate::sse::{ToolCall, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state. A session never leaves `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Processing,
    Reviewing,
    Complete,
}

/// Where the emitted bytes originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Llm,
    Cache,
    Mock,
}

/// Read-only snapshot of the inbound request, for operator display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub model: String,
    pub messages: Value,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    pub raw_body: Value,
}

impl RequestSnapshot {
    /// Extract the displayable fields from a request body.
    ///
    /// `stream` defaults to true, matching the upstream convention for
    /// agent traffic.
    pub fn from_body(body: &Value) -> Self {
        Self {
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            messages: body.get("messages").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
            stream: body.get("stream").and_then(Value::as_bool).unwrap_or(true),
            tools: body.get("tools").cloned(),
            temperature: body.get("temperature").and_then(Value::as_f64),
            max_tokens: body.get("max_tokens").and_then(Value::as_u64),
            raw_body: body.clone(),
        }
    }
}

/// The response assembled so far, as the operator sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub status: Option<u16>,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: RequestSnapshot,
    pub fingerprint: String,
    pub cache_available: bool,
    pub response_source: Option<ResponseSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<SessionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub fn new(id: Uuid, body: &Value, fingerprint: impl Into<String>, intervene: bool) -> Self {
        Self {
            id,
            state: if intervene {
                SessionState::Pending
            } else {
                SessionState::Processing
            },
            created_at: Utc::now(),
            processing_started_at: if intervene { None } else { Some(Utc::now()) },
            completed_at: None,
            request: RequestSnapshot::from_body(body),
            fingerprint: fingerprint.into(),
            cache_available: false,
            response_source: None,
            response: None,
            error: None,
        }
    }

    /// The response record, created on first touch.
    pub fn response_mut(&mut self) -> &mut SessionResponse {
        self.response.get_or_insert_with(SessionResponse::default)
    }
}

// ---------------------------------------------------------------------------
// Operator decisions
// ---------------------------------------------------------------------------

/// Decision at point 1: after cache lookup, before acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Point1Action {
    /// Forward to the upstream LLM.
    Llm,
    /// Replay the recorded response.
    Cache,
    /// Synthesise a response from operator content.
    Mock { content: String },
}

/// Decision at point 2: after the buffer is ready, before emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Point2Action {
    /// Pass the buffered response through unchanged.
    Return,
    /// Discard the buffer and re-synthesise from operator content.
    Modify { content: String },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Outbound event fanned out to hub subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    RequestUpdate { session: Session },
}

impl SessionEvent {
    pub fn session(&self) -> &Session {
        match self {
            SessionEvent::RequestUpdate { session } => session,
        }
    }
}
