// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Core types for SSE delta parsing.

use serde::{Deserialize, Serialize};

/// A tool call reconstructed from streaming deltas.
///
/// `arguments` is the raw accumulated string; the proxy never parses it
/// as JSON — the agent under test owns that contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Token usage as reported by the terminal usage chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One observation produced while feeding a payload to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// A text fragment from `choices[0].delta.content`.
    Content(String),
    /// First delta for a tool call index: carries id, name, and any
    /// opening argument fragment.
    ToolCallStart(ToolCall),
    /// A continuation fragment appended to the arguments of `index`.
    ToolCallUpdate { index: usize, fragment: String },
    /// First non-null `choices[0].finish_reason`; fires once.
    FinishReason(String),
    /// Top-level `usage` object; fires once.
    Usage(Usage),
    /// The `[DONE]` sentinel payload.
    Done,
    /// A payload that was not valid JSON. The parse continues.
    Malformed(String),
}
