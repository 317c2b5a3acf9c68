// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// SSE decoding and delta accumulation
//
// Responsibilities:
// - Split raw byte chunks into framed SSE payloads (`data:` lines)
// - Interpret OpenAI chunk-delta semantics: text content, tool call
//   fragments keyed by index, finish reason, token usage, [DONE]
// - Accumulate the pieces into the non-streaming assembled message
// - Malformed payloads are reported, never fatal: the parse continues

mod parser;
mod types;

pub use parser::{DeltaParser, FrameDecoder};
pub use types::{DeltaEvent, ToolCall, Usage};

#[cfg(test)]
mod tests;
