// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Tests for SSE decoding and delta accumulation.
//
// Covers:
//  1. Frame decoder reassembles payloads across arbitrary chunk splits
//  2. Content deltas concatenate in order
//  3. Tool calls reconstructed from fragments keyed by index
//  4. finish_reason and usage fire exactly once
//  5. Malformed payloads do not stop the parse
//  6. Assembled message follows the non-streaming OpenAI shape

use super::*;
use serde_json::json;

fn feed_all(parser: &mut DeltaParser, payloads: &[&str]) -> Vec<DeltaEvent> {
    payloads.iter().flat_map(|p| parser.feed(p)).collect()
}

// ---------------------------------------------------------------------------
// Frame decoder
// ---------------------------------------------------------------------------

#[test]
fn decoder_extracts_payload_from_single_frame() {
    let mut dec = FrameDecoder::new();
    let payloads = dec.feed(b"data: {\"a\":1}\n\n");
    assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
}

#[test]
fn decoder_handles_multiple_frames_in_one_chunk() {
    let mut dec = FrameDecoder::new();
    let payloads = dec.feed(b"data: one\n\ndata: two\n\ndata: [DONE]\n\n");
    assert_eq!(payloads, vec!["one", "two", "[DONE]"]);
}

#[test]
fn decoder_reassembles_frame_split_mid_line() {
    let mut dec = FrameDecoder::new();
    assert!(dec.feed(b"data: {\"conte").is_empty());
    let payloads = dec.feed(b"nt\":\"hi\"}\n\n");
    assert_eq!(payloads, vec!["{\"content\":\"hi\"}"]);
}

#[test]
fn decoder_strips_carriage_returns() {
    let mut dec = FrameDecoder::new();
    let payloads = dec.feed(b"data: x\r\n\r\n");
    assert_eq!(payloads, vec!["x"]);
}

#[test]
fn decoder_skips_comments_and_event_lines() {
    let mut dec = FrameDecoder::new();
    let payloads = dec.feed(b": keep-alive\nevent: message\ndata: y\n\n");
    assert_eq!(payloads, vec!["y"]);
}

#[test]
fn decoder_accepts_data_prefix_without_space() {
    let mut dec = FrameDecoder::new();
    let payloads = dec.feed(b"data:z\n\n");
    assert_eq!(payloads, vec!["z"]);
}

#[test]
fn decoder_finish_drains_unterminated_line() {
    let mut dec = FrameDecoder::new();
    assert!(dec.feed(b"data: tail").is_empty());
    assert_eq!(dec.finish(), Some("tail".to_string()));
    assert_eq!(dec.finish(), None);
}

// ---------------------------------------------------------------------------
// Content accumulation
// ---------------------------------------------------------------------------

#[test]
fn content_deltas_concatenate_in_order() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ],
    );
    assert_eq!(parser.content(), "Hello");
}

#[test]
fn content_event_carries_the_fragment() {
    let mut parser = DeltaParser::new();
    let events = parser.feed(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#);
    assert_eq!(events, vec![DeltaEvent::Content("Hi".to_string())]);
}

#[test]
fn done_sentinel_sets_done_flag() {
    let mut parser = DeltaParser::new();
    let events = parser.feed("[DONE]");
    assert_eq!(events, vec![DeltaEvent::Done]);
    assert!(parser.is_done());
}

// ---------------------------------------------------------------------------
// Tool call reconstruction
// ---------------------------------------------------------------------------

#[test]
fn tool_call_opener_then_fragments_accumulate_arguments() {
    let mut parser = DeltaParser::new();
    let events = feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"f","arguments":"{\"a\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
        ],
    );

    assert!(matches!(events[0], DeltaEvent::ToolCallStart(_)));
    assert!(matches!(events[1], DeltaEvent::ToolCallUpdate { index: 0, .. }));

    let calls = parser.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_x");
    assert_eq!(calls[0].name, "f");
    assert_eq!(calls[0].arguments, "{\"a\":1}");
}

#[test]
fn arguments_equal_concatenation_of_fragments_at_arbitrary_splits() {
    let full = r#"{"path":"/tmp/file.txt","mode":"read"}"#;
    // Split the arguments string at every position and re-run the parse.
    for split in 0..=full.len() {
        if !full.is_char_boundary(split) {
            continue;
        }
        let (head, tail) = full.split_at(split);
        let mut parser = DeltaParser::new();
        parser.feed(
            &json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"name":"open","arguments":head}}
            ]}}]})
            .to_string(),
        );
        parser.feed(
            &json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":tail}}
            ]}}]})
            .to_string(),
        );
        assert_eq!(parser.tool_calls()[0].arguments, full, "split at {split}");
    }
}

#[test]
fn opener_without_arguments_is_tolerated() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#,
        ],
    );
    assert_eq!(parser.tool_calls()[0].arguments, "{}");
}

#[test]
fn late_id_and_name_fill_in_silently() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"g","arguments":"}"}}]}}]}"#,
        ],
    );
    let calls = parser.tool_calls();
    assert_eq!(calls[0].id, "call_9");
    assert_eq!(calls[0].name, "g");
    assert_eq!(calls[0].arguments, "{}");
}

#[test]
fn multiple_tool_calls_ordered_by_index() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"b","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"a","arguments":"{}"}}]}}]}"#,
        ],
    );
    let calls = parser.tool_calls();
    assert_eq!(calls[0].id, "call_a");
    assert_eq!(calls[1].id, "call_b");
}

// ---------------------------------------------------------------------------
// finish_reason / usage
// ---------------------------------------------------------------------------

#[test]
fn finish_reason_fires_once_on_first_non_null() {
    let mut parser = DeltaParser::new();
    let events = feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"content":"x"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
        ],
    );
    let reasons: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, DeltaEvent::FinishReason(_)))
        .collect();
    assert_eq!(reasons.len(), 1);
    assert_eq!(parser.finish_reason(), Some("stop"));
}

#[test]
fn usage_fires_once_from_top_level_object() {
    let mut parser = DeltaParser::new();
    let events = feed_all(
        &mut parser,
        &[
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":99,"completion_tokens":99,"total_tokens":198}}"#,
        ],
    );
    let usages: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, DeltaEvent::Usage(_)))
        .collect();
    assert_eq!(usages.len(), 1);
    let usage = parser.usage().unwrap();
    assert_eq!(usage.prompt_tokens, 10);
    assert_eq!(usage.total_tokens, 15);
}

#[test]
fn null_usage_field_is_ignored() {
    let mut parser = DeltaParser::new();
    parser.feed(r#"{"choices":[{"delta":{"content":"x"}}],"usage":null}"#);
    assert!(parser.usage().is_none());
}

// ---------------------------------------------------------------------------
// Malformed payloads
// ---------------------------------------------------------------------------

#[test]
fn malformed_payload_reports_error_and_parse_continues() {
    let mut parser = DeltaParser::new();
    let events = feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            "{this is not json",
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
        ],
    );
    assert!(events.iter().any(|e| matches!(e, DeltaEvent::Malformed(_))));
    assert_eq!(parser.content(), "ab");
}

// ---------------------------------------------------------------------------
// Assembled message
// ---------------------------------------------------------------------------

#[test]
fn assembled_message_for_text_response() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ],
    );
    assert_eq!(
        parser.assembled_message(),
        json!({"role": "assistant", "content": "Hello"})
    );
}

#[test]
fn assembled_message_for_tool_call_response() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"f","arguments":"{\"a\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ],
    );
    assert_eq!(
        parser.assembled_message(),
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_x",
                "type": "function",
                "function": {"name": "f", "arguments": "{\"a\":1}"},
            }],
        })
    );
}

#[test]
fn assembled_completion_carries_id_model_and_usage() {
    let mut parser = DeltaParser::new();
    feed_all(
        &mut parser,
        &[
            r#"{"id":"chatcmpl-123","model":"gpt-4","choices":[{"delta":{"content":"ok"}}]}"#,
            r#"{"id":"chatcmpl-123","model":"gpt-4","choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
        ],
    );
    let completion = parser.assembled_completion();
    assert_eq!(completion["id"], "chatcmpl-123");
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["model"], "gpt-4");
    assert_eq!(completion["choices"][0]["message"]["content"], "ok");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    assert_eq!(completion["usage"]["total_tokens"], 3);
}

#[test]
fn replay_of_recorded_frames_matches_direct_parse() {
    // Parsing the same payloads chunked differently must produce the
    // same assembled message and tool call list.
    let frames = [
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_x\",\"function\":{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    ];

    // Direct: one frame per chunk.
    let mut direct_dec = FrameDecoder::new();
    let mut direct = DeltaParser::new();
    for frame in &frames {
        for payload in direct_dec.feed(frame.as_bytes()) {
            direct.feed(&payload);
        }
    }

    // Replayed: the whole recording split at an awkward byte position.
    let joined: String = frames.concat();
    let (head, tail) = joined.split_at(37);
    let mut replay_dec = FrameDecoder::new();
    let mut replayed = DeltaParser::new();
    for chunk in [head, tail] {
        for payload in replay_dec.feed(chunk.as_bytes()) {
            replayed.feed(&payload);
        }
    }

    assert_eq!(direct.assembled_message(), replayed.assembled_message());
    assert_eq!(direct.tool_calls(), replayed.tool_calls());
    assert_eq!(direct.finish_reason(), replayed.finish_reason());
}
