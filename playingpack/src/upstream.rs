// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Upstream forwarding
//
// Responsibilities:
// - Forward chat-completion bodies with a filtered header allow-list
// - Force Accept from the request's stream flag
// - Merge stream_options.include_usage for streaming requests
// - Raw passthrough for the /v1 catch-all
// - No retries: network failures propagate to the engine

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{json, Value};

/// Request headers forwarded to the upstream on the chat path. Anything
/// else (cookies, tracing baggage, the client's Host) stays behind.
const FORWARDED_HEADERS: &[&str] = &[
    "authorization",
    "content-type",
    "accept",
    "openai-organization",
    "openai-project",
    "user-agent",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("invalid upstream URL: {0}")]
    BadUrl(String),
}

/// Response handed back to the engine: status plus a byte stream the
/// engine owns and must drain or drop on every path.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

impl UpstreamResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }
}

/// Abstraction over the forward HTTP call so tests inject doubles.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Forward a chat-completions body: filtered headers, forced Accept,
    /// usage injection for streaming requests.
    async fn forward_chat(
        &self,
        upstream: &str,
        headers: &HeaderMap,
        body: &Value,
    ) -> Result<UpstreamResponse, UpstreamError>;

    /// Transparent forward for other /v1 paths.
    async fn forward_raw(
        &self,
        upstream: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Request preparation (pure, unit-tested)
// ---------------------------------------------------------------------------

/// Keep only the allow-listed request headers.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name) {
            if let Ok(name) = header::HeaderName::from_bytes(name.as_bytes()) {
                out.insert(name, value.clone());
            }
        }
    }
    out
}

/// Whether the body asks for a streaming response. Absent means true —
/// the agent traffic this proxy fronts streams by default.
pub fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(true)
}

/// Prepare the outbound body.
///
/// For streaming requests, `stream_options.include_usage = true` is
/// merged in unless the caller already set that key; caller-provided
/// options are preserved. Non-streaming bodies pass through untouched.
pub fn prepare_chat_body(body: &Value) -> Value {
    let mut out = body.clone();
    if !wants_stream(body) {
        return out;
    }

    let Some(obj) = out.as_object_mut() else {
        return out;
    };
    let options = obj
        .entry("stream_options")
        .or_insert_with(|| json!({}));
    if let Some(options) = options.as_object_mut() {
        options
            .entry("include_usage")
            .or_insert(Value::Bool(true));
    }
    out
}

// ---------------------------------------------------------------------------
// Reqwest implementation
// ---------------------------------------------------------------------------

pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
}

impl ReqwestUpstreamClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestUpstreamClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn forward_chat(
        &self,
        upstream: &str,
        headers: &HeaderMap,
        body: &Value,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!(
            "{}/v1/chat/completions",
            upstream.trim_end_matches('/')
        );

        let mut fwd_headers = filter_headers(headers);
        let accept = if wants_stream(body) {
            "text/event-stream"
        } else {
            "application/json"
        };
        fwd_headers.insert(header::ACCEPT, HeaderValue::from_static(accept));

        let prepared = prepare_chat_body(body);

        let resp = self
            .client
            .post(&url)
            .headers(fwd_headers)
            .json(&prepared)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(into_response(resp))
    }

    async fn forward_raw(
        &self,
        upstream: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{}", upstream.trim_end_matches('/'), path_and_query);

        // Strip hop-specific headers; reqwest recomputes them from the
        // upstream URL and the actual body.
        let mut fwd_headers = headers.clone();
        fwd_headers.remove(header::HOST);
        fwd_headers.remove(header::CONTENT_LENGTH);

        let resp = self
            .client
            .request(method, &url)
            .headers(fwd_headers)
            .body(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(into_response(resp))
    }
}

fn into_response(resp: reqwest::Response) -> UpstreamResponse {
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp
        .bytes_stream()
        .map_err(|e| UpstreamError::Transport(e.to_string()))
        .boxed();
    UpstreamResponse {
        status,
        headers,
        body,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
