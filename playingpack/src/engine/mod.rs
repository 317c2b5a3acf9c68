// Lifecycle engine
//
// The per-request state machine for chat-completion requests:
//
//   create -> pending -> point 1 -> processing -> reviewing -> point 2 -> complete
//                (suspensions only when intervene is on)
//
// Acquisition always buffers the full response (cache replay, upstream
// stream, or mock synthesis) before anything is written to the caller,
// so point 2 can still divert it. Also hosts the /v1 catch-all
// passthrough and the health endpoint.

use crate::broker::SessionBroker;
use crate::cache::CacheStore;
use crate::fingerprint;
use crate::mock::{self, MockGenerator, MockSpec};
use crate::session::{Point1Action, Point2Action, RequestSnapshot, ResponseSource};
use crate::settings::{CacheMode, Settings, SharedSettings};
use crate::sse::{DeltaEvent, DeltaParser, FrameDecoder, ToolCall, Usage};
use crate::upstream::UpstreamClient;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Largest request body the proxy will read.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub cache: CacheStore,
    pub upstream: Arc<dyn UpstreamClient>,
    pub settings: SharedSettings,
    pub mock: MockGenerator,
}

// ---------------------------------------------------------------------------
// Acquisition outcome
// ---------------------------------------------------------------------------

/// A fully buffered response, ready for point 2 and emission.
struct Acquired {
    buffer: Vec<u8>,
    status: StatusCode,
    source: ResponseSource,
    parser: DeltaParser,
    mocked: bool,
}

/// Failures in the body-acquisition phase.
#[derive(Debug)]
enum AcquireError {
    /// Cache-only mode with no recorded entry.
    CacheMiss,
    /// Upstream transport failure or mid-stream error.
    Upstream(String),
    /// A decision channel went away (shutdown).
    Suspended,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    let headers = request.headers().clone();
    let body_bytes = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(b) => b,
        Err(e) => return invalid_request(&format!("failed to read request body: {e}")),
    };
    let body: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return invalid_request("request body is not valid JSON"),
    };

    handle_chat(state, headers, body).await
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Catch-all for other /v1 paths: transparent passthrough.
pub async fn passthrough(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    let settings = state.settings.snapshot();
    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let headers = request.headers().clone();
    let body = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(b) => b,
        Err(e) => return invalid_request(&format!("failed to read request body: {e}")),
    };

    match state
        .upstream
        .forward_raw(&settings.upstream, method, &path_and_query, &headers, body)
        .await
    {
        Ok(upstream) => {
            let mut headers = upstream.headers;
            // The body is re-chunked by this server; the upstream's
            // framing headers no longer describe it.
            headers.remove(header::CONTENT_ENCODING);
            headers.remove(header::TRANSFER_ENCODING);

            let mut response = Response::builder().status(upstream.status);
            if let Some(h) = response.headers_mut() {
                *h = headers;
            }
            response
                .body(Body::from_stream(upstream.body))
                .unwrap_or_else(|_| proxy_error("failed to build response"))
        }
        Err(e) => {
            tracing::warn!(path = %path_and_query, error = %e, "passthrough failed");
            proxy_error(&e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Chat lifecycle
// ---------------------------------------------------------------------------

async fn handle_chat(
    state: AppState,
    headers: axum::http::HeaderMap,
    body: Value,
) -> Response<Body> {
    let settings = state.settings.snapshot();
    let id = Uuid::new_v4();
    let started = Instant::now();

    let fp = match fingerprint::fingerprint(&body) {
        Ok(fp) => fp,
        Err(e) => {
            tracing::error!(request_id = %id, error = %e, "fingerprint failed");
            return proxy_error(&format!("failed to fingerprint request: {e}"));
        }
    };

    let session = state.broker.create(id, &body, &fp, settings.intervene);
    let snapshot = session.request;
    tracing::info!(
        request_id = %id,
        model = %snapshot.model,
        stream = snapshot.stream,
        fingerprint = %&fp[..12],
        "chat request received"
    );

    let cache_available = settings.cache != CacheMode::Off && state.cache.exists(&fp);
    state.broker.set_cache_available(id, cache_available);

    // Point 1: operator decision, or auto-select by cache state.
    let choice = if settings.intervene {
        match state.broker.await_point1(id).await {
            Some(action) => action,
            None => return finish_error(&state, id, AcquireError::Suspended, &settings),
        }
    } else if cache_available {
        Point1Action::Cache
    } else if settings.cache == CacheMode::Read {
        return finish_error(&state, id, AcquireError::CacheMiss, &settings);
    } else {
        Point1Action::Llm
    };

    // Acquisition: fully buffered before any byte reaches the caller.
    let result = match &choice {
        Point1Action::Cache => acquire_cache(&state, id, &fp).await,
        Point1Action::Llm => acquire_llm(&state, id, &fp, &headers, &body, &snapshot, &settings).await,
        Point1Action::Mock { content } => Ok(acquire_mock(&state, id, content, &snapshot, false).await),
    };

    let mut acquired = match result {
        Ok(a) => a,
        Err(e) => return finish_error(&state, id, e, &settings),
    };

    // Point 2: the operator may pass the buffer through or replace it.
    if settings.intervene {
        state.broker.set_reviewing(id);
        match state.broker.await_point2(id).await {
            Some(Point2Action::Return) => {}
            Some(Point2Action::Modify { content }) => {
                state.broker.reset_response(id);
                acquired = acquire_mock(&state, id, &content, &snapshot, true).await;
            }
            None => return finish_error(&state, id, AcquireError::Suspended, &settings),
        }
    }

    emit(&state, id, acquired, &snapshot, started)
}

/// Write the buffered response to the caller and close out the session.
fn emit(
    state: &AppState,
    id: Uuid,
    acquired: Acquired,
    snapshot: &RequestSnapshot,
    started: Instant,
) -> Response<Body> {
    let sse_framed = is_sse_framed(&acquired.buffer);

    let (body_bytes, content_type) = if sse_framed && snapshot.stream {
        (acquired.buffer, "text/event-stream")
    } else if sse_framed {
        // Recorded/streamed SSE but the caller wants JSON: strip the
        // framing and emit the assembled completion.
        (
            acquired.parser.assembled_completion().to_string().into_bytes(),
            "application/json",
        )
    } else {
        (acquired.buffer, "application/json")
    };

    state.broker.set_response_source(id, acquired.source);
    state.broker.complete(id);
    tracing::info!(
        request_id = %id,
        source = ?acquired.source,
        status = acquired.status.as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "chat request complete"
    );

    let mut response = Response::builder()
        .status(acquired.status)
        .header(header::CONTENT_TYPE, content_type);
    if content_type == "text/event-stream" {
        response = response
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive");
    }
    if acquired.source == ResponseSource::Cache {
        response = response.header("x-playingpack-cached", "true");
    }
    if acquired.mocked {
        response = response.header("x-playingpack-mocked", "true");
    }
    response
        .body(Body::from(body_bytes))
        .unwrap_or_else(|_| proxy_error("failed to build response"))
}

// ---------------------------------------------------------------------------
// Acquisition paths
// ---------------------------------------------------------------------------

async fn acquire_cache(state: &AppState, id: Uuid, fp: &str) -> Result<Acquired, AcquireError> {
    let Some(record) = state.cache.load(fp) else {
        return Err(AcquireError::CacheMiss);
    };
    let status =
        StatusCode::from_u16(record.response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    state.broker.set_response_status(id, status.as_u16());

    let mut buffer = Vec::new();
    let mut decoder = FrameDecoder::new();
    let mut parser = DeltaParser::new();

    // Paced replay: the recorded inter-chunk delays reproduce upstream
    // latency for the agent under test, even though the bytes are
    // buffered here rather than streamed straight out.
    let mut stream = Box::pin(record.replay(false));
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk);
        for payload in decoder.feed(&chunk) {
            apply_events(state, id, parser.feed(&payload));
        }
    }
    if let Some(payload) = decoder.finish() {
        apply_events(state, id, parser.feed(&payload));
    }
    ingest_plain_json(state, id, &parser, &buffer);

    Ok(Acquired {
        buffer,
        status,
        source: ResponseSource::Cache,
        parser,
        mocked: false,
    })
}

async fn acquire_llm(
    state: &AppState,
    id: Uuid,
    fp: &str,
    headers: &axum::http::HeaderMap,
    body: &Value,
    snapshot: &RequestSnapshot,
    settings: &Settings,
) -> Result<Acquired, AcquireError> {
    let upstream = state
        .upstream
        .forward_chat(&settings.upstream, headers, body)
        .await
        .map_err(|e| AcquireError::Upstream(e.to_string()))?;

    let status = upstream.status;
    state.broker.set_response_status(id, status.as_u16());

    let mut writer = (settings.cache == CacheMode::ReadWrite)
        .then(|| state.cache.writer(fp, snapshot.model.as_str(), snapshot.messages.clone()));

    let mut buffer = Vec::new();
    let mut decoder = FrameDecoder::new();
    let mut parser = DeltaParser::new();

    let mut body_stream = upstream.body;
    while let Some(chunk) = body_stream.next().await {
        // A mid-stream failure drops the writer unsaved: the rename
        // never happens and no partial record becomes readable.
        let chunk = chunk.map_err(|e| AcquireError::Upstream(e.to_string()))?;
        buffer.extend_from_slice(&chunk);
        if let Some(w) = writer.as_mut() {
            w.push(&String::from_utf8_lossy(&chunk));
        }
        for payload in decoder.feed(&chunk) {
            apply_events(state, id, parser.feed(&payload));
        }
    }
    if let Some(payload) = decoder.finish() {
        apply_events(state, id, parser.feed(&payload));
    }
    ingest_plain_json(state, id, &parser, &buffer);

    if let Some(w) = writer {
        match w.save(status.as_u16()) {
            Ok(path) => {
                tracing::debug!(request_id = %id, path = %path.display(), "response recorded")
            }
            Err(e) => tracing::warn!(request_id = %id, error = %e, "failed to record response"),
        }
    }

    Ok(Acquired {
        buffer,
        status,
        source: ResponseSource::Llm,
        parser,
        mocked: false,
    })
}

async fn acquire_mock(
    state: &AppState,
    id: Uuid,
    content: &str,
    snapshot: &RequestSnapshot,
    modified: bool,
) -> Acquired {
    let spec = mock::parse(content);
    let mut parser = DeltaParser::new();

    let (buffer, status) = match &spec {
        MockSpec::Error(message) => {
            // Error mocks are always a non-streaming 400 body.
            let body = mock::error_body(message);
            state.broker.set_response_status(id, 400);
            (body.to_string().into_bytes(), StatusCode::BAD_REQUEST)
        }
        _ if snapshot.stream => {
            state.broker.set_response_status(id, 200);
            let mut decoder = FrameDecoder::new();
            let mut buffer = Vec::new();
            let mut stream = Box::pin(state.mock.sse_stream(&spec, &snapshot.model));
            while let Some(chunk) = stream.next().await {
                buffer.extend_from_slice(&chunk);
                for payload in decoder.feed(&chunk) {
                    apply_events(state, id, parser.feed(&payload));
                }
            }
            (buffer, StatusCode::OK)
        }
        _ => {
            state.broker.set_response_status(id, 200);
            let body = state.mock.completion(&spec, &snapshot.model);
            ingest_completion(state, id, &body);
            (body.to_string().into_bytes(), StatusCode::OK)
        }
    };

    if modified {
        tracing::info!(request_id = %id, "response replaced at review point");
    }

    Acquired {
        buffer,
        status,
        source: ResponseSource::Mock,
        parser,
        mocked: true,
    }
}

// ---------------------------------------------------------------------------
// Session bookkeeping helpers
// ---------------------------------------------------------------------------

/// Mirror parser observations into the session.
fn apply_events(state: &AppState, id: Uuid, events: Vec<DeltaEvent>) {
    for event in events {
        match event {
            DeltaEvent::Content(text) => state.broker.append_content(id, &text),
            DeltaEvent::ToolCallStart(call) => state.broker.push_tool_call(id, call),
            DeltaEvent::ToolCallUpdate { index, fragment } => {
                state.broker.append_tool_call_arguments(id, index, &fragment)
            }
            DeltaEvent::FinishReason(reason) => state.broker.set_finish_reason(id, reason),
            DeltaEvent::Usage(usage) => state.broker.set_usage(id, usage),
            DeltaEvent::Done => {}
            DeltaEvent::Malformed(error) => {
                tracing::warn!(request_id = %id, error = %error, "malformed SSE payload")
            }
        }
    }
}

/// Populate the session from a non-SSE JSON completion body, so the
/// operator's assembled view works for non-streaming responses too.
fn ingest_plain_json(state: &AppState, id: Uuid, parser: &DeltaParser, buffer: &[u8]) {
    if is_sse_framed(buffer) || !parser.content().is_empty() || !parser.tool_calls().is_empty() {
        return;
    }
    if let Ok(completion) = serde_json::from_slice::<Value>(buffer) {
        ingest_completion(state, id, &completion);
    }
}

fn ingest_completion(state: &AppState, id: Uuid, completion: &Value) {
    let Some(choice) = completion.get("choices").and_then(|c| c.get(0)) else {
        return;
    };
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    if let Some(content) = message.get("content").and_then(Value::as_str) {
        state.broker.append_content(id, content);
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            state.broker.push_tool_call(
                id,
                ToolCall {
                    index,
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: call
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
            );
        }
    }
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        state.broker.set_finish_reason(id, reason);
    }
    if let Some(usage) = completion.get("usage").filter(|u| !u.is_null()) {
        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
            state.broker.set_usage(id, usage);
        }
    }
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

fn finish_error(
    state: &AppState,
    id: Uuid,
    error: AcquireError,
    settings: &Settings,
) -> Response<Body> {
    let response = match &error {
        AcquireError::CacheMiss => {
            let message = format!(
                "No cached response found (cache mode: {})",
                mode_str(settings.cache)
            );
            state.broker.set_error(id, message.clone());
            state.broker.set_response_status(id, 404);
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"message": message, "type": "cache_not_found"}})),
            )
                .into_response()
        }
        AcquireError::Upstream(message) => {
            state.broker.set_error(id, message.clone());
            state.broker.set_response_status(id, 500);
            proxy_error(message)
        }
        AcquireError::Suspended => {
            let message = "decision channel closed before resolution";
            state.broker.set_error(id, message);
            proxy_error(message)
        }
    };

    state.broker.complete(id);
    tracing::warn!(request_id = %id, error = ?error, "chat request failed");
    response
}

fn proxy_error(message: &str) -> Response<Body> {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"message": message, "type": "proxy_error"}})),
    )
        .into_response()
}

fn invalid_request(message: &str) -> Response<Body> {
    (StatusCode::BAD_REQUEST, Json(mock::error_body(message))).into_response()
}

fn mode_str(mode: CacheMode) -> &'static str {
    match mode {
        CacheMode::Off => "off",
        CacheMode::Read => "read",
        CacheMode::ReadWrite => "read-write",
    }
}

fn is_sse_framed(buffer: &[u8]) -> bool {
    String::from_utf8_lossy(buffer)
        .trim_start()
        .starts_with("data:")
}
