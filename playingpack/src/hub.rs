// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Notification hub
//
// Persistent full-duplex channel to operator UIs over /ws. On connect the
// hub replays a snapshot of every session, then forwards broker events as
// they happen. Inbound messages carry operator decisions (and settings
// patches); unknown messages are ignored, `ping` gets a `pong`, and any
// transport error unsubscribes and closes quietly.

use crate::engine::AppState;
use crate::session::{Point1Action, Point2Action, SessionEvent};
use crate::settings::SettingsPatch;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Inbound operator messages. Mirrors the decision API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    #[serde(rename_all = "camelCase")]
    Point1Action {
        request_id: Uuid,
        action: Point1Action,
    },
    #[serde(rename_all = "camelCase")]
    Point2Action {
        request_id: Uuid,
        action: Point2Action,
    },
    UpdateSettings { settings: SettingsPatch },
    Ping,
}

/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let mut events = state.broker.subscribe();

    // Snapshot first: one request_update per existing session, oldest
    // first, so a freshly attached UI starts consistent.
    for session in state.broker.sessions() {
        let event = SessionEvent::RequestUpdate { session };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The UI re-syncs from the next update; sessions are
                    // full snapshots, not diffs.
                    tracing::debug!(skipped, "hub subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = dispatch(&state, text.as_str()) {
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "hub transport error");
                    break;
                }
            },
        }
    }
    // Dropping `events` unsubscribes.
}

/// Handle one inbound text message; returns an optional reply.
fn dispatch(state: &AppState, text: &str) -> Option<String> {
    // Unknown or malformed messages are ignored by design.
    let message = serde_json::from_str::<InboundMessage>(text).ok()?;
    match message {
        InboundMessage::Point1Action { request_id, action } => {
            let resolved = state.broker.resolve_point1(request_id, action);
            tracing::debug!(session_id = %request_id, resolved, "hub point-1 action");
            None
        }
        InboundMessage::Point2Action { request_id, action } => {
            let resolved = state.broker.resolve_point2(request_id, action);
            tracing::debug!(session_id = %request_id, resolved, "hub point-2 action");
            None
        }
        InboundMessage::UpdateSettings { settings } => {
            let updated = state.settings.apply(settings);
            tracing::info!(
                cache = ?updated.cache,
                intervene = updated.intervene,
                upstream = %updated.upstream,
                "settings updated via hub"
            );
            None
        }
        InboundMessage::Ping => Some(r#"{"type":"pong"}"#.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionBroker;
    use crate::cache::CacheStore;
    use crate::mock::MockGenerator;
    use crate::settings::SharedSettings;
    use crate::upstream::{UpstreamClient, UpstreamError, UpstreamResponse};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct UnusedUpstream;

    #[async_trait]
    impl UpstreamClient for UnusedUpstream {
        async fn forward_chat(
            &self,
            _upstream: &str,
            _headers: &HeaderMap,
            _body: &Value,
        ) -> Result<UpstreamResponse, UpstreamError> {
            Err(UpstreamError::Transport("not used".to_string()))
        }

        async fn forward_raw(
            &self,
            _upstream: &str,
            _method: Method,
            _path_and_query: &str,
            _headers: &HeaderMap,
            _body: Bytes,
        ) -> Result<UpstreamResponse, UpstreamError> {
            Err(UpstreamError::Transport("not used".to_string()))
        }
    }

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            broker: Arc::new(SessionBroker::new()),
            cache: CacheStore::new(dir.path()),
            upstream: Arc::new(UnusedUpstream),
            settings: SharedSettings::default(),
            mock: MockGenerator::instant(),
        };
        (state, dir)
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let (state, _dir) = test_state();
        let reply = dispatch(&state, r#"{"type":"ping"}"#);
        assert_eq!(reply.as_deref(), Some(r#"{"type":"pong"}"#));
    }

    #[tokio::test]
    async fn unknown_messages_are_ignored() {
        let (state, _dir) = test_state();
        assert!(dispatch(&state, r#"{"type":"mystery"}"#).is_none());
        assert!(dispatch(&state, "not json at all").is_none());
    }

    #[tokio::test]
    async fn point1_message_resolves_a_pending_suspension() {
        let (state, _dir) = test_state();
        let id = Uuid::new_v4();
        state.broker.create(id, &json!({"model": "gpt-4"}), "fp", true);

        let waiter = {
            let broker = state.broker.clone();
            tokio::spawn(async move { broker.await_point1(id).await })
        };
        tokio::task::yield_now().await;

        let text = format!(r#"{{"type":"point1_action","requestId":"{id}","action":{{"type":"mock","content":"hi"}}}}"#);
        // Retry until the waiter has registered.
        loop {
            dispatch(&state, &text);
            if waiter.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(
            waiter.await.unwrap(),
            Some(Point1Action::Mock {
                content: "hi".to_string()
            })
        );
    }

    #[tokio::test]
    async fn point_action_without_suspension_is_a_no_op() {
        let (state, _dir) = test_state();
        let id = Uuid::new_v4();
        state.broker.create(id, &json!({}), "fp", true);
        let text = format!(r#"{{"type":"point2_action","requestId":"{id}","action":{{"type":"return"}}}}"#);
        assert!(dispatch(&state, &text).is_none());
        // No state change either.
        assert_eq!(
            state.broker.session(id).unwrap().state,
            crate::session::SessionState::Pending
        );
    }

    #[tokio::test]
    async fn update_settings_message_patches_settings() {
        let (state, _dir) = test_state();
        dispatch(
            &state,
            r#"{"type":"update_settings","settings":{"intervene":false,"cache":"off"}}"#,
        );
        let snapshot = state.settings.snapshot();
        assert!(!snapshot.intervene);
        assert_eq!(snapshot.cache, crate::settings::CacheMode::Off);
    }
}
