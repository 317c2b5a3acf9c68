// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface
//
// Responsibilities:
// - POST /v1/chat/completions  -> lifecycle engine
// - other /v1 paths            -> transparent passthrough
// - GET /health                -> liveness
// - GET /ws                    -> notification hub
// - /api/*                     -> decision API
// - everything else            -> 404 (the dashboard bundle is an
//   external collaborator; nothing is served when it is absent)

use crate::api;
use crate::engine::{self, AppState};
use crate::hub;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;

/// Build the axum router. All dependencies are injected through
/// `AppState` — tests swap the upstream client and cache directory.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(engine::chat_completions).fallback(engine::passthrough),
        )
        .route("/v1/{*path}", any(engine::passthrough))
        .route("/health", get(engine::health))
        .route("/ws", get(hub::ws_handler))
        .nest("/api", api::routes())
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
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
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Request};
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

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

    fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            broker: Arc::new(SessionBroker::new()),
            cache: CacheStore::new(dir.path()),
            upstream: Arc::new(UnusedUpstream),
            settings: SharedSettings::default(),
            mock: MockGenerator::instant(),
        };
        (build_router(state), dir)
    }

    #[tokio::test]
    async fn health_returns_ok_body() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "ok");
    }

    #[tokio::test]
    async fn api_health_is_wired() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreserved_paths_fall_back_to_404() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_chat_body_returns_400() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from("{{{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_settings_round_trip() {
        let (app, _dir) = app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/settings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"cache":"read"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/settings")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["cache"], "read");
        assert_eq!(v["intervene"], true);
    }

    #[tokio::test]
    async fn point_action_on_unknown_session_reports_failure() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/sessions/{}/point1", uuid::Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"type":"llm"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["success"], false);
    }

    #[tokio::test]
    async fn unknown_api_session_returns_404() {
        let (app, _dir) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/sessions/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
