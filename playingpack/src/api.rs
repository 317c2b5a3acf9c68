// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Decision API
//
// Request/response twin of the notification hub's inbound messages, for
// clients that prefer plain HTTP over a persistent socket. Action
// endpoints report `{success}`: whether a suspension was actually
// pending. Mid-stream content is not pushed anywhere, so UIs that want
// live text poll `GET /api/sessions/{id}`.

use crate::engine::AppState;
use crate::session::{Point1Action, Point2Action, Session};
use crate::settings::{Settings, SettingsPatch};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct ActionResult {
    success: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(get_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/point1", axum::routing::post(point1_action))
        .route("/sessions/{id}/point2", axum::routing::post(point2_action))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/health", get(health))
}

async fn get_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.broker.sessions())
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.broker.session(id) {
        Some(session) => Json(session).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("no session {id}"), "type": "not_found"}})),
        )
            .into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.snapshot())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Json<Settings> {
    let updated = state.settings.apply(patch);
    tracing::info!(
        cache = ?updated.cache,
        intervene = updated.intervene,
        upstream = %updated.upstream,
        "settings updated via api"
    );
    Json(updated)
}

async fn point1_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(action): Json<Point1Action>,
) -> Json<ActionResult> {
    let success = state.broker.resolve_point1(id, action);
    Json(ActionResult { success })
}

async fn point2_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(action): Json<Point2Action>,
) -> Json<ActionResult> {
    let success = state.broker.resolve_point2(id, action);
    Json(ActionResult { success })
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
