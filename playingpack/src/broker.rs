// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Session broker
//
// Owns the live session map, fans out update events to subscribers, and
// couples in-flight lifecycle tasks with asynchronous operator decisions
// through two single-shot suspension points per session.
//
// Every mutator except the per-token content append publishes a
// request_update; the append is silent to avoid event storms, and
// subscribers re-sync on the next emission.

use crate::session::{
    Point1Action, Point2Action, ResponseSource, Session, SessionEvent, SessionState,
};
use crate::sse::{ToolCall, Usage};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// Completed sessions are evicted once the map would exceed this.
pub const MAX_RETAINED_SESSIONS: usize = 100;

/// How often the background reaper runs.
const REAP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

pub struct SessionBroker {
    sessions: DashMap<Uuid, Session>,
    events: broadcast::Sender<SessionEvent>,
    point1: DashMap<Uuid, oneshot::Sender<Point1Action>>,
    point2: DashMap<Uuid, oneshot::Sender<Point2Action>>,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            events,
            point1: DashMap::new(),
            point2: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    /// Subscribe to session updates. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, session: Session) {
        // No subscribers is not an error; slow subscribers lag and
        // re-sync from the session list.
        let _ = self.events.send(SessionEvent::RequestUpdate { session });
    }

    // -----------------------------------------------------------------------
    // Creation and lookup
    // -----------------------------------------------------------------------

    /// Create a session for an inbound request and publish it.
    pub fn create(
        &self,
        id: Uuid,
        body: &Value,
        fingerprint: impl Into<String>,
        intervene: bool,
    ) -> Session {
        let session = Session::new(id, body, fingerprint, intervene);
        self.sessions.insert(id, session.clone());
        self.emit(session.clone());
        session
    }

    pub fn session(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// All sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // -----------------------------------------------------------------------
    // State mutators
    // -----------------------------------------------------------------------

    /// Mutate a session and publish the result. Returns the snapshot that
    /// was published, if the session exists and the mutation applied.
    fn mutate(&self, id: Uuid, f: impl FnOnce(&mut Session) -> bool) -> Option<Session> {
        let snapshot = {
            let mut entry = self.sessions.get_mut(&id)?;
            if !f(&mut entry) {
                return None;
            }
            entry.clone()
        };
        self.emit(snapshot.clone());
        Some(snapshot)
    }

    pub fn set_processing(&self, id: Uuid) {
        self.mutate(id, |s| {
            if s.state == SessionState::Complete {
                return false;
            }
            s.state = SessionState::Processing;
            if s.processing_started_at.is_none() {
                s.processing_started_at = Some(Utc::now());
            }
            true
        });
    }

    pub fn set_reviewing(&self, id: Uuid) {
        self.mutate(id, |s| {
            if s.state == SessionState::Complete {
                return false;
            }
            s.state = SessionState::Reviewing;
            true
        });
    }

    /// Terminal transition; idempotent, and the resulting event is the
    /// last one published for the session.
    pub fn complete(&self, id: Uuid) {
        self.mutate(id, |s| {
            if s.state == SessionState::Complete {
                return false;
            }
            s.state = SessionState::Complete;
            s.completed_at = Some(Utc::now());
            true
        });
    }

    pub fn set_error(&self, id: Uuid, message: impl Into<String>) {
        let message = message.into();
        self.mutate(id, |s| {
            s.error = Some(message);
            true
        });
    }

    pub fn set_cache_available(&self, id: Uuid, available: bool) {
        self.mutate(id, |s| {
            s.cache_available = available;
            true
        });
    }

    pub fn set_response_source(&self, id: Uuid, source: ResponseSource) {
        self.mutate(id, |s| {
            s.response_source = Some(source);
            true
        });
    }

    pub fn set_response_status(&self, id: Uuid, status: u16) {
        self.mutate(id, |s| {
            s.response_mut().status = Some(status);
            true
        });
    }

    /// Append streamed text. Deliberately silent: no event per token.
    pub fn append_content(&self, id: Uuid, text: &str) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.response_mut().content.push_str(text);
        }
    }

    pub fn push_tool_call(&self, id: Uuid, call: ToolCall) {
        self.mutate(id, |s| {
            s.response_mut().tool_calls.push(call);
            true
        });
    }

    pub fn append_tool_call_arguments(&self, id: Uuid, index: usize, fragment: &str) {
        self.mutate(id, |s| {
            let response = s.response_mut();
            match response.tool_calls.iter_mut().find(|tc| tc.index == index) {
                Some(call) => {
                    call.arguments.push_str(fragment);
                    true
                }
                None => false,
            }
        });
    }

    /// Discard the assembled response; used when a review-point modify
    /// replaces the buffer before re-synthesis.
    pub fn reset_response(&self, id: Uuid) {
        self.mutate(id, |s| {
            s.response = None;
            true
        });
    }

    pub fn set_finish_reason(&self, id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        self.mutate(id, |s| {
            s.response_mut().finish_reason = Some(reason);
            true
        });
    }

    pub fn set_usage(&self, id: Uuid, usage: Usage) {
        self.mutate(id, |s| {
            s.response_mut().usage = Some(usage);
            true
        });
    }

    // -----------------------------------------------------------------------
    // Decision points
    // -----------------------------------------------------------------------

    /// Suspend until the operator resolves point 1 for this session.
    ///
    /// Exactly one awaiter per session per point; a second concurrent
    /// await is a programmer error and displaces the first.
    ///
    /// Returns `None` if the pending decision was discarded (shutdown).
    pub async fn await_point1(&self, id: Uuid) -> Option<Point1Action> {
        let (tx, rx) = oneshot::channel();
        if self.point1.insert(id, tx).is_some() {
            tracing::error!(session_id = %id, "duplicate point-1 awaiter displaced");
            debug_assert!(false, "duplicate point-1 awaiter for {id}");
        }
        rx.await.ok()
    }

    pub async fn await_point2(&self, id: Uuid) -> Option<Point2Action> {
        let (tx, rx) = oneshot::channel();
        if self.point2.insert(id, tx).is_some() {
            tracing::error!(session_id = %id, "duplicate point-2 awaiter displaced");
            debug_assert!(false, "duplicate point-2 awaiter for {id}");
        }
        rx.await.ok()
    }

    /// Deliver a point-1 decision. The pending → processing transition is
    /// applied (and published) before the awaiter resumes. Returns false
    /// when no suspension was pending.
    pub fn resolve_point1(&self, id: Uuid, action: Point1Action) -> bool {
        let Some((_, tx)) = self.point1.remove(&id) else {
            return false;
        };
        self.set_processing(id);
        // The awaiter may be gone (client disconnected while suspended);
        // the session is retained either way and the write suppressed.
        let _ = tx.send(action);
        true
    }

    /// Deliver a point-2 decision. Point 2 consumes the reviewing state;
    /// the engine drives the remaining transitions after it resumes.
    pub fn resolve_point2(&self, id: Uuid, action: Point2Action) -> bool {
        let Some((_, tx)) = self.point2.remove(&id) else {
            return false;
        };
        let _ = tx.send(action);
        true
    }

    // -----------------------------------------------------------------------
    // Reaping
    // -----------------------------------------------------------------------

    /// Evict oldest completed sessions until the map fits the cap.
    /// Suspended and in-flight sessions are never evicted.
    pub fn reap(&self) {
        if self.sessions.len() <= MAX_RETAINED_SESSIONS {
            return;
        }
        let mut completed: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Complete)
            .map(|s| (s.id, s.completed_at.unwrap_or(s.created_at)))
            .collect();
        completed.sort_by_key(|(_, at)| *at);

        let excess = self.sessions.len() - MAX_RETAINED_SESSIONS;
        for (id, _) in completed.into_iter().take(excess) {
            self.sessions.remove(&id);
            self.point1.remove(&id);
            self.point2.remove(&id);
        }
    }

    /// Run the reaper on an interval until the broker is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match broker.upgrade() {
                    Some(broker) => broker.reap(),
                    None => return,
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
