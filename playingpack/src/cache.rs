// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Recording store
//
// Content-addressed file store for recorded upstream responses. One
// pretty-printed JSON file per fingerprint, chunks carry the inter-arrival
// delay observed at record time so replay can reproduce upstream pacing.
// Writes are all-or-nothing: write-to-temp-then-rename, so a crash
// mid-write never leaves a readable file at the final path.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Record schema
// ---------------------------------------------------------------------------

/// One response chunk as received from upstream.
///
/// `delay_ms` is the gap since the previous chunk; the first chunk of a
/// record always carries 0. Non-streaming responses are stored as a
/// single chunk holding the whole body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedChunk {
    pub data: String,
    pub delay_ms: u64,
}

/// The request half of a record, kept for operator display only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub status: u16,
    pub chunks: Vec<RecordedChunk>,
}

/// A persisted response, keyed by request fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

impl CachedResponse {
    /// Replay the recorded chunks as a byte stream.
    ///
    /// Each chunk is yielded after sleeping its recorded delay unless
    /// `fast` is set. Consumer cancellation (the receiver going away) is
    /// observed between sleeps and between yields, so an aborted consumer
    /// stops the replay within one chunk.
    pub fn replay(self, fast: bool) -> impl Stream<Item = Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(8);

        tokio::spawn(async move {
            for chunk in self.response.chunks {
                if !fast && chunk.delay_ms > 0 {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = sleep(Duration::from_millis(chunk.delay_ms)) => {}
                    }
                }
                if tx.send(Bytes::from(chunk.data)).await.is_err() {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Fingerprint-keyed store over a directory of `<64-hex>.json` files.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Whether a record exists for the fingerprint.
    pub fn exists(&self, fingerprint: &str) -> bool {
        self.path_for(fingerprint).is_file()
    }

    /// Load a record. Missing or corrupt files both read as absent — a
    /// half-written or hand-mangled record degrades to a cache miss.
    pub fn load(&self, fingerprint: &str) -> Option<CachedResponse> {
        let path = self.path_for(fingerprint);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache record, treating as miss");
                None
            }
        }
    }

    /// Start recording a response for the fingerprint.
    pub fn writer(
        &self,
        fingerprint: impl Into<String>,
        model: impl Into<String>,
        messages: Value,
    ) -> CacheWriter {
        CacheWriter {
            dir: self.dir.clone(),
            hash: fingerprint.into(),
            model: model.into(),
            messages,
            chunks: Vec::new(),
            last_chunk_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Accumulates chunks with wall-clock inter-arrival delays, then writes
/// the complete record atomically on `save`.
#[derive(Debug)]
pub struct CacheWriter {
    dir: PathBuf,
    hash: String,
    model: String,
    messages: Value,
    chunks: Vec<RecordedChunk>,
    last_chunk_at: Option<Instant>,
}

impl CacheWriter {
    /// Record one chunk. The first chunk gets delay 0; later chunks get
    /// the elapsed time since the previous `push`.
    pub fn push(&mut self, data: &str) {
        let now = Instant::now();
        let delay_ms = match self.last_chunk_at {
            Some(prev) => now.duration_since(prev).as_millis() as u64,
            None => 0,
        };
        self.last_chunk_at = Some(now);
        self.chunks.push(RecordedChunk {
            data: data.to_string(),
            delay_ms,
        });
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Finalise the record.
    ///
    /// Serialises to pretty JSON, writes to a uniquely-named temp file in
    /// the same directory, then renames over the final path. Concurrent
    /// writers for the same fingerprint converge to whichever rename
    /// lands last.
    pub fn save(self, status: u16) -> Result<PathBuf, CacheError> {
        let record = CachedResponse {
            hash: self.hash.clone(),
            timestamp: Utc::now(),
            request: RecordedRequest {
                model: self.model,
                messages: self.messages,
            },
            response: RecordedResponse {
                status,
                chunks: self.chunks,
            },
        };

        fs::create_dir_all(&self.dir).map_err(|e| CacheError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let final_path = self.dir.join(format!("{}.json", self.hash));
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", self.hash, Uuid::new_v4().simple()));

        let body = serde_json::to_vec_pretty(&record)?;
        fs::write(&tmp_path, &body).map_err(|e| CacheError::WriteFile {
            path: tmp_path.clone(),
            source: e,
        })?;
        fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::WriteFile {
                path: final_path.clone(),
                source: e,
            }
        })?;

        Ok(final_path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
