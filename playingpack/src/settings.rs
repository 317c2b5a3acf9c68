// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Runtime settings
//
// Three operator-mutable knobs: cache mode, intervention, upstream URL.
// Hot-swappable: handlers take a snapshot per request, the operator UI
// patches them through the decision API or the notification hub.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// How the proxy uses the recording store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[value(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Never touch the store.
    Off,
    /// Replay recorded responses; a miss is an error (never call upstream).
    Read,
    /// Replay recorded responses; record upstream responses on a miss.
    ReadWrite,
}

/// Process-wide operator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub cache: CacheMode,
    pub intervene: bool,
    pub upstream: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheMode::ReadWrite,
            intervene: true,
            upstream: "https://api.openai.com".to_string(),
        }
    }
}

/// Partial update sent by the operator; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub cache: Option<CacheMode>,
    pub intervene: Option<bool>,
    pub upstream: Option<String>,
}

/// Shared, hot-swappable settings handle.
///
/// Readers call `snapshot()` once per request; writers go through `apply()`.
/// The lock is held only for the copy, never across awaits.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> Settings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply a patch and return the resulting settings.
    pub fn apply(&self, patch: SettingsPatch) -> Settings {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cache) = patch.cache {
            guard.cache = cache;
        }
        if let Some(intervene) = patch.intervene {
            guard.intervene = intervene;
        }
        if let Some(upstream) = patch.upstream {
            guard.upstream = upstream;
        }
        guard.clone()
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
