// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

// Request fingerprinting
//
// A fingerprint is the SHA-256 hex digest of the canonicalised request
// body. Canonicalisation sorts mapping keys at every depth and drops the
// fields that vary between otherwise-identical requests, so a request
// replayed by an agent under test hits the same recording every run.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Keys dropped at every nesting depth before hashing.
///
/// `stream` changes the transport, not the conversation; `request_id`
/// and `timestamp` are injected by client SDKs and differ per call.
const IGNORED_KEYS: &[&str] = &["stream", "request_id", "timestamp"];

/// Recursively canonicalise a JSON value.
///
/// Mappings are rebuilt with the ignored keys removed and their remaining
/// keys sorted; sequences are mapped element-wise; primitives pass
/// through. Idempotent: `normalize(normalize(v)) == normalize(v)`.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json's default Map is BTree-backed, so insertion
            // order here is already lexicographic on serialisation.
            let mut out = Map::new();
            for (key, val) in map {
                if IGNORED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), normalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Compute the fingerprint of a request body.
///
/// Lowercase hex SHA-256 over the compact UTF-8 serialisation of the
/// canonical form. Fails only if serialisation fails.
pub fn fingerprint(body: &Value) -> Result<String, serde_json::Error> {
    let canonical = normalize(body);
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
