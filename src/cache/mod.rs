//! # Conditional Cache Validator
//!
//! Strong validators (ETags) and conditional response caching over the
//! coordination store. ETags are full SHA-256 digests of a canonical JSON
//! serialization — serde_json keeps object keys sorted, so structurally
//! equal values always serialize to identical bytes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ForrstConfig;
use crate::constants::key_prefixes;
use crate::error::Result;
use crate::store::CoordinationStore;
use crate::validation::validate_ttl;

/// A cached response snapshot with its validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: serde_json::Value,
    pub etag: String,
    pub stored_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Compute the strong validator for a response value.
///
/// Deterministic: the same value always yields the same ETag. The full
/// 64-hex-character digest is kept; truncation would weaken the
/// collision-resistance the validator's authority rests on.
pub fn etag(value: &serde_json::Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the cache key for a function call.
///
/// A version is always part of the key: an explicit one when supplied,
/// otherwise a stable default derived from the function's own identity —
/// never a wildcard, so upgrading a function can never serve entries from
/// a prior implementation.
pub fn cache_key(function: &str, version: Option<&str>, arguments: &serde_json::Value) -> String {
    let derived;
    let version = match version {
        Some(v) => v,
        None => {
            let mut hasher = Sha256::new();
            hasher.update(function.as_bytes());
            derived = hex::encode(&hasher.finalize()[..6]);
            &derived
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(arguments.to_string().as_bytes());
    let args_digest = hex::encode(hasher.finalize());

    format!("{}{function}:{version}:{args_digest}", key_prefixes::CACHE)
}

/// Constant-time equality over the full validator strings
fn etags_match(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Decide whether a client's cached copy is still valid.
///
/// An ETag match is authoritative and short-circuits the timestamp path.
/// Without a client ETag, the copy is valid iff the resource was not
/// modified after the client's last-known-modified time.
pub fn is_valid(
    client_etag: Option<&str>,
    client_last_known_modified: Option<DateTime<Utc>>,
    current_etag: &str,
    current_modified: Option<DateTime<Utc>>,
) -> bool {
    if let Some(client_etag) = client_etag {
        return etags_match(client_etag, current_etag);
    }

    match (client_last_known_modified, current_modified) {
        (Some(client_modified), Some(current)) => current <= client_modified,
        _ => false,
    }
}

/// Conditional response cache over the coordination store
pub struct CacheValidator {
    store: Arc<dyn CoordinationStore>,
    config: ForrstConfig,
}

impl CacheValidator {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ForrstConfig) -> Self {
        Self { store, config }
    }

    /// Store a response snapshot under `key`.
    ///
    /// Returns false (logging, not failing) when the serialized entry
    /// exceeds the configured size cap, to bound storage blow-up.
    pub async fn store(
        &self,
        key: &str,
        response: &serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<bool> {
        validate_ttl(ttl_seconds, self.config.max_cache_ttl_seconds)?;

        let entry = CacheEntry {
            key: key.to_string(),
            response: response.clone(),
            etag: etag(response),
            stored_at: Utc::now(),
            ttl_seconds,
        };

        let bytes = serde_json::to_vec(&entry)?;
        if bytes.len() > self.config.max_cache_entry_bytes {
            warn!(
                key = %key,
                size_bytes = bytes.len(),
                limit_bytes = self.config.max_cache_entry_bytes,
                "Cache entry too large, skipping store"
            );
            return Ok(false);
        }

        self.store
            .put(key, bytes, Duration::from_secs(ttl_seconds))
            .await?;

        debug!(key = %key, etag = %entry.etag, ttl_seconds = ttl_seconds, "Cache entry stored");
        Ok(true)
    }

    /// Fetch the entry stored under `key`, if any.
    ///
    /// Structurally-invalid stored data is deleted and treated as a miss
    /// rather than surfacing a deserialization error to the caller.
    pub async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(key = %key, error = %err, "Corrupt cache entry, deleting");
                let _ = self.store.delete(key).await;
                Ok(None)
            }
        }
    }
}
