//! # Distributed Lock Manager
//!
//! Application-level named locks built on the coordination store's
//! best-effort mutex primitive. Each held lock is a pair of store keys:
//! the mutex itself (`forrst:lock:<key>`) and a metadata record
//! (`forrst:lock:meta:<key>`) carrying owner, expiry, and the fencing
//! token needed to unlock.
//!
//! The metadata record is written strictly between mutex acquisition and
//! `acquire` returning, and always with a TTL of `mutex TTL + skew buffer`,
//! so metadata can never be observed absent while the mutex is held, nor
//! outlive a crashed holder's mutex by more than the skew window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ForrstConfig;
use crate::constants::key_prefixes;
use crate::error::{ForrstError, Result};
use crate::logging::{log_cleanup_failure, log_lock_audit};
use crate::store::CoordinationStore;
use crate::validation::{validate_lock_key, validate_owner, validate_ttl};

/// Persistent metadata for a held lock.
///
/// Exists in the store iff the mutex for `key` is held. The fencing token
/// authorizes unlock at the store level and is never exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    token: String,
}

impl LockRecord {
    /// Fencing token for store-level unlock (crate-internal)
    pub(crate) fn token(&self) -> &str {
        &self.token
    }
}

/// Caller-held proof of acquisition, consumed by release and by the
/// pipeline's auto-release path
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    token: String,
}

/// Manager for acquire/release/extend of named application locks
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: ForrstConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ForrstConfig) -> Self {
        Self { store, config }
    }

    fn mutex_key(key: &str) -> String {
        format!("{}{key}", key_prefixes::LOCK_MUTEX)
    }

    fn metadata_key(key: &str) -> String {
        format!("{}{key}", key_prefixes::LOCK_METADATA)
    }

    fn metadata_ttl(&self, ttl_seconds: u64) -> Duration {
        Duration::from_secs(ttl_seconds + self.config.lock_metadata_skew_seconds)
    }

    /// Acquire the lock named `key` for `owner`.
    ///
    /// Without `block_timeout` this is a single non-blocking attempt that
    /// fails with `LockAcquisitionFailed` if the mutex is held. With
    /// `block_timeout`, the store primitive is retried until it succeeds or
    /// the timeout elapses (`LockTimeout`).
    pub async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl_seconds: u64,
        block_timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        validate_lock_key(key, self.config.lock_key_max_length)?;
        validate_owner(owner)?;
        validate_ttl(ttl_seconds, self.config.max_lock_ttl_seconds)?;

        let mutex_key = Self::mutex_key(key);
        let started = Instant::now();
        let retry_interval = Duration::from_millis(self.config.lock_retry_interval_ms);

        loop {
            let attempt = self
                .store
                .try_lock(&mutex_key, Duration::from_secs(ttl_seconds))
                .await?;

            if let Some(token) = attempt {
                return self.finish_acquire(key, owner, ttl_seconds, token).await;
            }

            match block_timeout {
                Some(timeout) if started.elapsed() + retry_interval <= timeout => {
                    tokio::time::sleep(retry_interval).await;
                }
                Some(timeout) => {
                    debug!(key = %key, owner = %owner, "Lock acquisition timed out");
                    return Err(ForrstError::lock_timeout(key, timeout.as_millis() as u64));
                }
                None => {
                    debug!(key = %key, owner = %owner, "Lock held, non-blocking attempt failed");
                    return Err(ForrstError::lock_acquisition_failed(key));
                }
            }
        }
    }

    /// Write the metadata record through the freshly-acquired mutex. If the
    /// write fails the mutex is rolled back so neither half survives alone.
    async fn finish_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl_seconds: u64,
        token: String,
    ) -> Result<LockHandle> {
        let acquired_at = Utc::now();
        let expires_at = acquired_at + chrono::Duration::seconds(ttl_seconds as i64);

        let record = LockRecord {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at,
            expires_at,
            ttl_seconds,
            token: token.clone(),
        };

        let bytes = serde_json::to_vec(&record)?;
        let write = self
            .store
            .put(&Self::metadata_key(key), bytes, self.metadata_ttl(ttl_seconds))
            .await;

        if let Err(err) = write {
            // Roll back the mutex; a lock without metadata is unreleasable
            // by owner and invisible to force-release.
            if let Err(unlock_err) = self.store.unlock(&Self::mutex_key(key), &token).await {
                error!(
                    key = %key,
                    error = %unlock_err,
                    "Failed to roll back mutex after metadata write failure"
                );
            }
            return Err(err);
        }

        info!(
            key = %key,
            owner = %owner,
            ttl_seconds = ttl_seconds,
            expires_at = %expires_at.to_rfc3339(),
            "Lock acquired"
        );

        Ok(LockHandle {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at,
            expires_at,
            ttl_seconds,
            token,
        })
    }

    /// Read and decode the metadata record for `key`.
    ///
    /// Structurally-invalid metadata is removed and reported as absent; the
    /// mutex then frees itself at TTL.
    async fn read_record(&self, key: &str) -> Result<Option<LockRecord>> {
        let metadata_key = Self::metadata_key(key);
        let Some(bytes) = self.store.get(&metadata_key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                error!(key = %key, error = %err, "Corrupt lock metadata, discarding");
                let _ = self.store.delete(&metadata_key).await;
                Ok(None)
            }
        }
    }

    /// Remove the metadata record after an unlock attempt. When the unlock
    /// failed and the mutex is now held under a different fencing token, the
    /// key was re-acquired and the metadata slot belongs to the new holder:
    /// it must survive. Failures are logged, never raised.
    async fn clear_metadata(&self, key: &str, token: &str, released: bool) {
        if !released {
            match self.store.get(&Self::mutex_key(key)).await {
                Ok(Some(bytes)) if bytes != token.as_bytes() => {
                    debug!(key = %key, "Mutex held by a new owner, leaving metadata in place");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    log_cleanup_failure("lock_manager", key, &err.to_string());
                    return;
                }
            }
        }

        if let Err(err) = self.store.delete(&Self::metadata_key(key)).await {
            log_cleanup_failure("lock_manager", key, &err.to_string());
        }
    }

    /// Release the lock named `key`, authorized by `owner`.
    ///
    /// Releases the mutex first, then deletes metadata: if the metadata
    /// delete fails the lock is still correctly free and the record expires
    /// on its own TTL.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        validate_lock_key(key, self.config.lock_key_max_length)?;
        validate_owner(owner)?;

        let record = self
            .read_record(key)
            .await?
            .ok_or_else(|| ForrstError::lock_not_found(key))?;

        if record.owner != owner {
            warn!(key = %key, requested_by = %owner, "Release denied: ownership mismatch");
            return Err(ForrstError::ownership_mismatch(key, owner));
        }

        let released = self
            .store
            .unlock(&Self::mutex_key(key), record.token())
            .await?;

        self.clear_metadata(key, record.token(), released).await;

        info!(key = %key, owner = %owner, released = released, "Lock released");
        Ok(released)
    }

    /// Administratively release the lock named `key` regardless of owner.
    ///
    /// The authorization predicate is consulted against the live record;
    /// there is no default grant. Every outcome is audit-logged.
    pub async fn force_release<F>(&self, key: &str, authorize: F) -> Result<bool>
    where
        F: Fn(&LockRecord) -> bool,
    {
        validate_lock_key(key, self.config.lock_key_max_length)?;

        let record = self.read_record(key).await?.ok_or_else(|| {
            log_lock_audit("force_release", key, None, "not_found");
            ForrstError::lock_not_found(key)
        })?;

        if !authorize(&record) {
            log_lock_audit("force_release", key, Some(&record.owner), "denied");
            return Err(ForrstError::unauthorized("force_release", key));
        }

        let released = self
            .store
            .unlock(&Self::mutex_key(key), record.token())
            .await?;

        self.clear_metadata(key, record.token(), released).await;

        log_lock_audit("force_release", key, Some(&record.owner), "released");
        Ok(released)
    }

    /// Extend the lock named `key` by `additional_seconds`, authorized by
    /// `owner`. Rejects extensions that would push the total TTL past
    /// `MAX_LOCK_TTL_SECONDS`. Returns the new expiry.
    pub async fn extend(
        &self,
        key: &str,
        owner: &str,
        additional_seconds: u64,
    ) -> Result<DateTime<Utc>> {
        validate_lock_key(key, self.config.lock_key_max_length)?;
        validate_owner(owner)?;

        // The extension itself must be a valid TTL; this also keeps the
        // arithmetic below away from u64 overflow.
        validate_ttl(additional_seconds, self.config.max_lock_ttl_seconds)?;

        let record = self
            .read_record(key)
            .await?
            .ok_or_else(|| ForrstError::lock_not_found(key))?;

        if record.owner != owner {
            return Err(ForrstError::ownership_mismatch(key, owner));
        }

        let total_ttl = record
            .ttl_seconds
            .checked_add(additional_seconds)
            .ok_or_else(|| ForrstError::invalid_input("Extension overflows the lock TTL"))?;
        validate_ttl(total_ttl, self.config.max_lock_ttl_seconds)?;

        let now = Utc::now();
        let new_expires_at = record.expires_at + chrono::Duration::seconds(additional_seconds as i64);
        let remaining = (new_expires_at - now)
            .to_std()
            .map_err(|_| ForrstError::lock_not_found(key))?;

        // Confirm the mutex is still ours before refreshing it. The store
        // offers no compare-and-set, so a holder expiring in the window
        // between this read and the put below loses fencing; the window is
        // a single round-trip wide.
        let mutex_key = Self::mutex_key(key);
        match self.store.get(&mutex_key).await? {
            Some(bytes) if bytes == record.token().as_bytes() => {}
            _ => {
                debug!(key = %key, owner = %owner, "Mutex lost before extend");
                return Err(ForrstError::lock_not_found(key));
            }
        }

        self.store
            .put(&mutex_key, record.token().as_bytes().to_vec(), remaining)
            .await?;

        let updated = LockRecord {
            expires_at: new_expires_at,
            ttl_seconds: total_ttl,
            ..record
        };
        let bytes = serde_json::to_vec(&updated)?;
        self.store
            .put(
                &Self::metadata_key(key),
                bytes,
                remaining + Duration::from_secs(self.config.lock_metadata_skew_seconds),
            )
            .await?;

        info!(
            key = %key,
            owner = %owner,
            additional_seconds = additional_seconds,
            new_expires_at = %new_expires_at.to_rfc3339(),
            "Lock extended"
        );

        Ok(new_expires_at)
    }

    /// Best-effort release via a held handle; used by the pipeline's
    /// cleanup path after an abort. Failures are logged, never raised.
    pub async fn release_handle(&self, handle: &LockHandle) -> bool {
        let released = match self
            .store
            .unlock(&Self::mutex_key(&handle.key), &handle.token)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                log_cleanup_failure("lock_manager", &handle.key, &err.to_string());
                false
            }
        };

        self.clear_metadata(&handle.key, &handle.token, released).await;

        if released {
            info!(key = %handle.key, owner = %handle.owner, "Lock auto-released");
        }
        released
    }

    /// Current metadata for `key`, if the lock is held
    pub async fn inspect(&self, key: &str) -> Result<Option<LockRecord>> {
        validate_lock_key(key, self.config.lock_key_max_length)?;
        self.read_record(key).await
    }
}
