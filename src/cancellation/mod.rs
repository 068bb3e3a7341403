//! # Cancellation Coordinator
//!
//! Single-use cancellation tokens letting a client abort a synchronous call
//! before or during execution. Cancellation is cooperative: function bodies
//! poll `check_cancellation`; there is no preemption.
//!
//! The store offers no compare-and-set, so the `cancel` transition takes a
//! short-TTL store lock on a per-token guard key around its
//! read-modify-write. `check_cancellation` is a plain read: the status
//! transition is monotonic, so a read can never observe cancelled and later
//! active.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ForrstConfig;
use crate::constants::{defaults, key_prefixes};
use crate::error::{ForrstError, Result};
use crate::logging::log_cleanup_failure;
use crate::store::CoordinationStore;
use crate::validation::{validate_cancellation_token, validate_owner, validate_ttl};

/// Cancellation token status. One-way: active → cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Token registered, request not cancelled
    Active,
    /// Cancellation requested; terminal
    Cancelled,
}

impl TokenStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid token status: {s}")),
        }
    }
}

/// Stored record for a registered cancellation token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub owner: String,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    /// TTL the token was registered with; bounds the cancelled record's
    /// retention too
    pub ttl_seconds: u64,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub found: bool,
    pub already_cancelled: bool,
}

/// Coordinator for registering, cancelling, and polling tokens
pub struct CancellationCoordinator {
    store: Arc<dyn CoordinationStore>,
    config: ForrstConfig,
}

impl CancellationCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ForrstConfig) -> Self {
        Self { store, config }
    }

    fn token_key(token: &str) -> String {
        format!("{}{token}", key_prefixes::CANCELLATION)
    }

    fn guard_key(token: &str) -> String {
        format!("{}{token}", key_prefixes::CANCELLATION_GUARD)
    }

    async fn read_record(&self, token: &str) -> Result<Option<TokenRecord>> {
        let key = Self::token_key(token);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<TokenRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(token = %token, error = %err, "Corrupt token record, discarding");
                let _ = self.store.delete(&key).await;
                Ok(None)
            }
        }
    }

    /// Take the per-token guard lock, with a few short retries if another
    /// writer for the same token is mid-flight
    async fn take_guard(&self, token: &str, operation: &str) -> Result<String> {
        let guard_key = Self::guard_key(token);
        let guard_ttl = Duration::from_secs(defaults::CANCELLATION_GUARD_TTL_SECONDS);

        for _ in 0..10 {
            if let Some(fence) = self.store.try_lock(&guard_key, guard_ttl).await? {
                return Ok(fence);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(ForrstError::store(
            operation,
            format!("guard contention on token {token}"),
        ))
    }

    async fn release_guard(&self, token: &str, fence: &str) {
        let guard_key = Self::guard_key(token);
        if !self.store.unlock(&guard_key, fence).await.unwrap_or(false) {
            debug!(token = %token, "Cancellation guard already expired at unlock");
        }
    }

    /// Register a new cancellation token for `owner`.
    ///
    /// Rejects malformed tokens and collisions with an already-registered
    /// active token. The collision check runs under the same per-token guard
    /// lock `cancel` uses, so two concurrent registrations can never both
    /// observe the slot as free.
    pub async fn register(&self, token: &str, owner: &str, ttl_seconds: u64) -> Result<()> {
        validate_cancellation_token(token, self.config.cancellation_token_max_length)?;
        validate_owner(owner)?;
        validate_ttl(ttl_seconds, self.config.max_lock_ttl_seconds)?;

        let guard = self.take_guard(token, "register").await?;
        let outcome = self.register_under_guard(token, owner, ttl_seconds).await;
        self.release_guard(token, &guard).await;
        outcome
    }

    async fn register_under_guard(&self, token: &str, owner: &str, ttl_seconds: u64) -> Result<()> {
        if let Some(existing) = self.read_record(token).await? {
            if existing.status == TokenStatus::Active {
                return Err(ForrstError::TokenCollision {
                    token: token.to_string(),
                });
            }
        }

        let record = TokenRecord {
            token: token.to_string(),
            owner: owner.to_string(),
            status: TokenStatus::Active,
            created_at: Utc::now(),
            ttl_seconds,
        };

        let bytes = serde_json::to_vec(&record)?;
        self.store
            .put(&Self::token_key(token), bytes, Duration::from_secs(ttl_seconds))
            .await?;

        info!(token = %token, owner = %owner, ttl_seconds = ttl_seconds, "Cancellation token registered");
        Ok(())
    }

    /// Request cancellation via `token`.
    ///
    /// The check-and-set runs under a store-level guard lock: the status is
    /// re-read inside the guard, and only an active token transitions to
    /// cancelled. When `requesting_owner` is supplied it must match the
    /// registered owner.
    pub async fn cancel(
        &self,
        token: &str,
        requesting_owner: Option<&str>,
    ) -> Result<CancelOutcome> {
        validate_cancellation_token(token, self.config.cancellation_token_max_length)?;

        let guard = self.take_guard(token, "cancel").await?;
        let outcome = self.cancel_under_guard(token, requesting_owner).await;
        self.release_guard(token, &guard).await;
        outcome
    }

    async fn cancel_under_guard(
        &self,
        token: &str,
        requesting_owner: Option<&str>,
    ) -> Result<CancelOutcome> {
        let Some(record) = self.read_record(token).await? else {
            return Ok(CancelOutcome {
                found: false,
                already_cancelled: false,
            });
        };

        if let Some(requester) = requesting_owner {
            if requester != record.owner {
                return Err(ForrstError::unauthorized("cancel", token));
            }
        }

        if record.status.is_terminal() {
            return Ok(CancelOutcome {
                found: true,
                already_cancelled: true,
            });
        }

        let cancelled = TokenRecord {
            status: TokenStatus::Cancelled,
            ..record
        };
        // The cancelled record only needs to outlive in-flight polls; it
        // must not outlast the window the token was registered for.
        let retention = cancelled
            .ttl_seconds
            .min(defaults::CANCELLATION_TOKEN_TTL_SECONDS);
        let bytes = serde_json::to_vec(&cancelled)?;
        self.store
            .put(
                &Self::token_key(token),
                bytes,
                Duration::from_secs(retention),
            )
            .await?;

        info!(token = %token, "Cancellation token cancelled");
        Ok(CancelOutcome {
            found: true,
            already_cancelled: false,
        })
    }

    /// Poll for cancellation inside a long-running function body.
    ///
    /// Raises `Cancelled` the instant the status is observed as cancelled.
    /// An absent token (already consumed or expired) reads as not
    /// cancelled.
    pub async fn check_cancellation(&self, token: &str) -> Result<()> {
        validate_cancellation_token(token, self.config.cancellation_token_max_length)?;

        match self.read_record(token).await? {
            Some(record) if record.status == TokenStatus::Cancelled => {
                Err(ForrstError::Cancelled {
                    token: token.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Current status of `token`, if registered
    pub async fn status(&self, token: &str) -> Result<Option<TokenStatus>> {
        validate_cancellation_token(token, self.config.cancellation_token_max_length)?;
        Ok(self.read_record(token).await?.map(|r| r.status))
    }

    /// Remove the token record. Invoked unconditionally at the end of a
    /// request regardless of success, error, or cancellation; failures are
    /// logged, never raised.
    pub async fn cleanup(&self, token: &str) {
        if let Err(err) = self.store.delete(&Self::token_key(token)).await {
            log_cleanup_failure("cancellation", token, &err.to_string());
        }
    }
}
