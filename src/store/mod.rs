//! # Coordination Store
//!
//! Narrow interface over the external key-value service every primitive
//! coordinates through. The store offers per-key TTL and a best-effort
//! lock primitive (Redis-style `SET NX`) — no transactions and no atomic
//! multi-key writes. Everything stronger (mutual exclusion metadata,
//! cache validity, at-most-once cancellation) is built on top of this
//! interface by the lock, cache, and cancellation modules.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{InMemoryStore, SimulatedClock};

/// Abstract key-value store with TTL and a lock primitive.
///
/// Implementations are injected into the primitives (Redis, etcd, or the
/// in-memory double for tests); there is no ambient/global store access.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key` with the given TTL, overwriting any
    /// existing value
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Remove `key`. Returns true if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Attempt to take the store-level mutex for `key`. On success returns
    /// an opaque fencing token required to unlock; returns `None` if the
    /// mutex is already held.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>>;

    /// Release the store-level mutex for `key`, if `token` still matches
    /// the current holder. Returns true on release, false if the token is
    /// stale or the mutex is not held.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}
