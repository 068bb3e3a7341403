//! In-memory coordination store double with Redis-like semantics.
//!
//! Models a single keyspace: `try_lock` is SET-NX storing a generated
//! fencing token as the key's value, `unlock` is compare-and-delete.
//! Expiry is evaluated lazily against a simulated clock so tests can cross
//! TTL boundaries without sleeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::store::CoordinationStore;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Duration,
}

/// Monotonic clock that tests can advance manually.
///
/// Real deployments talk to a remote store and never construct this type;
/// it exists so TTL behavior is testable deterministically.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    epoch: Instant,
    offset: Arc<std::sync::Mutex<Duration>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Arc::new(std::sync::Mutex::new(Duration::ZERO)),
        }
    }

    /// Time elapsed since the clock was created, including manual advances
    pub fn now(&self) -> Duration {
        let offset = *self.offset.lock().expect("clock mutex poisoned");
        self.epoch.elapsed() + offset
    }

    /// Advance the clock without sleeping
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().expect("clock mutex poisoned");
        *offset += by;
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory store double for tests and single-process deployments
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    clock: SimulatedClock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: SimulatedClock::new(),
        }
    }

    pub fn with_clock(clock: SimulatedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Handle to the store's clock, for advancing time in tests
    pub fn clock(&self) -> SimulatedClock {
        self.clock.clone()
    }

    /// Number of live (unexpired) keys
    pub async fn live_key_count(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.values().filter(|v| v.expires_at > now).count()
    }

    fn is_live(value: &StoredValue, now: Duration) -> bool {
        value.expires_at > now
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(value) if Self::is_live(value, now) => Ok(Some(value.bytes.clone())),
            Some(_) => {
                // Lazy expiry
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(value) => Ok(Self::is_live(&value, now)),
            None => Ok(false),
        }
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(key) {
            if Self::is_live(existing, now) {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: token.clone().into_bytes(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(existing) if Self::is_live(existing, now) && existing.bytes == token.as_bytes() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = InMemoryStore::new();
        store
            .put("k1", b"hello".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        let value = store.get("k1").await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_via_clock_advance() {
        let store = InMemoryStore::new();
        store
            .put("k1", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();

        store.clock().advance(Duration::from_secs(6));
        assert!(store.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_resets_ttl() {
        let store = InMemoryStore::new();
        store
            .put("k1", b"old".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        store.clock().advance(Duration::from_secs(4));
        store
            .put("k1", b"new".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        store.clock().advance(Duration::from_secs(4));

        assert_eq!(store.get("k1").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_try_lock_is_exclusive() {
        let store = InMemoryStore::new();
        let token = store
            .try_lock("mutex", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(token.is_some());

        let second = store
            .try_lock("mutex", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_token() {
        let store = InMemoryStore::new();
        let token = store
            .try_lock("mutex", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!store.unlock("mutex", "wrong-token").await.unwrap());
        assert!(store.unlock("mutex", &token).await.unwrap());
        // Already released
        assert!(!store.unlock("mutex", &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_retaken() {
        let store = InMemoryStore::new();
        let first = store
            .try_lock("mutex", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        store.clock().advance(Duration::from_secs(11));

        let second = store
            .try_lock("mutex", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.is_some());
        assert_ne!(second.unwrap(), first);

        // The crashed holder's stale token cannot release the new mutex
        assert!(!store.unlock("mutex", &first).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_liveness() {
        let store = InMemoryStore::new();
        store
            .put("k1", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());

        store
            .put("k2", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        store.clock().advance(Duration::from_secs(6));
        assert!(!store.delete("k2").await.unwrap());
    }
}
