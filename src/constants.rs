//! # System Constants
//!
//! Operational boundaries and reserved key prefixes for the coordination
//! primitives. Internal store keys are namespaced under `forrst:` so
//! application lock keys can never collide with runtime metadata.

/// Reserved store-key namespaces. Application-supplied lock keys must not
/// start with any of these.
pub mod key_prefixes {
    /// Mutex keys backing application-level locks
    pub const LOCK_MUTEX: &str = "forrst:lock:";
    /// Lock metadata records (owner, expiry, fencing token)
    pub const LOCK_METADATA: &str = "forrst:lock:meta:";
    /// Cached response snapshots
    pub const CACHE: &str = "forrst:cache:";
    /// Cancellation token records
    pub const CANCELLATION: &str = "forrst:cancel:";
    /// Short-lived guard keys for cancellation check-and-set
    pub const CANCELLATION_GUARD: &str = "forrst:cancel:guard:";

    /// The root namespace all internal keys live under
    pub const RESERVED_ROOT: &str = "forrst:";
}

/// Default configuration values, overridable via environment (see `config`)
pub mod defaults {
    /// Maximum TTL accepted for an application lock (1 hour)
    pub const MAX_LOCK_TTL_SECONDS: u64 = 3600;
    /// Maximum TTL accepted for a cache entry (24 hours)
    pub const MAX_CACHE_TTL_SECONDS: u64 = 24 * 3600;
    /// Maximum serialized size of a cached response (1MB)
    pub const MAX_CACHE_ENTRY_BYTES: usize = 1024 * 1024;
    /// Maximum length of an application lock key
    pub const LOCK_KEY_MAX_LENGTH: usize = 256;
    /// Maximum length of a cancellation token
    pub const CANCELLATION_TOKEN_MAX_LENGTH: usize = 128;
    /// Poll interval while blocking on lock acquisition
    pub const LOCK_RETRY_INTERVAL_MS: u64 = 50;
    /// Buffer added to lock metadata TTL so metadata never expires before
    /// the mutex it describes
    pub const LOCK_METADATA_SKEW_SECONDS: u64 = 5;
    /// TTL for the guard key taken around cancellation check-and-set
    pub const CANCELLATION_GUARD_TTL_SECONDS: u64 = 5;
    /// Default TTL for a registered cancellation token (15 minutes)
    pub const CANCELLATION_TOKEN_TTL_SECONDS: u64 = 900;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_prefixes_share_root() {
        assert!(key_prefixes::LOCK_MUTEX.starts_with(key_prefixes::RESERVED_ROOT));
        assert!(key_prefixes::LOCK_METADATA.starts_with(key_prefixes::RESERVED_ROOT));
        assert!(key_prefixes::CACHE.starts_with(key_prefixes::RESERVED_ROOT));
        assert!(key_prefixes::CANCELLATION.starts_with(key_prefixes::RESERVED_ROOT));
    }

    #[test]
    fn test_metadata_prefix_distinct_from_mutex() {
        // A mutex key and its metadata key must never collide for the same
        // application key.
        let app_key = "orders:42";
        let mutex = format!("{}{app_key}", key_prefixes::LOCK_MUTEX);
        let meta = format!("{}{app_key}", key_prefixes::LOCK_METADATA);
        assert_ne!(mutex, meta);
    }
}
