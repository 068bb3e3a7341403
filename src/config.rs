//! Runtime configuration for the coordination primitives.
//!
//! Recognized environment variables mirror the option names the Forrst
//! server documents: `MAX_LOCK_TTL_SECONDS`, `MAX_CACHE_TTL_SECONDS`,
//! `MAX_CACHE_ENTRY_BYTES`, `LOCK_KEY_MAX_LENGTH`,
//! `CANCELLATION_TOKEN_MAX_LENGTH`, plus the operational knobs
//! `LOCK_RETRY_INTERVAL_MS` and `LOCK_METADATA_SKEW_SECONDS`.

use crate::constants::defaults;
use crate::error::{ForrstError, Result};

#[derive(Debug, Clone)]
pub struct ForrstConfig {
    pub max_lock_ttl_seconds: u64,
    pub max_cache_ttl_seconds: u64,
    pub max_cache_entry_bytes: usize,
    pub lock_key_max_length: usize,
    pub cancellation_token_max_length: usize,
    pub lock_retry_interval_ms: u64,
    pub lock_metadata_skew_seconds: u64,
}

impl Default for ForrstConfig {
    fn default() -> Self {
        Self {
            max_lock_ttl_seconds: defaults::MAX_LOCK_TTL_SECONDS,
            max_cache_ttl_seconds: defaults::MAX_CACHE_TTL_SECONDS,
            max_cache_entry_bytes: defaults::MAX_CACHE_ENTRY_BYTES,
            lock_key_max_length: defaults::LOCK_KEY_MAX_LENGTH,
            cancellation_token_max_length: defaults::CANCELLATION_TOKEN_MAX_LENGTH,
            lock_retry_interval_ms: defaults::LOCK_RETRY_INTERVAL_MS,
            lock_metadata_skew_seconds: defaults::LOCK_METADATA_SKEW_SECONDS,
        }
    }
}

impl ForrstConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("MAX_LOCK_TTL_SECONDS") {
            config.max_lock_ttl_seconds = parse_env("MAX_LOCK_TTL_SECONDS", &value)?;
        }

        if let Ok(value) = std::env::var("MAX_CACHE_TTL_SECONDS") {
            config.max_cache_ttl_seconds = parse_env("MAX_CACHE_TTL_SECONDS", &value)?;
        }

        if let Ok(value) = std::env::var("MAX_CACHE_ENTRY_BYTES") {
            config.max_cache_entry_bytes = parse_env("MAX_CACHE_ENTRY_BYTES", &value)?;
        }

        if let Ok(value) = std::env::var("LOCK_KEY_MAX_LENGTH") {
            config.lock_key_max_length = parse_env("LOCK_KEY_MAX_LENGTH", &value)?;
        }

        if let Ok(value) = std::env::var("CANCELLATION_TOKEN_MAX_LENGTH") {
            config.cancellation_token_max_length =
                parse_env("CANCELLATION_TOKEN_MAX_LENGTH", &value)?;
        }

        if let Ok(value) = std::env::var("LOCK_RETRY_INTERVAL_MS") {
            config.lock_retry_interval_ms = parse_env("LOCK_RETRY_INTERVAL_MS", &value)?;
        }

        if let Ok(value) = std::env::var("LOCK_METADATA_SKEW_SECONDS") {
            config.lock_metadata_skew_seconds = parse_env("LOCK_METADATA_SKEW_SECONDS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the primitives inoperable
    pub fn validate(&self) -> Result<()> {
        if self.max_lock_ttl_seconds == 0 {
            return Err(ForrstError::configuration(
                "MAX_LOCK_TTL_SECONDS must be greater than zero",
            ));
        }
        if self.max_cache_ttl_seconds == 0 {
            return Err(ForrstError::configuration(
                "MAX_CACHE_TTL_SECONDS must be greater than zero",
            ));
        }
        if self.lock_key_max_length == 0 {
            return Err(ForrstError::configuration(
                "LOCK_KEY_MAX_LENGTH must be greater than zero",
            ));
        }
        if self.cancellation_token_max_length == 0 {
            return Err(ForrstError::configuration(
                "CANCELLATION_TOKEN_MAX_LENGTH must be greater than zero",
            ));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(ForrstError::configuration(
                "LOCK_RETRY_INTERVAL_MS must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ForrstError::configuration(format!("Invalid {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForrstConfig::default();
        assert_eq!(config.max_lock_ttl_seconds, 3600);
        assert_eq!(config.max_cache_entry_bytes, 1024 * 1024);
        assert_eq!(config.lock_key_max_length, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = ForrstConfig {
            max_lock_ttl_seconds: 0,
            ..ForrstConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ForrstError::Configuration { .. })
        ));
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        let result: Result<u64> = parse_env("MAX_LOCK_TTL_SECONDS", "not-a-number");
        assert!(matches!(result, Err(ForrstError::Configuration { .. })));
    }
}
