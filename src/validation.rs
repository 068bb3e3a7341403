//! Input validation for coordination primitives.
//!
//! All validation happens synchronously, before any store round-trip, so a
//! malformed key or out-of-bounds TTL never reaches the coordination store.

use crate::constants::key_prefixes;
use crate::error::{ForrstError, Result};

/// Characters permitted in application lock keys and cancellation tokens
fn is_allowed_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-')
}

/// Validates an application-level lock key.
///
/// Rejects empty keys, keys over `max_length`, keys containing characters
/// outside `[A-Za-z0-9:_.-]`, and keys under the reserved `forrst:`
/// namespace (which would collide with internal metadata keys).
pub fn validate_lock_key(key: &str, max_length: usize) -> Result<()> {
    if key.is_empty() {
        return Err(ForrstError::invalid_input("Lock key must not be empty"));
    }

    if key.len() > max_length {
        return Err(ForrstError::invalid_input(format!(
            "Lock key too long: {} chars (max: {max_length})",
            key.len()
        )));
    }

    if let Some(bad) = key.chars().find(|c| !is_allowed_key_char(*c)) {
        return Err(ForrstError::invalid_input(format!(
            "Lock key contains disallowed character: {bad:?}"
        )));
    }

    if key.starts_with(key_prefixes::RESERVED_ROOT) {
        return Err(ForrstError::invalid_input(format!(
            "Lock key must not use the reserved '{}' namespace",
            key_prefixes::RESERVED_ROOT
        )));
    }

    Ok(())
}

/// Validates a TTL in seconds against an inclusive upper bound
pub fn validate_ttl(ttl_seconds: u64, max_ttl_seconds: u64) -> Result<()> {
    if ttl_seconds == 0 {
        return Err(ForrstError::invalid_input(
            "TTL must be greater than zero seconds",
        ));
    }

    if ttl_seconds > max_ttl_seconds {
        return Err(ForrstError::invalid_input(format!(
            "TTL too large: {ttl_seconds}s (max: {max_ttl_seconds}s)"
        )));
    }

    Ok(())
}

/// Validates a cancellation token's format and length.
///
/// Tokens are flat identifiers: no `:` (it delimits internal key
/// namespaces, and a token like `guard:x` would collide with the
/// coordinator's guard keyspace).
pub fn validate_cancellation_token(token: &str, max_length: usize) -> Result<()> {
    if token.is_empty() {
        return Err(ForrstError::invalid_input(
            "Cancellation token must not be empty",
        ));
    }

    if token.len() > max_length {
        return Err(ForrstError::invalid_input(format!(
            "Cancellation token too long: {} chars (max: {max_length})",
            token.len()
        )));
    }

    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(ForrstError::invalid_input(format!(
            "Cancellation token contains disallowed character: {bad:?}"
        )));
    }

    Ok(())
}

/// Validates an owner identifier (lock holder or token issuer)
pub fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(ForrstError::invalid_input(
            "Owner identifier must not be empty",
        ));
    }

    if owner.len() > 256 {
        return Err(ForrstError::invalid_input(format!(
            "Owner identifier too long: {} chars (max: 256)",
            owner.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_lock_keys() {
        assert!(validate_lock_key("orders:42", 256).is_ok());
        assert!(validate_lock_key("inventory.warehouse-7_a", 256).is_ok());
        assert!(validate_lock_key("a", 256).is_ok());
    }

    #[test]
    fn test_rejects_empty_and_long_keys() {
        assert!(validate_lock_key("", 256).is_err());
        let long_key = "k".repeat(257);
        assert!(validate_lock_key(&long_key, 256).is_err());
        // Exactly at the limit is fine
        let max_key = "k".repeat(256);
        assert!(validate_lock_key(&max_key, 256).is_ok());
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert!(validate_lock_key("orders 42", 256).is_err());
        assert!(validate_lock_key("orders/42", 256).is_err());
        assert!(validate_lock_key("orders\n42", 256).is_err());
        assert!(validate_lock_key("ordérs", 256).is_err());
    }

    #[test]
    fn test_rejects_reserved_prefix() {
        assert!(validate_lock_key("forrst:lock:sneaky", 256).is_err());
        assert!(validate_lock_key("forrst:anything", 256).is_err());
        // A key merely containing the word is fine
        assert!(validate_lock_key("my-forrst:key", 256).is_ok());
    }

    #[test]
    fn test_ttl_bounds() {
        assert!(validate_ttl(1, 3600).is_ok());
        assert!(validate_ttl(3600, 3600).is_ok());
        assert!(validate_ttl(0, 3600).is_err());
        assert!(validate_ttl(3601, 3600).is_err());
    }

    #[test]
    fn test_cancellation_token_format() {
        assert!(validate_cancellation_token("tok-1", 128).is_ok());
        assert!(validate_cancellation_token("", 128).is_err());
        assert!(validate_cancellation_token(&"t".repeat(129), 128).is_err());
        assert!(validate_cancellation_token("tok 1", 128).is_err());
        // Colons delimit internal namespaces and are not valid in tokens
        assert!(validate_cancellation_token("guard:tok-1", 128).is_err());
    }

    #[test]
    fn test_owner_format() {
        assert!(validate_owner("req-1").is_ok());
        assert!(validate_owner("").is_err());
        assert!(validate_owner(&"o".repeat(257)).is_err());
    }
}
