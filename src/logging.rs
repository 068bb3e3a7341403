//! # Structured Logging Module
//!
//! Environment-aware structured logging for the extension runtime, plus the
//! audit helpers used by administrative lock operations and best-effort
//! cleanup paths.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(EnvFilter::new(log_level)),
        );

        // Use try_init to avoid panic if a global subscriber already exists
        // (embedding servers typically install their own).
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            environment = %environment,
            "Structured logging initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("FORRST_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Audit log for administrative lock operations (force-release)
pub fn log_lock_audit(operation: &str, key: &str, owner: Option<&str>, outcome: &str) {
    tracing::warn!(
        operation = %operation,
        key = %key,
        owner = owner,
        outcome = %outcome,
        timestamp = %Utc::now().to_rfc3339(),
        "LOCK_AUDIT"
    );
}

/// Log a best-effort cleanup failure that must not fail the request
pub fn log_cleanup_failure(component: &str, subject: &str, error: &str) {
    tracing::warn!(
        component = %component,
        subject = %subject,
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "CLEANUP_FAILURE"
    );
}
