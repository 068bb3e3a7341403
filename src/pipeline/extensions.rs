//! Built-in extensions wiring the coordination primitives into the
//! request lifecycle.
//!
//! Dispatch order in each phase: cache (10) first so a fresh hit
//! short-circuits before any token or lock is taken, then cancellation
//! (20), then locking (30).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{self, CacheValidator};
use crate::cancellation::CancellationCoordinator;
use crate::config::ForrstConfig;
use crate::constants::defaults;
use crate::error::Result;
use crate::lock::LockManager;
use crate::pipeline::{
    Extension, FunctionRequest, FunctionResponse, PhaseResult, RequestContext,
};
use crate::validation::{validate_cancellation_token, validate_lock_key, validate_ttl};

/// Serves and stores conditional cached responses
pub struct CacheExtension {
    validator: Arc<CacheValidator>,
    config: ForrstConfig,
}

impl CacheExtension {
    pub fn new(validator: Arc<CacheValidator>, config: ForrstConfig) -> Self {
        Self { validator, config }
    }
}

#[async_trait]
impl Extension for CacheExtension {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn on_pre_validate(
        &self,
        request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        if let Some(directive) = &request.coordination.cache {
            validate_ttl(directive.ttl_seconds, self.config.max_cache_ttl_seconds)?;
        }
        Ok(PhaseResult::Continue)
    }

    async fn on_pre_execute(
        &self,
        request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        let Some(directive) = &request.coordination.cache else {
            return Ok(PhaseResult::Continue);
        };

        let key = cache::cache_key(
            &request.function,
            request.version.as_deref(),
            &request.arguments,
        );
        ctx.cache_key = Some(key.clone());

        let Some(entry) = self.validator.fetch(&key).await? else {
            return Ok(PhaseResult::Continue);
        };

        let client_has_validator =
            directive.client_etag.is_some() || directive.client_last_modified.is_some();
        let client_copy_valid = cache::is_valid(
            directive.client_etag.as_deref(),
            directive.client_last_modified,
            &entry.etag,
            Some(entry.stored_at),
        );

        let response = if client_has_validator && client_copy_valid {
            // The client already holds the current representation
            let mut response = FunctionResponse::success(&request.request_id, serde_json::Value::Null);
            response.result = None;
            response.annotations.insert("cache".to_string(), json!({
                "etag": entry.etag,
                "last_modified": entry.stored_at.to_rfc3339(),
                "not_modified": true,
            }));
            response
        } else {
            let mut response =
                FunctionResponse::success(&request.request_id, entry.response.clone());
            response.annotations.insert("cache".to_string(), json!({
                "etag": entry.etag,
                "last_modified": entry.stored_at.to_rfc3339(),
                "hit": true,
            }));
            response
        };

        Ok(PhaseResult::Stop(response))
    }

    async fn on_post_execute(
        &self,
        request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        let Some(directive) = &request.coordination.cache else {
            return Ok(PhaseResult::Continue);
        };
        let (Some(key), Some(result)) = (ctx.cache_key.clone(), ctx.result.clone()) else {
            return Ok(PhaseResult::Continue);
        };

        self.validator
            .store(&key, &result, directive.ttl_seconds)
            .await?;

        ctx.annotate(
            "cache",
            json!({
                "etag": cache::etag(&result),
                "last_modified": chrono::Utc::now().to_rfc3339(),
            }),
        );
        Ok(PhaseResult::Continue)
    }
}

/// Registers and finalizes single-use cancellation tokens
pub struct CancellationExtension {
    coordinator: Arc<CancellationCoordinator>,
    config: ForrstConfig,
}

impl CancellationExtension {
    pub fn new(coordinator: Arc<CancellationCoordinator>, config: ForrstConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }
}

#[async_trait]
impl Extension for CancellationExtension {
    fn name(&self) -> &'static str {
        "cancellation"
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn on_pre_validate(
        &self,
        request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        if let Some(directive) = &request.coordination.cancellation {
            validate_cancellation_token(
                &directive.token,
                self.config.cancellation_token_max_length,
            )?;
        }
        Ok(PhaseResult::Continue)
    }

    async fn on_pre_execute(
        &self,
        request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        let Some(directive) = &request.coordination.cancellation else {
            return Ok(PhaseResult::Continue);
        };

        let ttl = directive
            .ttl_seconds
            .unwrap_or(defaults::CANCELLATION_TOKEN_TTL_SECONDS);
        self.coordinator
            .register(&directive.token, &request.request_id, ttl)
            .await?;
        ctx.cancellation_token = Some(directive.token.clone());

        ctx.annotate(
            "cancellation",
            json!({
                "token": directive.token,
                "status": "active",
            }),
        );
        Ok(PhaseResult::Continue)
    }

    async fn on_post_execute(
        &self,
        _request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        if let Some(token) = ctx.cancellation_token.take() {
            self.coordinator.cleanup(&token).await;
            ctx.annotate_field("cancellation", "status", json!("done"));
        }
        Ok(PhaseResult::Continue)
    }

    async fn cleanup(&self, ctx: &mut RequestContext) {
        // Post-execution may have been skipped by an abort or a
        // short-circuit; the token must never be orphaned.
        if let Some(token) = ctx.cancellation_token.take() {
            self.coordinator.cleanup(&token).await;
            ctx.annotate_field("cancellation", "status", json!("done"));
        }
    }
}

/// Acquires and releases named application locks around execution
pub struct LockExtension {
    manager: Arc<LockManager>,
    config: ForrstConfig,
}

impl LockExtension {
    pub fn new(manager: Arc<LockManager>, config: ForrstConfig) -> Self {
        Self { manager, config }
    }

    fn scope_of(request: &FunctionRequest) -> String {
        request
            .coordination
            .lock
            .as_ref()
            .and_then(|d| d.scope.clone())
            .unwrap_or_else(|| "global".to_string())
    }
}

#[async_trait]
impl Extension for LockExtension {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn priority(&self) -> u32 {
        30
    }

    async fn on_pre_validate(
        &self,
        request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        if let Some(directive) = &request.coordination.lock {
            validate_lock_key(&directive.key, self.config.lock_key_max_length)?;
            validate_ttl(directive.ttl_seconds, self.config.max_lock_ttl_seconds)?;
        }
        Ok(PhaseResult::Continue)
    }

    async fn on_pre_execute(
        &self,
        request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        let Some(directive) = &request.coordination.lock else {
            return Ok(PhaseResult::Continue);
        };

        let block_timeout = directive.block_timeout_ms.map(Duration::from_millis);
        let handle = self
            .manager
            .acquire(
                &directive.key,
                &request.request_id,
                directive.ttl_seconds,
                block_timeout,
            )
            .await?;

        ctx.annotate(
            "lock",
            json!({
                "key": handle.key,
                "acquired": true,
                "owner": handle.owner,
                "scope": Self::scope_of(request),
                "expires_at": handle.expires_at.to_rfc3339(),
                "auto_released": false,
            }),
        );
        ctx.lock_handle = Some(handle);
        Ok(PhaseResult::Continue)
    }

    async fn on_post_execute(
        &self,
        _request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        if let Some(handle) = ctx.lock_handle.take() {
            self.manager.release_handle(&handle).await;
        }
        Ok(PhaseResult::Continue)
    }

    async fn cleanup(&self, ctx: &mut RequestContext) {
        // Reached with a live handle only when post-execution never ran;
        // release unconditionally so an aborted request cannot strand the
        // lock until TTL.
        if let Some(handle) = ctx.lock_handle.take() {
            self.manager.release_handle(&handle).await;
            ctx.annotate_field("lock", "auto_released", json!(true));
        }
    }
}

/// Build a pipeline with the three built-in extensions over one store
pub fn standard_pipeline(
    store: Arc<dyn crate::store::CoordinationStore>,
    config: ForrstConfig,
) -> crate::pipeline::ExtensionPipeline {
    let mut pipeline = crate::pipeline::ExtensionPipeline::new();
    pipeline.register(Arc::new(CacheExtension::new(
        Arc::new(CacheValidator::new(store.clone(), config.clone())),
        config.clone(),
    )));
    pipeline.register(Arc::new(CancellationExtension::new(
        Arc::new(CancellationCoordinator::new(store.clone(), config.clone())),
        config.clone(),
    )));
    pipeline.register(Arc::new(LockExtension::new(
        Arc::new(LockManager::new(store, config.clone())),
        config,
    )));
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForrstError;
    use crate::pipeline::{
        CacheDirective, CancellationDirective, CoordinationDirectives, LockDirective,
    };
    use crate::store::{CoordinationStore, InMemoryStore};

    fn request_with(coordination: CoordinationDirectives) -> FunctionRequest {
        FunctionRequest {
            request_id: "req-1".to_string(),
            function: "orders.get".to_string(),
            version: Some("1".to_string()),
            arguments: json!({"id": 42}),
            coordination,
        }
    }

    #[tokio::test]
    async fn test_lock_extension_annotates_and_releases() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store.clone(), ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            lock: Some(LockDirective {
                key: "orders:42".to_string(),
                ttl_seconds: 30,
                block_timeout_ms: None,
                scope: Some("orders".to_string()),
            }),
            ..CoordinationDirectives::default()
        });

        let response = pipeline
            .execute(&request, |_req, _probe| async { Ok(json!({"ok": true})) })
            .await;

        assert!(!response.is_error());
        let lock = response.annotations.get("lock").unwrap();
        assert_eq!(lock["key"], json!("orders:42"));
        assert_eq!(lock["acquired"], json!(true));
        assert_eq!(lock["owner"], json!("req-1"));
        assert_eq!(lock["scope"], json!("orders"));
        assert_eq!(lock["auto_released"], json!(false));

        // Lock fully released after the request
        assert!(store.get("forrst:lock:orders:42").await.unwrap().is_none());
        assert!(store
            .get("forrst:lock:meta:orders:42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lock_auto_released_when_body_fails() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store.clone(), ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            lock: Some(LockDirective {
                key: "orders:42".to_string(),
                ttl_seconds: 30,
                block_timeout_ms: None,
                scope: None,
            }),
            ..CoordinationDirectives::default()
        });

        let response = pipeline
            .execute(&request, |_req, _probe| async {
                Err(ForrstError::invalid_input("body exploded"))
            })
            .await;

        assert!(response.is_error());
        let lock = response.annotations.get("lock").unwrap();
        assert_eq!(lock["auto_released"], json!(true));
        assert!(store.get("forrst:lock:orders:42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contended_lock_surfaces_retryable_error() {
        let store = Arc::new(InMemoryStore::new());
        let config = ForrstConfig::default();
        let manager = LockManager::new(store.clone(), config.clone());
        manager.acquire("orders:42", "other", 30, None).await.unwrap();

        let pipeline = standard_pipeline(store, config);
        let request = request_with(CoordinationDirectives {
            lock: Some(LockDirective {
                key: "orders:42".to_string(),
                ttl_seconds: 30,
                block_timeout_ms: None,
                scope: None,
            }),
            ..CoordinationDirectives::default()
        });

        let response = pipeline
            .execute(&request, |_req, _probe| async { Ok(json!(null)) })
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, "LOCK_ACQUISITION_FAILED");
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_cache_extension_stores_then_replays() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store, ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            cache: Some(CacheDirective {
                ttl_seconds: 60,
                client_etag: None,
                client_last_modified: None,
            }),
            ..CoordinationDirectives::default()
        });

        let first = pipeline
            .execute(&request, |_req, _probe| async {
                Ok(json!({"order": 42, "status": "shipped"}))
            })
            .await;
        assert!(!first.is_error());
        let cache_note = first.annotations.get("cache").unwrap();
        let etag = cache_note["etag"].as_str().unwrap().to_string();
        assert_eq!(etag.len(), 64);

        // Second call replays without executing the body
        let second = pipeline
            .execute(&request, |_req, _probe| async {
                panic!("body must not run on cache hit")
            })
            .await;
        assert_eq!(second.result, Some(json!({"order": 42, "status": "shipped"})));
        let replay_note = second.annotations.get("cache").unwrap();
        assert_eq!(replay_note["hit"], json!(true));
        assert_eq!(replay_note["etag"], json!(etag));
    }

    #[tokio::test]
    async fn test_cache_extension_not_modified_for_matching_client_etag() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store, ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            cache: Some(CacheDirective {
                ttl_seconds: 60,
                client_etag: None,
                client_last_modified: None,
            }),
            ..CoordinationDirectives::default()
        });

        let first = pipeline
            .execute(&request, |_req, _probe| async { Ok(json!({"n": 1})) })
            .await;
        let etag = first.annotations.get("cache").unwrap()["etag"]
            .as_str()
            .unwrap()
            .to_string();

        let conditional = request_with(CoordinationDirectives {
            cache: Some(CacheDirective {
                ttl_seconds: 60,
                client_etag: Some(etag.clone()),
                client_last_modified: None,
            }),
            ..CoordinationDirectives::default()
        });

        let response = pipeline
            .execute(&conditional, |_req, _probe| async {
                panic!("body must not run")
            })
            .await;

        assert!(response.result.is_none());
        let note = response.annotations.get("cache").unwrap();
        assert_eq!(note["not_modified"], json!(true));
        assert_eq!(note["etag"], json!(etag));
    }

    #[tokio::test]
    async fn test_cache_expiry_reexecutes_body() {
        let store = Arc::new(InMemoryStore::new());
        let clock = store.clock();
        let pipeline = standard_pipeline(store, ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            cache: Some(CacheDirective {
                ttl_seconds: 5,
                client_etag: None,
                client_last_modified: None,
            }),
            ..CoordinationDirectives::default()
        });

        pipeline
            .execute(&request, |_req, _probe| async { Ok(json!({"v": 1})) })
            .await;

        clock.advance(Duration::from_secs(6));

        let after_expiry = pipeline
            .execute(&request, |_req, _probe| async { Ok(json!({"v": 2})) })
            .await;
        assert_eq!(after_expiry.result, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_cancellation_extension_acknowledges_and_cleans_up() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store.clone(), ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            cancellation: Some(CancellationDirective {
                token: "tok-1".to_string(),
                ttl_seconds: None,
            }),
            ..CoordinationDirectives::default()
        });

        let response = pipeline
            .execute(&request, |_req, probe| async move {
                assert_eq!(probe.token(), Some("tok-1"));
                Ok(json!(null))
            })
            .await;

        assert!(!response.is_error());
        let note = response.annotations.get("cancellation").unwrap();
        assert_eq!(note["token"], json!("tok-1"));
        assert_eq!(note["status"], json!("done"));

        // Token removed from the store
        assert!(store.get("forrst:cancel:tok-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_mid_flight_aborts_request() {
        let store = Arc::new(InMemoryStore::new());
        let config = ForrstConfig::default();
        let coordinator = Arc::new(CancellationCoordinator::new(store.clone(), config.clone()));
        let pipeline = standard_pipeline(store.clone(), config);

        let request = request_with(CoordinationDirectives {
            cancellation: Some(CancellationDirective {
                token: "tok-1".to_string(),
                ttl_seconds: None,
            }),
            ..CoordinationDirectives::default()
        });

        let poller = coordinator.clone();
        let response = pipeline
            .execute(&request, move |_req, probe| async move {
                let token = probe.token().unwrap().to_string();
                // A concurrent client cancels while the body is running
                poller.cancel(&token, None).await?;
                poller.check_cancellation(&token).await?;
                Ok(json!("unreachable"))
            })
            .await;

        assert!(response.is_error());
        assert_eq!(response.error.unwrap().code, "CANCELLED");
        // Cleanup still removed the token
        assert!(store.get("forrst:cancel:tok-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_three_extensions_compose() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = standard_pipeline(store.clone(), ForrstConfig::default());

        let request = request_with(CoordinationDirectives {
            lock: Some(LockDirective {
                key: "orders:42".to_string(),
                ttl_seconds: 30,
                block_timeout_ms: None,
                scope: None,
            }),
            cache: Some(CacheDirective {
                ttl_seconds: 60,
                client_etag: None,
                client_last_modified: None,
            }),
            cancellation: Some(CancellationDirective {
                token: "tok-1".to_string(),
                ttl_seconds: None,
            }),
        });

        let response = pipeline
            .execute(&request, |_req, _probe| async { Ok(json!({"done": true})) })
            .await;

        assert!(!response.is_error());
        assert!(response.annotations.contains_key("lock"));
        assert!(response.annotations.contains_key("cache"));
        assert!(response.annotations.contains_key("cancellation"));

        // No coordination state left behind
        assert_eq!(store.live_key_count().await, 1); // only the cache entry
    }
}
